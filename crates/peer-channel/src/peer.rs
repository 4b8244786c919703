//! A single direct connection to a remote endpoint.
//!
//! `Peer` runs perfect negotiation over an [`RtcConnection`]. Negotiation
//! messages travel over an out-of-band relay until the bootstrap channel
//! opens, after which the peer signals in-band and detaches the relay. All
//! negotiation state lives in one actor task; everything else (connection
//! events, channel state changes, bootstrap traffic, relay deliveries) is
//! forwarded into its input queue.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelState, DataChannel};
use crate::chunk::ChunkedTransport;
use crate::config::{BOOTSTRAP_CHANNEL_ID, ChunkConfig, DATA_CHANNEL_ID, PeerConfig};
use crate::error::TransportError;
use crate::rtc::{RtcConnection, RtcEvent, SignalingState};
use crate::signal::{IceCandidate, SessionDescription, SignalEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Negotiating over the out-of-band relay.
    NegotiatingBootstrap,
    /// Bootstrap channel open; signaling in-band while the data channel opens.
    NegotiatingInband,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub local_role: String,
    pub remote_peer_id: String,
    pub is_initiator: bool,
}

impl PeerOptions {
    pub fn polite(&self) -> bool {
        !self.is_initiator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Bootstrap,
    Data,
}

enum PeerInput {
    Rtc(RtcEvent),
    Relay(SignalEnvelope),
    InBand(Bytes),
    Channel(ChannelKind, ChannelState),
    Close,
}

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    options: PeerOptions,
    bootstrap: Arc<dyn DataChannel>,
    data: Arc<dyn DataChannel>,
    state: watch::Receiver<PeerState>,
    input: mpsc::UnboundedSender<PeerInput>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<SignalEnvelope>>>,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        let _ = self.input.send(PeerInput::Close);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote_peer_id", &self.inner.options.remote_peer_id)
            .field("is_initiator", &self.inner.options.is_initiator)
            .field("state", &self.state())
            .finish()
    }
}

impl Peer {
    /// Creates both negotiated channels on `conn` and starts negotiating.
    pub async fn new(
        conn: Arc<dyn RtcConnection>,
        options: PeerOptions,
        config: &PeerConfig,
    ) -> Result<Self, TransportError> {
        let mut events = conn
            .take_events()
            .ok_or_else(|| TransportError::Setup("connection events already taken".into()))?;
        let bootstrap = conn
            .create_channel(&config.bootstrap_label, BOOTSTRAP_CHANNEL_ID)
            .await?;
        let data = conn
            .create_channel(&config.data_label, DATA_CHANNEL_ID)
            .await?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PeerState::NegotiatingBootstrap);

        let mut forwarders = Vec::with_capacity(4);
        let tx = input_tx.clone();
        forwarders.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(PeerInput::Rtc(event)).is_err() {
                    break;
                }
            }
        }));
        let tx = input_tx.clone();
        let mut inband = bootstrap.subscribe();
        forwarders.push(tokio::spawn(async move {
            while let Some(message) = inband.recv().await {
                if tx.send(PeerInput::InBand(message)).is_err() {
                    break;
                }
            }
        }));
        forwarders.push(forward_channel_state(
            ChannelKind::Bootstrap,
            bootstrap.watch_state(),
            input_tx.clone(),
        ));
        forwarders.push(forward_channel_state(
            ChannelKind::Data,
            data.watch_state(),
            input_tx.clone(),
        ));

        debug!(
            target = "peer_channel::peer",
            remote = %options.remote_peer_id,
            role = %options.local_role,
            polite = options.polite(),
            "peer created"
        );

        let actor = PeerActor {
            remote: options.remote_peer_id.clone(),
            polite: options.polite(),
            conn,
            bootstrap: Arc::clone(&bootstrap),
            data: Arc::clone(&data),
            route: SignalRoute::Relay(relay_tx),
            ignore_offer: false,
            has_remote_description: false,
            pending_candidates: VecDeque::new(),
            bootstrap_open: false,
            data_open: false,
            state: state_tx,
            forwarders,
        };
        tokio::spawn(actor.run(input_rx));

        Ok(Self {
            inner: Arc::new(PeerInner {
                options,
                bootstrap,
                data,
                state: state_rx,
                input: input_tx,
                outbound: Mutex::new(Some(relay_rx)),
            }),
        })
    }

    /// Envelopes to forward over the out-of-band relay. The stream ends once
    /// the peer switches to in-band signaling or closes. Only the first
    /// caller gets the receiver.
    pub fn take_outbound_signals(&self) -> Option<mpsc::UnboundedReceiver<SignalEnvelope>> {
        self.inner.outbound.lock().take()
    }

    /// Hands an envelope received over the relay to the negotiation actor.
    pub fn deliver_signal(&self, envelope: SignalEnvelope) {
        let _ = self.inner.input.send(PeerInput::Relay(envelope));
    }

    pub fn options(&self) -> &PeerOptions {
        &self.inner.options
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.inner.options.remote_peer_id
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.options.is_initiator
    }

    pub fn polite(&self) -> bool {
        self.inner.options.polite()
    }

    pub fn state(&self) -> PeerState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PeerState> {
        self.inner.state.clone()
    }

    /// Resolves once both channels are open, or fails if the peer closes
    /// first.
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut state = self.watch_state();
        loop {
            match *state.borrow_and_update() {
                PeerState::Ready => return Ok(()),
                PeerState::Closed => return Err(TransportError::PeerClosed),
                _ => {}
            }
            if state.changed().await.is_err() {
                return match *state.borrow() {
                    PeerState::Ready => Ok(()),
                    _ => Err(TransportError::PeerClosed),
                };
            }
        }
    }

    /// Resolves once the peer has been torn down.
    pub async fn closed(&self) {
        let mut state = self.watch_state();
        while *state.borrow_and_update() != PeerState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn data_channel(&self) -> Arc<dyn DataChannel> {
        Arc::clone(&self.inner.data)
    }

    pub fn bootstrap_channel(&self) -> Arc<dyn DataChannel> {
        Arc::clone(&self.inner.bootstrap)
    }

    /// Wraps the data channel in a chunking transport.
    pub fn open_transport(&self, config: ChunkConfig) -> ChunkedTransport {
        ChunkedTransport::new(self.data_channel(), config)
    }

    /// Tears the peer down. Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.inner.input.send(PeerInput::Close);
        self.closed().await;
    }
}

fn forward_channel_state(
    kind: ChannelKind,
    mut state: watch::Receiver<ChannelState>,
    tx: mpsc::UnboundedSender<PeerInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            if current != ChannelState::Connecting
                && tx.send(PeerInput::Channel(kind, current)).is_err()
            {
                return;
            }
            if current.is_terminal() {
                return;
            }
            if state.changed().await.is_err() {
                let _ = tx.send(PeerInput::Channel(kind, ChannelState::Closed));
                return;
            }
        }
    })
}

/// Where outbound envelopes go. Moves from `Relay` to `InBand` exactly once,
/// when the bootstrap channel opens.
enum SignalRoute {
    Relay(mpsc::UnboundedSender<SignalEnvelope>),
    InBand,
}

struct PeerActor {
    remote: String,
    polite: bool,
    conn: Arc<dyn RtcConnection>,
    bootstrap: Arc<dyn DataChannel>,
    data: Arc<dyn DataChannel>,
    route: SignalRoute,
    ignore_offer: bool,
    has_remote_description: bool,
    pending_candidates: VecDeque<IceCandidate>,
    bootstrap_open: bool,
    data_open: bool,
    state: watch::Sender<PeerState>,
    forwarders: Vec<JoinHandle<()>>,
}

impl PeerActor {
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<PeerInput>) {
        while let Some(next) = input.recv().await {
            match next {
                PeerInput::Rtc(RtcEvent::NegotiationNeeded) => self.on_negotiation_needed().await,
                PeerInput::Rtc(RtcEvent::LocalCandidate(candidate)) => {
                    self.send(SignalEnvelope::Candidate(candidate)).await;
                }
                PeerInput::Rtc(RtcEvent::Connectivity(connectivity)) => {
                    trace!(target = "peer_channel::peer", remote = %self.remote, ?connectivity, "connectivity");
                    if connectivity.is_fatal() {
                        debug!(target = "peer_channel::peer", remote = %self.remote, ?connectivity, "connectivity lost");
                        break;
                    }
                }
                PeerInput::Relay(envelope) => {
                    if matches!(self.route, SignalRoute::InBand) {
                        trace!(
                            target = "peer_channel::peer",
                            remote = %self.remote,
                            kind = envelope.kind(),
                            "ignoring relay signal after in-band switch"
                        );
                        continue;
                    }
                    self.on_signal(envelope).await;
                }
                PeerInput::InBand(message) => match SignalEnvelope::from_slice(&message) {
                    Ok(envelope) => self.on_signal(envelope).await,
                    Err(err) => {
                        warn!(
                            target = "peer_channel::peer",
                            remote = %self.remote,
                            error = %err,
                            len = message.len(),
                            "dropping unparsable bootstrap message"
                        );
                    }
                },
                PeerInput::Channel(kind, state) => {
                    if state.is_terminal() {
                        debug!(target = "peer_channel::peer", remote = %self.remote, ?kind, "channel closed");
                        break;
                    }
                    if state == ChannelState::Open {
                        self.on_channel_open(kind);
                    }
                }
                PeerInput::Close => break,
            }
        }
        self.teardown().await;
    }

    async fn on_negotiation_needed(&mut self) {
        if self.conn.signaling_state() != SignalingState::Stable {
            trace!(target = "peer_channel::peer", remote = %self.remote, "negotiation needed outside stable; skipping");
            return;
        }
        if self.polite && !self.has_remote_description && !self.conn.supports_rollback() {
            trace!(
                target = "peer_channel::peer",
                remote = %self.remote,
                "polite side cannot roll back; waiting for the remote offer"
            );
            return;
        }
        let result = async {
            let offer = self.conn.create_offer().await?;
            self.conn.set_local_description(offer.clone()).await?;
            Ok::<_, TransportError>(offer)
        }
        .await;
        match result {
            Ok(offer) => self.send(SignalEnvelope::Description(offer)).await,
            Err(err) => {
                warn!(target = "peer_channel::peer", remote = %self.remote, error = %err, "failed to create offer");
            }
        }
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::Description(desc) => self.on_description(desc).await,
            SignalEnvelope::Candidate(candidate) => self.on_candidate(candidate).await,
        }
    }

    async fn on_description(&mut self, desc: SessionDescription) {
        let collision = desc.is_offer() && self.conn.signaling_state() != SignalingState::Stable;
        self.ignore_offer = !self.polite && collision;
        if self.ignore_offer {
            debug!(
                target = "peer_channel::peer",
                remote = %self.remote,
                dropped_candidates = self.pending_candidates.len(),
                "ignoring colliding offer"
            );
            self.pending_candidates.clear();
            return;
        }

        if collision {
            debug!(target = "peer_channel::peer", remote = %self.remote, "offer collision; rolling back");
            if let Err(err) = self.conn.rollback().await {
                warn!(target = "peer_channel::peer", remote = %self.remote, error = %err, "rollback failed");
                return;
            }
        }

        let is_offer = desc.is_offer();
        if let Err(err) = self.conn.set_remote_description(desc).await {
            warn!(target = "peer_channel::peer", remote = %self.remote, error = %err, "failed to apply remote description");
            return;
        }
        self.has_remote_description = true;
        self.flush_candidates().await;

        if is_offer {
            let result = async {
                let answer = self.conn.create_answer().await?;
                self.conn.set_local_description(answer.clone()).await?;
                Ok::<_, TransportError>(answer)
            }
            .await;
            match result {
                Ok(answer) => self.send(SignalEnvelope::Description(answer)).await,
                Err(err) => {
                    warn!(target = "peer_channel::peer", remote = %self.remote, error = %err, "failed to answer offer");
                }
            }
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if !self.has_remote_description {
            if self.ignore_offer {
                trace!(target = "peer_channel::peer", remote = %self.remote, "dropping candidate for ignored offer");
            } else {
                self.pending_candidates.push_back(candidate);
            }
            return;
        }
        self.add_candidate(candidate).await;
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.add_candidate(candidate).await;
        }
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) {
        if let Err(err) = self.conn.add_ice_candidate(candidate).await {
            if self.ignore_offer {
                trace!(target = "peer_channel::peer", remote = %self.remote, error = %err, "candidate for ignored offer rejected");
            } else {
                warn!(target = "peer_channel::peer", remote = %self.remote, error = %err, "dropping stale ice candidate");
            }
        }
    }

    fn on_channel_open(&mut self, kind: ChannelKind) {
        match kind {
            ChannelKind::Bootstrap if !self.bootstrap_open => {
                self.bootstrap_open = true;
                if let SignalRoute::Relay(_) = self.route {
                    // Dropping the relay sender ends the outbound stream.
                    self.route = SignalRoute::InBand;
                    debug!(target = "peer_channel::peer", remote = %self.remote, "switched to in-band signaling");
                }
            }
            ChannelKind::Data => self.data_open = true,
            ChannelKind::Bootstrap => {}
        }

        let next = match (self.bootstrap_open, self.data_open) {
            (true, true) => PeerState::Ready,
            (true, false) => PeerState::NegotiatingInband,
            _ => PeerState::NegotiatingBootstrap,
        };
        let changed = self.state.send_if_modified(|state| {
            if *state != next && *state != PeerState::Closed {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(target = "peer_channel::peer", remote = %self.remote, state = ?next, "peer state");
        }
    }

    async fn send(&mut self, envelope: SignalEnvelope) {
        match &self.route {
            SignalRoute::Relay(tx) => {
                if tx.send(envelope).is_err() {
                    trace!(target = "peer_channel::peer", remote = %self.remote, "relay receiver dropped");
                }
            }
            SignalRoute::InBand => {
                let bytes = match serde_json::to_vec(&envelope) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(target = "peer_channel::peer", error = %err, "failed to encode signal");
                        return;
                    }
                };
                if let Err(err) = self.bootstrap.send(Bytes::from(bytes)).await {
                    warn!(
                        target = "peer_channel::peer",
                        remote = %self.remote,
                        kind = envelope.kind(),
                        error = %err,
                        "in-band signal send failed"
                    );
                }
            }
        }
    }

    async fn teardown(mut self) {
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        self.route = SignalRoute::InBand;
        self.bootstrap.close().await;
        self.data.close().await;
        if let Err(err) = self.conn.close().await {
            debug!(target = "peer_channel::peer", remote = %self.remote, error = %err, "connection close failed");
        }
        self.state.send_replace(PeerState::Closed);
        debug!(target = "peer_channel::peer", remote = %self.remote, "peer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::memory::MemoryNetwork;

    fn options(remote: &str, is_initiator: bool) -> PeerOptions {
        PeerOptions {
            local_role: "test".into(),
            remote_peer_id: remote.into(),
            is_initiator,
        }
    }

    fn pump(from: &Peer, to: &Peer) {
        let mut outbound = from.take_outbound_signals().expect("outbound signals");
        let to = to.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                to.deliver_signal(envelope);
            }
        });
    }

    #[tokio::test]
    async fn ready_fails_after_close() {
        let net = MemoryNetwork::new();
        let peer = Peer::new(net.connect(), options("x", true), &PeerConfig::localhost())
            .await
            .unwrap();
        assert_eq!(peer.state(), PeerState::NegotiatingBootstrap);
        peer.close().await;
        peer.close().await;
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(matches!(peer.ready().await, Err(TransportError::PeerClosed)));
        assert_eq!(net.live_connections(), 0);
    }

    #[tokio::test]
    async fn glare_resolves_and_relay_detaches() {
        let net = MemoryNetwork::new();
        let config = PeerConfig::localhost();
        let a = Peer::new(net.connect(), options("b", true), &config)
            .await
            .unwrap();
        let b = Peer::new(net.connect(), options("a", false), &config)
            .await
            .unwrap();
        pump(&a, &b);
        pump(&b, &a);

        a.ready().await.unwrap();
        b.ready().await.unwrap();
        assert!(a.take_outbound_signals().is_none());

        let mut inbound = b.data_channel().subscribe();
        a.data_channel()
            .send(Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"hello")));
    }
}
