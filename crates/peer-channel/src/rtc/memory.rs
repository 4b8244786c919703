//! In-process negotiation backend.
//!
//! `MemoryNetwork` plays the part of the ICE/DTLS/SCTP stack: connections
//! exchange opaque `memory:` descriptions and candidates, and become linked
//! once both sides have applied each other's descriptions and at least one
//! side accepted a remote candidate. Signaling-state transitions are enforced
//! the way a real stack enforces them, so glare must be resolved by rollback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tracing::debug;

use super::{ConnectionFactory, Connectivity, RtcConnection, RtcEvent, SignalingState};
use crate::channel::{ChannelState, DataChannel};
use crate::error::TransportError;
use crate::events::Emitter;
use crate::signal::{IceCandidate, SdpType, SessionDescription};

const SDP_PREFIX: &str = "memory:";
const CANDIDATE_PREFIX: &str = "candidate:memory ";

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetInner>,
}

#[derive(Default)]
struct NetInner {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, ConnSlot>>,
    no_rollback: bool,
}

struct ConnSlot {
    signaling: SignalingState,
    has_local: bool,
    has_remote: bool,
    remote_id: Option<u64>,
    accepted_candidates: Vec<String>,
    gathered: bool,
    linked: Option<u64>,
    version: u64,
    channels: HashMap<u16, Arc<MemoryChannel>>,
    events: mpsc::UnboundedSender<RtcEvent>,
}

impl ConnSlot {
    fn emit(&self, event: RtcEvent) {
        let _ = self.events.send(event);
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network whose connections refuse to roll back a local offer, like
    /// the webrtc-rs stack.
    pub fn without_rollback() -> Self {
        Self {
            inner: Arc::new(NetInner {
                no_rollback: true,
                ..NetInner::default()
            }),
        }
    }

    pub fn connect(&self) -> Arc<MemoryConnection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.slots.lock().insert(
            id,
            ConnSlot {
                signaling: SignalingState::Stable,
                has_local: false,
                has_remote: false,
                remote_id: None,
                accepted_candidates: Vec::new(),
                gathered: false,
                linked: None,
                version: 0,
                channels: HashMap::new(),
                events: events_tx,
            },
        );
        Arc::new(MemoryConnection {
            id,
            net: Arc::clone(&self.inner),
            events: Mutex::new(Some(events_rx)),
        })
    }

    /// Number of connections that have not been closed yet.
    pub fn live_connections(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryNetwork {
    async fn create(&self) -> Result<Arc<dyn RtcConnection>, TransportError> {
        Ok(self.connect())
    }
}

pub struct MemoryConnection {
    id: u64,
    net: Arc<NetInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RtcEvent>>>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.net
            .slots
            .lock()
            .get(&self.id)
            .is_some_and(|slot| slot.linked.is_some())
    }

    /// Remote candidates accepted so far, in the order they were added.
    pub fn accepted_candidates(&self) -> Vec<String> {
        self.net
            .slots
            .lock()
            .get(&self.id)
            .map(|slot| slot.accepted_candidates.clone())
            .unwrap_or_default()
    }

    /// Simulates an ICE failure on this side of the connection.
    pub fn fail(&self) {
        if let Some(slot) = self.net.slots.lock().get(&self.id) {
            slot.emit(RtcEvent::Connectivity(Connectivity::Failed));
        }
    }

    fn with_slot<T>(
        &self,
        f: impl FnOnce(&mut ConnSlot) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut slots = self.net.slots.lock();
        let slot = slots.get_mut(&self.id).ok_or(TransportError::ChannelClosed)?;
        f(slot)
    }

    fn try_link(&self) {
        let mut slots = self.net.slots.lock();
        let Some(local) = slots.get(&self.id) else {
            return;
        };
        let Some(remote_id) = local.remote_id else {
            return;
        };
        let Some(remote) = slots.get(&remote_id) else {
            return;
        };
        let ready = |slot: &ConnSlot| {
            slot.signaling == SignalingState::Stable
                && slot.has_local
                && slot.has_remote
                && slot.linked.is_none()
        };
        if !ready(local)
            || !ready(remote)
            || remote.remote_id != Some(self.id)
            || (local.accepted_candidates.is_empty() && remote.accepted_candidates.is_empty())
        {
            return;
        }

        let remote_channels = remote.channels.clone();
        if let Some(slot) = slots.get_mut(&remote_id) {
            slot.linked = Some(self.id);
            slot.emit(RtcEvent::Connectivity(Connectivity::Connected));
        }
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.linked = Some(remote_id);
            slot.emit(RtcEvent::Connectivity(Connectivity::Connected));
            for (id, channel) in slot.channels.iter() {
                if let Some(other) = remote_channels.get(id) {
                    MemoryChannel::link(channel, other);
                }
            }
        }
        debug!(
            target = "peer_channel::memory",
            local = self.id,
            remote = remote_id,
            "memory connection linked"
        );
    }

    fn shutdown(&self) {
        let mut slots = self.net.slots.lock();
        let Some(slot) = slots.remove(&self.id) else {
            return;
        };
        for channel in slot.channels.values() {
            channel.close_local();
        }
        slot.emit(RtcEvent::Connectivity(Connectivity::Closed));
        if let Some(remote) = slot.linked.and_then(|id| slots.get_mut(&id)) {
            remote.linked = None;
            for channel in remote.channels.values() {
                channel.close_local();
            }
            remote.emit(RtcEvent::Connectivity(Connectivity::Disconnected));
        }
    }
}

fn describe(id: u64, version: u64) -> String {
    format!("{SDP_PREFIX}{id}:{version}")
}

fn parse_description(sdp: &str) -> Result<u64, TransportError> {
    sdp.strip_prefix(SDP_PREFIX)
        .and_then(|rest| rest.split(':').next())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TransportError::Negotiation(format!("unparsable description {sdp:?}")))
}

fn invalid_transition(op: &str, desc: SdpType, state: SignalingState) -> TransportError {
    TransportError::Negotiation(format!("cannot {op} {desc} in state {state:?}"))
}

#[async_trait]
impl RtcConnection for MemoryConnection {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>> {
        self.events.lock().take()
    }

    fn signaling_state(&self) -> SignalingState {
        self.net
            .slots
            .lock()
            .get(&self.id)
            .map(|slot| slot.signaling)
            .unwrap_or(SignalingState::Closed)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let id = self.id;
        self.with_slot(|slot| {
            slot.version += 1;
            Ok(SessionDescription::offer(describe(id, slot.version)))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let id = self.id;
        self.with_slot(|slot| {
            if slot.signaling != SignalingState::HaveRemoteOffer {
                return Err(TransportError::Negotiation(format!(
                    "cannot create answer in state {:?}",
                    slot.signaling
                )));
            }
            slot.version += 1;
            Ok(SessionDescription::answer(describe(id, slot.version)))
        })
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.with_slot(|slot| {
            slot.signaling = match (desc.sdp_type, slot.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveLocalPranswer
                }
                (SdpType::Rollback, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, state) => {
                    return Err(invalid_transition("set local", sdp_type, state));
                }
            };
            if desc.sdp_type != SdpType::Rollback {
                slot.has_local = true;
            }
            if !slot.gathered && slot.has_local {
                slot.gathered = true;
                slot.emit(RtcEvent::LocalCandidate(IceCandidate {
                    candidate: format!("{CANDIDATE_PREFIX}{}", self.id),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                }));
                slot.emit(RtcEvent::Connectivity(Connectivity::Checking));
            }
            Ok(())
        })?;
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote_id = match desc.sdp_type {
            SdpType::Rollback => None,
            _ => Some(parse_description(&desc.sdp)?),
        };
        self.with_slot(|slot| {
            slot.signaling = match (desc.sdp_type, slot.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveRemotePranswer
                }
                (SdpType::Rollback, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (sdp_type, state) => {
                    return Err(invalid_transition("set remote", sdp_type, state));
                }
            };
            if let Some(remote_id) = remote_id {
                slot.remote_id = Some(remote_id);
                slot.has_remote = true;
            }
            Ok(())
        })?;
        self.try_link();
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        !self.net.no_rollback
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        if self.net.no_rollback {
            return Err(TransportError::Negotiation(
                "rollback disabled on this network".into(),
            ));
        }
        self.with_slot(|slot| match slot.signaling {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                slot.signaling = SignalingState::Stable;
                Ok(())
            }
            state => Err(invalid_transition("roll back", SdpType::Rollback, state)),
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let from = candidate
            .candidate
            .strip_prefix(CANDIDATE_PREFIX)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|id| id.parse::<u64>().ok());
        self.with_slot(|slot| {
            if !slot.has_remote {
                return Err(TransportError::Negotiation(
                    "remote description not set".into(),
                ));
            }
            if from.is_none() || from != slot.remote_id {
                return Err(TransportError::Negotiation(format!(
                    "candidate {:?} does not match the remote description",
                    candidate.candidate
                )));
            }
            slot.accepted_candidates.push(candidate.candidate.clone());
            Ok(())
        })?;
        self.try_link();
        Ok(())
    }

    async fn create_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MemoryChannel::new(label, id);
        let mut slots = self.net.slots.lock();
        let slot = slots.get_mut(&self.id).ok_or(TransportError::ChannelClosed)?;
        if slot.channels.contains_key(&id) {
            return Err(TransportError::Setup(format!("channel id {id} already in use")));
        }
        let first = slot.channels.is_empty();
        slot.channels.insert(id, Arc::clone(&channel));
        if first {
            slot.emit(RtcEvent::NegotiationNeeded);
        }
        let linked = slot.linked;
        if let Some(remote) = linked.and_then(|remote| slots.get(&remote)) {
            if let Some(other) = remote.channels.get(&id) {
                MemoryChannel::link(&channel, other);
            }
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// In-process data channel. Delivery is immediate, so nothing is ever
/// buffered.
pub struct MemoryChannel {
    label: String,
    id: u16,
    state: watch::Sender<ChannelState>,
    inbound: Emitter<Bytes>,
    remote: Mutex<Weak<MemoryChannel>>,
    low_threshold: AtomicUsize,
    drained: Notify,
}

impl MemoryChannel {
    pub fn new(label: &str, id: u16) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            id,
            state: watch::Sender::new(ChannelState::Connecting),
            inbound: Emitter::new(),
            remote: Mutex::new(Weak::new()),
            low_threshold: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// Two open channels wired to each other.
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label, 0);
        let b = Self::new(label, 0);
        Self::link(&a, &b);
        (a, b)
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.remote.lock() = Arc::downgrade(b);
        *b.remote.lock() = Arc::downgrade(a);
        a.state.send_replace(ChannelState::Open);
        b.state.send_replace(ChannelState::Open);
    }

    fn close_local(&self) {
        let previous = self.state.send_replace(ChannelState::Closed);
        if previous != ChannelState::Closed {
            self.inbound.clear();
            self.drained.notify_waiters();
        }
    }

    pub fn low_threshold(&self) -> usize {
        self.low_threshold.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.inbound.subscribe()
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        let remote = self.remote.lock().upgrade();
        match remote {
            Some(remote) if remote.state() == ChannelState::Open => {
                remote.inbound.emit(data);
                Ok(())
            }
            _ => Err(TransportError::ChannelClosed),
        }
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::Relaxed);
    }

    fn buffer_drained(&self) -> &Notify {
        &self.drained
    }

    async fn close(&self) {
        self.close_local();
        let remote = self.remote.lock().upgrade();
        if let Some(remote) = remote {
            remote.close_local();
        }
    }
}
