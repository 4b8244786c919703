//! Discovery, admission control and the peer pool.
//!
//! `RolePeering` waits for participants of a complementary role to show up in
//! a room and negotiates one [`Peer`] with each of them, up to `max_peers`.
//! While the pool is full the signaller session is closed, so nobody else can
//! discover this endpoint; when a peer leaves, a fresh session is opened.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::error::TransportError;
use crate::events::Emitter;
use crate::peer::{Peer, PeerOptions, PeerState};
use crate::rtc::ConnectionFactory;
use crate::signal::SignalEnvelope;
use crate::signaller::{PeerInfo, Signaller, SignallerEvent, SignallerFactory};

#[derive(Debug, Clone)]
pub struct RolePeeringOptions {
    pub room_id: String,
    pub self_role: String,
    pub remote_role: String,
    pub max_peers: usize,
    pub peer_config: PeerConfig,
}

impl RolePeeringOptions {
    pub fn new(
        room_id: impl Into<String>,
        self_role: impl Into<String>,
        remote_role: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            self_role: self_role.into(),
            remote_role: remote_role.into(),
            max_peers: usize::MAX,
            peer_config: PeerConfig::default(),
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_peer_config(mut self, peer_config: PeerConfig) -> Self {
        self.peer_config = peer_config;
        self
    }
}

#[derive(Debug, Clone)]
pub enum RolePeeringEvent {
    PeerConnected { peer_id: String, peer: Peer },
    PeerDisconnected { peer_id: String },
    /// A message received on a pooled peer's data channel.
    Message { peer_id: String, data: Bytes },
}

/// Lexicographically smaller role initiates; equal roles fall back to the
/// smaller signaller id.
pub fn is_initiator(self_role: &str, remote_role: &str, local_id: &str, remote_id: &str) -> bool {
    match self_role.as_bytes().cmp(remote_role.as_bytes()) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => local_id < remote_id,
    }
}

#[derive(Clone)]
pub struct RolePeering {
    inner: Arc<Inner>,
}

struct Inner {
    me: Weak<Inner>,
    options: RolePeeringOptions,
    signallers: Arc<dyn SignallerFactory>,
    connections: Arc<dyn ConnectionFactory>,
    pool: Mutex<Pool>,
    admission: AsyncMutex<()>,
    events: Emitter<RolePeeringEvent>,
}

#[derive(Default)]
struct Pool {
    joined: bool,
    destroyed: bool,
    generation: u64,
    session: Option<Session>,
    peers: HashMap<String, Pooled>,
}

struct Session {
    generation: u64,
    signaller: Arc<dyn Signaller>,
    pump: JoinHandle<()>,
}

/// A pool slot. `peer` is `None` while the connection is being created.
#[derive(Default)]
struct Pooled {
    peer: Option<Peer>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pooled {
    fn on_relay(&self) -> bool {
        self.peer
            .as_ref()
            .is_none_or(|peer| peer.state() == PeerState::NegotiatingBootstrap)
    }

    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl RolePeering {
    pub fn new(
        options: RolePeeringOptions,
        signallers: Arc<dyn SignallerFactory>,
        connections: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|me| Inner {
                me: me.clone(),
                options,
                signallers,
                connections,
                pool: Mutex::new(Pool::default()),
                admission: AsyncMutex::new(()),
                events: Emitter::new(),
            }),
        }
    }

    pub fn options(&self) -> &RolePeeringOptions {
        &self.inner.options
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RolePeeringEvent> {
        self.inner.events.subscribe()
    }

    /// Opens the first signaller session.
    pub async fn join(&self) -> Result<(), TransportError> {
        {
            let mut pool = self.inner.pool.lock();
            if pool.joined {
                return Err(TransportError::AlreadyJoined);
            }
            pool.joined = true;
        }
        let _guard = self.inner.admission.lock().await;
        let opened = self.inner.open_session().await;
        if opened.is_err() {
            self.inner.pool.lock().joined = false;
        }
        opened
    }

    /// Writes `data` to the data channel of every pooled peer, or only to
    /// `to_peer_id`. Waits for each target to become ready and returns how
    /// many peers were written.
    pub async fn send_message(&self, data: Bytes, to_peer_id: Option<&str>) -> usize {
        let targets: Vec<(String, Peer)> = {
            let pool = self.inner.pool.lock();
            pool.peers
                .iter()
                .filter(|(peer_id, _)| to_peer_id.is_none_or(|to| to == peer_id.as_str()))
                .filter_map(|(peer_id, slot)| slot.peer.clone().map(|peer| (peer_id.clone(), peer)))
                .collect()
        };

        let sends = targets.into_iter().map(|(peer_id, peer)| {
            let data = data.clone();
            async move {
                if let Err(err) = peer.ready().await {
                    warn!(target = "peer_channel::role_peering", peer_id = %peer_id, error = %err, "peer closed before send");
                    return false;
                }
                match peer.data_channel().send(data).await {
                    Ok(()) => {
                        trace!(target = "peer_channel::role_peering", peer_id = %peer_id, "message sent");
                        true
                    }
                    Err(err) => {
                        warn!(target = "peer_channel::role_peering", peer_id = %peer_id, error = %err, "send failed");
                        false
                    }
                }
            }
        });
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Peers currently in the pool, including ones still negotiating.
    pub fn peers(&self) -> Vec<(String, Peer)> {
        let pool = self.inner.pool.lock();
        pool.peers
            .iter()
            .filter_map(|(peer_id, slot)| slot.peer.clone().map(|peer| (peer_id.clone(), peer)))
            .collect()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool.lock().peers.len()
    }

    pub fn is_discoverable(&self) -> bool {
        self.inner.pool.lock().session.is_some()
    }

    /// Closes the session and every pooled peer. Later discovery is ignored.
    pub async fn destroy(&self) {
        let _guard = self.inner.admission.lock().await;
        let (session, slots) = {
            let mut pool = self.inner.pool.lock();
            pool.destroyed = true;
            let slots: Vec<Pooled> = pool.peers.drain().map(|(_, slot)| slot).collect();
            (pool.session.take(), slots)
        };
        if let Some(session) = session {
            session.close().await;
        }
        for mut slot in slots {
            slot.abort();
            if let Some(peer) = slot.peer {
                peer.close().await;
            }
        }
        info!(target = "peer_channel::role_peering", room = %self.inner.options.room_id, "destroyed");
    }
}

impl Session {
    async fn close(self) {
        self.pump.abort();
        self.signaller.disconnect().await;
    }
}

impl Inner {
    /// Caller holds the admission lock.
    ///
    /// Boxed: the session pump eventually re-enters admission, which calls
    /// back into this method.
    fn open_session(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            {
                let pool = self.pool.lock();
                if pool.destroyed || pool.session.is_some() {
                    return Ok(());
                }
            }
            let signaller = self.signallers.create().await?;
            let mut events = signaller.subscribe();

            let generation = {
                let mut pool = self.pool.lock();
                pool.generation += 1;
                let generation = pool.generation;
                let me = self.me.clone();
                let pump = tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let Some(inner) = me.upgrade() else {
                            break;
                        };
                        inner.on_signaller_event(generation, event).await;
                    }
                });
                pool.session = Some(Session {
                    generation,
                    signaller: Arc::clone(&signaller),
                    pump,
                });
                generation
            };

            if let Err(err) = signaller
                .join(&self.options.room_id, &self.options.self_role)
                .await
            {
                let session = self.pool.lock().session.take();
                if let Some(session) = session {
                    session.close().await;
                }
                return Err(err);
            }
            info!(
                target = "peer_channel::role_peering",
                room = %self.options.room_id,
                role = %self.options.self_role,
                peer_id = %signaller.peer_id(),
                generation,
                "signaller session opened"
            );
            Ok(())
        })
    }

    fn current_signaller(&self, generation: u64) -> Option<Arc<dyn Signaller>> {
        let pool = self.pool.lock();
        if pool.destroyed {
            return None;
        }
        pool.session
            .as_ref()
            .filter(|session| session.generation == generation)
            .map(|session| Arc::clone(&session.signaller))
    }

    async fn on_signaller_event(&self, generation: u64, event: SignallerEvent) {
        let Some(signaller) = self.current_signaller(generation) else {
            trace!(target = "peer_channel::role_peering", generation, "stale signaller event");
            return;
        };
        match event {
            SignallerEvent::PeerJoined(info) => self.on_peer_joined(generation, signaller, info).await,
            SignallerEvent::Signal { from, data } => {
                let peer = self
                    .pool
                    .lock()
                    .peers
                    .get(&from)
                    .and_then(|slot| slot.peer.clone());
                let Some(peer) = peer else {
                    debug!(target = "peer_channel::role_peering", from = %from, "signal from unknown peer");
                    return;
                };
                match SignalEnvelope::from_value(&data) {
                    Ok(envelope) => peer.deliver_signal(envelope),
                    Err(err) => {
                        warn!(target = "peer_channel::role_peering", from = %from, error = %err, "dropping unparsable signal");
                    }
                }
            }
        }
    }

    async fn on_peer_joined(&self, generation: u64, signaller: Arc<dyn Signaller>, info: PeerInfo) {
        if info.role != self.options.remote_role {
            trace!(target = "peer_channel::role_peering", peer_id = %info.peer_id, role = %info.role, "ignoring peer of other role");
            return;
        }
        {
            let mut pool = self.pool.lock();
            let current = pool
                .session
                .as_ref()
                .is_some_and(|session| session.generation == generation);
            if !current || pool.peers.contains_key(&info.peer_id) {
                return;
            }
            if pool.peers.len() >= self.options.max_peers {
                debug!(target = "peer_channel::role_peering", peer_id = %info.peer_id, "pool full; ignoring peer");
                return;
            }
            pool.peers.insert(info.peer_id.clone(), Pooled::default());
        }

        match self.create_peer(&signaller, &info).await {
            Ok(()) => {}
            Err(err) => {
                warn!(target = "peer_channel::role_peering", peer_id = %info.peer_id, error = %err, "failed to create peer");
                self.pool.lock().peers.remove(&info.peer_id);
            }
        }
    }

    async fn create_peer(
        &self,
        signaller: &Arc<dyn Signaller>,
        info: &PeerInfo,
    ) -> Result<(), TransportError> {
        let initiator = is_initiator(
            &self.options.self_role,
            &self.options.remote_role,
            signaller.peer_id(),
            &info.peer_id,
        );
        let conn = self.connections.create().await?;
        let peer = Peer::new(
            conn,
            PeerOptions {
                local_role: self.options.self_role.clone(),
                remote_peer_id: info.peer_id.clone(),
                is_initiator: initiator,
            },
            &self.options.peer_config,
        )
        .await?;
        debug!(
            target = "peer_channel::role_peering",
            peer_id = %info.peer_id,
            initiator,
            "peer added"
        );

        let mut tasks = Vec::with_capacity(3);
        if let Some(mut outbound) = peer.take_outbound_signals() {
            let relay = Arc::clone(signaller);
            let target = info.peer_id.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = outbound.recv().await {
                    let kind = envelope.kind();
                    let sent = match envelope.to_value() {
                        Ok(value) => relay.send_message(&target, value).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        warn!(target = "peer_channel::role_peering", peer_id = %target, kind, error = %err, "relay send failed");
                    }
                }
            }));
        }

        let mut messages = peer.data_channel().subscribe();
        let events_peer_id = info.peer_id.clone();
        let me = self.me.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(data) = messages.recv().await {
                let Some(inner) = me.upgrade() else {
                    break;
                };
                inner.events.emit(RolePeeringEvent::Message {
                    peer_id: events_peer_id.clone(),
                    data,
                });
            }
        }));

        let lifecycle_peer = peer.clone();
        let lifecycle_id = info.peer_id.clone();
        let me = self.me.clone();
        tasks.push(tokio::spawn(async move {
            let ready = lifecycle_peer.ready().await;
            if ready.is_ok() {
                let Some(inner) = me.upgrade() else {
                    return;
                };
                inner.on_peer_ready(&lifecycle_id, lifecycle_peer.clone()).await;
            }
            lifecycle_peer.closed().await;
            if let Some(inner) = me.upgrade() {
                inner.on_peer_closed(&lifecycle_id).await;
            }
        }));

        let orphaned = {
            let mut pool = self.pool.lock();
            let destroyed = pool.destroyed;
            match pool.peers.get_mut(&info.peer_id) {
                Some(slot) if !destroyed => {
                    slot.peer = Some(peer);
                    slot.tasks = tasks;
                    None
                }
                _ => Some((peer, tasks)),
            }
        };
        if let Some((peer, tasks)) = orphaned {
            for task in tasks {
                task.abort();
            }
            peer.close().await;
        }
        Ok(())
    }

    async fn on_peer_ready(&self, peer_id: &str, peer: Peer) {
        info!(target = "peer_channel::role_peering", peer_id, "peer connected");
        self.events.emit(RolePeeringEvent::PeerConnected {
            peer_id: peer_id.to_string(),
            peer,
        });
        self.update_admission().await;
    }

    async fn on_peer_closed(&self, peer_id: &str) {
        let removed = self.pool.lock().peers.remove(peer_id);
        let Some(mut slot) = removed else {
            return;
        };
        // The lifecycle task is the caller; it finishes on its own.
        if let Some(lifecycle) = slot.tasks.pop() {
            drop(lifecycle);
        }
        slot.abort();
        info!(target = "peer_channel::role_peering", peer_id, "peer disconnected");
        self.events.emit(RolePeeringEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });
        self.update_admission().await;
    }

    /// Closes the session while the pool is full and settled, reopens it when
    /// there is room again.
    async fn update_admission(&self) {
        let _guard = self.admission.lock().await;
        enum Action {
            Close(Session),
            Open,
            Nothing,
        }
        let action = {
            let mut pool = self.pool.lock();
            let size = pool.peers.len();
            let relay_busy = pool.peers.values().any(Pooled::on_relay);
            if pool.destroyed || !pool.joined {
                Action::Nothing
            } else if size >= self.options.max_peers {
                match pool.session.take() {
                    Some(session) if !relay_busy => Action::Close(session),
                    other => {
                        pool.session = other;
                        Action::Nothing
                    }
                }
            } else if pool.session.is_none() {
                Action::Open
            } else {
                Action::Nothing
            }
        };

        match action {
            Action::Close(session) => {
                info!(
                    target = "peer_channel::role_peering",
                    room = %self.options.room_id,
                    generation = session.generation,
                    "pool full; closing signaller session"
                );
                session.close().await;
            }
            Action::Open => {
                if let Err(err) = self.open_session().await {
                    warn!(target = "peer_channel::role_peering", error = %err, "failed to reopen signaller session");
                }
            }
            Action::Nothing => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_is_the_smaller_role() {
        assert!(is_initiator("client", "server", "z", "a"));
        assert!(!is_initiator("server", "client", "a", "z"));
        assert!(is_initiator("peer", "peer", "a", "b"));
        assert!(!is_initiator("peer", "peer", "b", "a"));
    }

    #[test]
    fn max_peers_defaults_to_unbounded() {
        let options = RolePeeringOptions::new("room", "a", "b");
        assert_eq!(options.max_peers, usize::MAX);
        assert_eq!(options.with_max_peers(2).max_peers, 2);
    }
}
