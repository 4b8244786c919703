//! In-process rendezvous.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{PeerInfo, Signaller, SignallerEvent, SignallerFactory};
use crate::error::TransportError;
use crate::events::Emitter;

/// Rooms of presence entries and per-recipient mailboxes, shared by every
/// signaller it creates.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    inner: Arc<RendezvousInner>,
}

#[derive(Default)]
struct RendezvousInner {
    next_key: AtomicU64,
    rooms: Mutex<HashMap<String, Room>>,
}

#[derive(Default)]
struct Room {
    members: HashMap<String, Member>,
    /// Mail by recipient id. Survives until its writer disconnects.
    mailboxes: HashMap<String, Vec<Mail>>,
}

struct Member {
    role: String,
    events: Arc<Emitter<SignallerEvent>>,
    delivered: HashSet<u64>,
}

impl Member {
    fn deliver(&mut self, mail: &Mail) {
        if !self.delivered.insert(mail.key) {
            trace!(target = "peer_channel::signaller", key = mail.key, "duplicate mail skipped");
            return;
        }
        self.events.emit(SignallerEvent::Signal {
            from: mail.from.clone(),
            data: mail.data.clone(),
        });
    }
}

#[derive(Clone)]
struct Mail {
    key: u64,
    from: String,
    data: Value,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signaller(&self) -> MemorySignaller {
        self.signaller_with_id(Uuid::new_v4().to_string())
    }

    pub fn signaller_with_id(&self, peer_id: impl Into<String>) -> MemorySignaller {
        MemorySignaller {
            peer_id: peer_id.into(),
            rendezvous: Arc::clone(&self.inner),
            room: Mutex::new(None),
            events: Arc::new(Emitter::new()),
        }
    }

    /// Presence entries currently registered in `room_id`.
    pub fn members(&self, room_id: &str) -> Vec<PeerInfo> {
        let rooms = self.inner.rooms.lock();
        let mut members: Vec<PeerInfo> = rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .map(|(peer_id, member)| PeerInfo {
                        peer_id: peer_id.clone(),
                        role: member.role.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        members
    }

    /// Messages still stored in `room_id`.
    pub fn stored_messages(&self, room_id: &str) -> usize {
        self.inner
            .rooms
            .lock()
            .get(room_id)
            .map(|room| room.mailboxes.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignallerFactory for MemoryRendezvous {
    async fn create(&self) -> Result<Arc<dyn Signaller>, TransportError> {
        Ok(Arc::new(self.signaller()))
    }
}

pub struct MemorySignaller {
    peer_id: String,
    rendezvous: Arc<RendezvousInner>,
    room: Mutex<Option<String>>,
    events: Arc<Emitter<SignallerEvent>>,
}

impl MemorySignaller {
    fn leave(&self) {
        let Some(room_id) = self.room.lock().take() else {
            return;
        };
        let mut rooms = self.rendezvous.rooms.lock();
        if let Some(room) = rooms.get_mut(&room_id) {
            room.members.remove(&self.peer_id);
            room.mailboxes.remove(&self.peer_id);
            for mailbox in room.mailboxes.values_mut() {
                mailbox.retain(|mail| mail.from != self.peer_id);
            }
            room.mailboxes.retain(|_, mailbox| !mailbox.is_empty());
            if room.members.is_empty() && room.mailboxes.is_empty() {
                rooms.remove(&room_id);
            }
        }
        self.events.clear();
        debug!(target = "peer_channel::signaller", peer_id = %self.peer_id, room = %room_id, "left room");
    }
}

#[async_trait]
impl Signaller for MemorySignaller {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn join(&self, room_id: &str, role: &str) -> Result<(), TransportError> {
        let mut joined = self.room.lock();
        if joined.is_some() {
            return Err(TransportError::AlreadyJoined);
        }

        let mut rooms = self.rendezvous.rooms.lock();
        let room = rooms.entry(room_id.to_string()).or_default();
        let info = PeerInfo {
            peer_id: self.peer_id.clone(),
            role: role.to_string(),
        };
        for (peer_id, member) in room.members.iter() {
            self.events.emit(SignallerEvent::PeerJoined(PeerInfo {
                peer_id: peer_id.clone(),
                role: member.role.clone(),
            }));
            member.events.emit(SignallerEvent::PeerJoined(info.clone()));
        }

        let mut member = Member {
            role: role.to_string(),
            events: Arc::clone(&self.events),
            delivered: HashSet::new(),
        };
        if let Some(mailbox) = room.mailboxes.get(&self.peer_id) {
            for mail in mailbox {
                member.deliver(mail);
            }
        }
        room.members.insert(self.peer_id.clone(), member);
        *joined = Some(room_id.to_string());

        debug!(target = "peer_channel::signaller", peer_id = %self.peer_id, room = %room_id, %role, "joined room");
        Ok(())
    }

    async fn send_message(&self, target: &str, payload: Value) -> Result<(), TransportError> {
        let room_id = self.room.lock().clone().ok_or(TransportError::NotJoined)?;
        let mail = Mail {
            key: self.rendezvous.next_key.fetch_add(1, Ordering::Relaxed),
            from: self.peer_id.clone(),
            data: payload,
        };

        let mut rooms = self.rendezvous.rooms.lock();
        let room = rooms
            .get_mut(&room_id)
            .ok_or_else(|| TransportError::Signalling(format!("room {room_id} vanished")))?;
        if let Some(member) = room.members.get_mut(target) {
            member.deliver(&mail);
        }
        room.mailboxes
            .entry(target.to_string())
            .or_default()
            .push(mail);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignallerEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        self.leave();
    }
}

impl Drop for MemorySignaller {
    fn drop(&mut self) {
        self.leave();
    }
}
