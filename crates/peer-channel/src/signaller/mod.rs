//! Rendezvous and presence.
//!
//! A [`Signaller`] joins a room under a role, announces every other
//! participant (past and future) and relays opaque JSON messages between
//! participants. One signaller instance is one session; [`SignallerFactory`]
//! hands out fresh sessions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod memory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignallerEvent {
    PeerJoined(PeerInfo),
    /// Emitted once per distinct mailbox message.
    Signal { from: String, data: Value },
}

#[async_trait]
pub trait Signaller: Send + Sync {
    fn peer_id(&self) -> &str;

    /// Registers presence in `room_id`. Fails with
    /// [`TransportError::AlreadyJoined`] on a second call.
    async fn join(&self, room_id: &str, role: &str) -> Result<(), TransportError>;

    async fn send_message(&self, target: &str, payload: Value) -> Result<(), TransportError>;

    /// Events from the moment of subscription on. Subscribe before `join` to
    /// see participants already present.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignallerEvent>;

    /// Removes the presence entry and ends every subscription.
    async fn disconnect(&self);
}

#[async_trait]
pub trait SignallerFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Signaller>, TransportError>;
}
