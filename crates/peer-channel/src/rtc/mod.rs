//! Negotiation backends driven by [`crate::Peer`].
//!
//! A backend owns the offer/answer machinery, the ICE agent and the
//! negotiated data channels of a single connection. `Peer` only ever talks to
//! the [`RtcConnection`] trait, so the same negotiation logic runs over
//! webrtc-rs in production and over the in-process [`memory`] backend in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::DataChannel;
use crate::error::TransportError;
use crate::signal::{IceCandidate, SessionDescription};

pub mod memory;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// ICE connectivity as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl Connectivity {
    /// States that end the owning peer.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Connectivity::Disconnected | Connectivity::Failed | Connectivity::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
}

#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Takes the event stream. Events raised before this call are buffered;
    /// only the first caller gets the receiver.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>>;

    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Whether [`rollback`](Self::rollback) can discard a local offer. A
    /// polite peer on a backend without it never offers before it has
    /// applied the remote description.
    fn supports_rollback(&self) -> bool {
        true
    }

    /// Discards a pending local offer and returns to `Stable`.
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Creates a pre-negotiated, ordered, reliable channel with a fixed id.
    async fn create_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn RtcConnection>, TransportError>;
}
