//! Peer-to-peer messaging over negotiated data channels.
//!
//! * [`Peer`] negotiates one direct connection with perfect negotiation,
//!   signaling over a relay until its bootstrap channel opens.
//! * [`RolePeering`] discovers endpoints of a complementary role through a
//!   [`Signaller`] and keeps a bounded pool of peers.
//! * [`ChunkedTransport`] lifts the channel's message-size limit and adds
//!   send-side backpressure.
//! * [`HandleMultiplexer`] lets JSON frames carry live [`MessagePort`]
//!   handles over a channel that cannot transfer them.

pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod events;
pub mod mux;
pub mod peer;
pub mod port;
pub mod role_peering;
pub mod rtc;
pub mod signal;
pub mod signaller;

pub use channel::{ChannelState, DataChannel};
pub use chunk::{ChunkError, ChunkedTransport, Payload};
pub use config::{ChunkConfig, IceServer, PeerConfig, runtime_config};
pub use error::TransportError;
pub use events::Emitter;
pub use mux::{Envelope, HandleMultiplexer};
pub use peer::{Peer, PeerOptions, PeerState};
pub use port::{JsonPort, MessageChannel, MessagePort, PortEvent};
pub use role_peering::{RolePeering, RolePeeringEvent, RolePeeringOptions};
pub use rtc::memory::{MemoryChannel, MemoryConnection, MemoryNetwork};
pub use rtc::webrtc::{WebRtcChannel, WebRtcConnection, WebRtcFactory};
pub use rtc::{ConnectionFactory, Connectivity, RtcConnection, RtcEvent, SignalingState};
pub use signal::{IceCandidate, SdpType, SessionDescription, SignalEnvelope};
pub use signaller::memory::{MemoryRendezvous, MemorySignaller};
pub use signaller::{PeerInfo, Signaller, SignallerEvent, SignallerFactory};
