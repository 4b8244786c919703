use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, mpsc, watch};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closing | ChannelState::Closed)
    }
}

/// One reliable, ordered, size-limited sub-channel of a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn id(&self) -> u16;

    fn state(&self) -> ChannelState;

    fn watch_state(&self) -> watch::Receiver<ChannelState>;

    /// Registers a listener for inbound messages. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes>;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Woken whenever the buffered amount falls to the low threshold and when
    /// the channel closes.
    fn buffer_drained(&self) -> &Notify;

    async fn close(&self);
}

/// Suspends until `channel` has at most `low_water_mark` bytes buffered or is
/// no longer open.
pub async fn wait_for_drain(channel: &dyn DataChannel, low_water_mark: usize) {
    loop {
        let drained = channel.buffer_drained().notified();
        tokio::pin!(drained);
        drained.as_mut().enable();
        if channel.state() != ChannelState::Open {
            return;
        }
        if channel.buffered_amount().await <= low_water_mark {
            return;
        }
        drained.await;
    }
}
