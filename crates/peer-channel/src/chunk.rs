//! Fragmentation and reassembly over a size-limited data channel.
//!
//! Frame layout is `[message id][flags][payload]`. Flag bit 0 marks the last
//! chunk of a message, bit 1 marks a JSON body; binary bodies leave it clear.
//! Messages are sent strictly one after another, so chunks of different
//! messages never interleave on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelState, DataChannel, wait_for_drain};
use crate::config::{CHUNK_HEADER_LEN, ChunkConfig};
use crate::error::TransportError;
use crate::events::Emitter;
use crate::port::JsonPort;

pub const FLAG_LAST: u8 = 1 << 0;
pub const FLAG_JSON: u8 = 1 << 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub message_id: u8,
    pub last: bool,
    pub json: bool,
    pub payload: Bytes,
}

impl Chunk {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.last {
            flags |= FLAG_LAST;
        }
        if self.json {
            flags |= FLAG_JSON;
        }
        flags
    }
}

pub fn encode_chunk(chunk: &Chunk) -> Bytes {
    let mut frame = BytesMut::with_capacity(CHUNK_HEADER_LEN + chunk.payload.len());
    frame.put_u8(chunk.message_id);
    frame.put_u8(chunk.flags());
    frame.extend_from_slice(&chunk.payload);
    frame.freeze()
}

pub fn decode_chunk(frame: Bytes) -> Result<Chunk, ChunkError> {
    if frame.len() < CHUNK_HEADER_LEN {
        return Err(ChunkError::Malformed("frame shorter than header"));
    }
    let message_id = frame[0];
    let flags = frame[1];
    Ok(Chunk {
        message_id,
        last: flags & FLAG_LAST != 0,
        json: flags & FLAG_JSON != 0,
        payload: frame.slice(CHUNK_HEADER_LEN..),
    })
}

/// Splits a message body into wire frames. An empty body still yields one
/// frame, flagged last.
pub fn split_message(message_id: u8, json: bool, body: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    if body.is_empty() {
        return vec![encode_chunk(&Chunk {
            message_id,
            last: true,
            json,
            payload: Bytes::new(),
        })];
    }
    let total = body.len().div_ceil(chunk_size);
    (0..total)
        .map(|index| {
            let start = index * chunk_size;
            let end = (start + chunk_size).min(body.len());
            encode_chunk(&Chunk {
                message_id,
                last: index + 1 == total,
                json,
                payload: body.slice(start..end),
            })
        })
        .collect()
}

/// What a [`ChunkedTransport`] carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    fn encode(&self) -> Result<(bool, Bytes), serde_json::Error> {
        match self {
            Payload::Json(value) => Ok((true, Bytes::from(serde_json::to_vec(value)?))),
            Payload::Binary(bytes) => Ok((false, bytes.clone())),
        }
    }

    fn decode(json: bool, body: Bytes) -> Result<Self, serde_json::Error> {
        if json {
            Ok(Payload::Json(serde_json::from_slice(&body)?))
        } else {
            Ok(Payload::Binary(body))
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

#[derive(Debug, Default)]
struct Partial {
    chunks: Vec<Bytes>,
    bytes: usize,
    /// Set once the message outgrew the limit; the remaining chunks are
    /// swallowed until the last one.
    discarding: bool,
}

/// Reassembly buffers keyed by message id.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<u8, Partial>,
    max_message_bytes: usize,
}

/// A fully reassembled message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub message_id: u8,
    pub json: bool,
    pub body: Bytes,
}

impl Reassembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            partials: HashMap::new(),
            max_message_bytes,
        }
    }

    pub fn ingest(&mut self, chunk: Chunk) -> Result<Option<Reassembled>, ChunkError> {
        let Chunk {
            message_id,
            last,
            json,
            payload,
        } = chunk;

        let entry = self.partials.entry(message_id).or_default();
        if entry.discarding {
            if last {
                self.partials.remove(&message_id);
            }
            return Ok(None);
        }
        entry.bytes = entry.bytes.saturating_add(payload.len());
        if entry.bytes > self.max_message_bytes {
            let size = entry.bytes;
            if last {
                self.partials.remove(&message_id);
            } else {
                *entry = Partial {
                    discarding: true,
                    ..Partial::default()
                };
            }
            return Err(ChunkError::MessageTooLarge(size));
        }
        entry.chunks.push(payload);
        if !last {
            return Ok(None);
        }

        let Some(partial) = self.partials.remove(&message_id) else {
            return Err(ChunkError::Malformed("reassembly buffer vanished"));
        };
        let body = match partial.chunks.len() {
            1 => partial.chunks.into_iter().next().unwrap_or_default(),
            _ => {
                let mut combined = BytesMut::with_capacity(partial.bytes);
                for piece in &partial.chunks {
                    combined.extend_from_slice(piece);
                }
                combined.freeze()
            }
        };
        Ok(Some(Reassembled {
            message_id,
            json,
            body,
        }))
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

/// Arbitrarily large messages over one data channel, with send-side
/// backpressure.
pub struct ChunkedTransport {
    channel: Arc<dyn DataChannel>,
    outbound: mpsc::UnboundedSender<Payload>,
    inbound: Arc<Emitter<Payload>>,
    inbound_json: Arc<Emitter<Value>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChunkedTransport {
    pub fn new(channel: Arc<dyn DataChannel>, config: ChunkConfig) -> Self {
        let inbound = Arc::new(Emitter::new());
        let inbound_json = Arc::new(Emitter::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let frames = channel.subscribe();
        let receiver = tokio::spawn(run_receiver(
            frames,
            Reassembler::new(config.max_message_bytes),
            Arc::clone(&inbound),
            Arc::clone(&inbound_json),
            channel.label().to_string(),
        ));
        let sender = tokio::spawn(run_sender(Arc::clone(&channel), outbound_rx, config));

        Self {
            channel,
            outbound: outbound_tx,
            inbound,
            inbound_json,
            tasks: vec![sender, receiver],
        }
    }

    /// Queues a message. Messages are delivered in the order they are queued.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), TransportError> {
        self.outbound
            .send(payload.into())
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Payload> {
        self.inbound.subscribe()
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }
}

impl JsonPort for ChunkedTransport {
    fn post_message(&self, message: Value) -> Result<(), TransportError> {
        self.send(Payload::Json(message))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        self.inbound_json.subscribe()
    }
}

impl Drop for ChunkedTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_sender(
    channel: Arc<dyn DataChannel>,
    mut outbound: mpsc::UnboundedReceiver<Payload>,
    config: ChunkConfig,
) {
    let chunk_size = config.effective_chunk_size();
    channel
        .set_buffered_amount_low_threshold(config.low_water_mark)
        .await;

    let mut next_id: u8 = 0;
    while let Some(payload) = outbound.recv().await {
        let (json, body) = match payload.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(target = "peer_channel::chunk", error = %err, "failed to encode payload");
                continue;
            }
        };
        let message_id = next_id;
        next_id = next_id.wrapping_add(1);

        let frames = split_message(message_id, json, &body, chunk_size);
        trace!(
            target = "peer_channel::chunk",
            message_id,
            bytes = body.len(),
            chunks = frames.len(),
            "sending message"
        );
        for frame in frames {
            wait_for_drain(channel.as_ref(), config.low_water_mark).await;
            if channel.state() != ChannelState::Open {
                debug!(
                    target = "peer_channel::chunk",
                    message_id,
                    label = channel.label(),
                    "channel not open; dropping rest of message"
                );
                break;
            }
            if let Err(err) = channel.send(frame).await {
                debug!(
                    target = "peer_channel::chunk",
                    message_id,
                    error = %err,
                    "chunk send failed; dropping rest of message"
                );
                break;
            }
        }
    }
}

async fn run_receiver(
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    mut reassembler: Reassembler,
    inbound: Arc<Emitter<Payload>>,
    inbound_json: Arc<Emitter<Value>>,
    label: String,
) {
    while let Some(frame) = frames.recv().await {
        let len = frame.len();
        let chunk = match decode_chunk(frame) {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(target = "peer_channel::chunk", %label, len, error = %err, "dropping frame");
                continue;
            }
        };
        let message = match reassembler.ingest(chunk) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) => {
                warn!(target = "peer_channel::chunk", %label, error = %err, "discarding partial message");
                continue;
            }
        };
        match Payload::decode(message.json, message.body) {
            Ok(payload) => {
                if let Payload::Json(value) = &payload {
                    inbound_json.emit(value.clone());
                }
                inbound.emit(payload);
            }
            Err(err) => {
                warn!(
                    target = "peer_channel::chunk",
                    %label,
                    message_id = message.message_id,
                    error = %err,
                    "dropping message with invalid json"
                );
            }
        }
    }
    trace!(target = "peer_channel::chunk", %label, "inbound stream ended");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::{Notify, watch};

    use super::*;
    use crate::rtc::memory::MemoryChannel;

    /// Records frames and accumulates them as buffered until `drain()`.
    struct RecordingChannel {
        state: watch::Sender<ChannelState>,
        sent: Mutex<Vec<Bytes>>,
        buffered: AtomicUsize,
        threshold: AtomicUsize,
        drained: Notify,
    }

    impl RecordingChannel {
        fn new(state: ChannelState) -> Arc<Self> {
            Arc::new(Self {
                state: watch::Sender::new(state),
                sent: Mutex::new(Vec::new()),
                buffered: AtomicUsize::new(0),
                threshold: AtomicUsize::new(0),
                drained: Notify::new(),
            })
        }

        fn sent(&self) -> usize {
            self.sent.lock().len()
        }

        fn drain(&self) {
            self.buffered.store(0, Ordering::SeqCst);
            self.drained.notify_waiters();
        }
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> &str {
            "recording"
        }

        fn id(&self) -> u16 {
            1
        }

        fn state(&self) -> ChannelState {
            *self.state.borrow()
        }

        fn watch_state(&self) -> watch::Receiver<ChannelState> {
            self.state.subscribe()
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
            mpsc::unbounded_channel().1
        }

        async fn send(&self, data: Bytes) -> Result<(), TransportError> {
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
            self.sent.lock().push(data);
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
            self.threshold.store(threshold, Ordering::SeqCst);
        }

        fn buffer_drained(&self) -> &Notify {
            &self.drained
        }

        async fn close(&self) {
            self.state.send_replace(ChannelState::Closed);
            self.drained.notify_waiters();
        }
    }

    fn transport_pair(config: ChunkConfig) -> (ChunkedTransport, ChunkedTransport) {
        let (a, b) = MemoryChannel::pair("data");
        (
            ChunkedTransport::new(a, config),
            ChunkedTransport::new(b, config),
        )
    }

    #[test]
    fn header_codec() {
        let frame = encode_chunk(&Chunk {
            message_id: 0,
            last: true,
            json: true,
            payload: Bytes::from_static(b"{}"),
        });
        assert_eq!(&frame[..], &[0, FLAG_LAST | FLAG_JSON, b'{', b'}']);

        let chunk = decode_chunk(Bytes::from_static(&[9, 0, 1, 2])).unwrap();
        assert_eq!(chunk.message_id, 9);
        assert!(!chunk.last && !chunk.json);
        assert_eq!(&chunk.payload[..], &[1, 2]);

        assert_eq!(
            decode_chunk(Bytes::from_static(&[1])),
            Err(ChunkError::Malformed("frame shorter than header"))
        );
    }

    #[test]
    fn split_respects_chunk_size_and_empty_body() {
        let body = Bytes::from(vec![7u8; 1000]);
        let frames = split_message(3, false, &body, 256);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].len(), 256 + CHUNK_HEADER_LEN);
        assert_eq!(frames[3].len(), 1000 - 3 * 256 + CHUNK_HEADER_LEN);
        assert_eq!(frames[3][1] & FLAG_LAST, FLAG_LAST);
        assert!(frames[..3].iter().all(|frame| frame[1] & FLAG_LAST == 0));

        let empty = split_message(0, true, &Bytes::new(), 256);
        assert_eq!(empty.len(), 1);
        assert_eq!(&empty[0][..], &[0, FLAG_LAST | FLAG_JSON]);
    }

    #[test]
    fn reassembler_discards_oversized_messages() {
        let mut reassembler = Reassembler::new(4);
        let chunk = |last, payload: &'static [u8]| Chunk {
            message_id: 5,
            last,
            json: false,
            payload: Bytes::from_static(payload),
        };
        assert_eq!(reassembler.ingest(chunk(false, b"abc")), Ok(None));
        assert_eq!(
            reassembler.ingest(chunk(false, b"de")),
            Err(ChunkError::MessageTooLarge(5))
        );
        assert_eq!(reassembler.ingest(chunk(false, b"f")), Ok(None));
        assert_eq!(reassembler.ingest(chunk(true, b"gh")), Ok(None));
        assert_eq!(reassembler.pending(), 0);

        // The id is free again for the next message.
        assert_eq!(reassembler.ingest(chunk(false, b"o")), Ok(None));
        let done = reassembler.ingest(chunk(true, b"k")).unwrap().unwrap();
        assert_eq!(&done.body[..], b"ok");
    }

    #[tokio::test]
    async fn oversized_message_is_dropped_whole() {
        let config = ChunkConfig {
            chunk_size: 256,
            max_message_bytes: 600,
            ..ChunkConfig::default()
        };
        let (a, b) = MemoryChannel::pair("data");
        let sender = ChunkedTransport::new(a.clone(), config);
        let receiver = ChunkedTransport::new(b, config);
        let mut inbound = receiver.subscribe();

        sender.send(Bytes::from(vec![9u8; 1000])).unwrap();
        sender.send(json!("marker")).unwrap();

        assert_eq!(inbound.recv().await, Some(Payload::Json(json!("marker"))));
        assert_eq!(a.low_threshold(), config.low_water_mark);
    }

    #[tokio::test]
    async fn round_trips_small_and_large_messages() {
        let (a, b) = transport_pair(ChunkConfig::default());
        let mut inbound = b.subscribe();

        a.send(json!({ "hello": "world" })).unwrap();
        let body = "x".repeat(100_000);
        a.send(json!({ "body": body })).unwrap();
        a.send(json!(null)).unwrap();

        assert_eq!(inbound.recv().await, Some(Payload::Json(json!({ "hello": "world" }))));
        assert_eq!(inbound.recv().await, Some(Payload::Json(json!({ "body": body }))));
        assert_eq!(inbound.recv().await, Some(Payload::Json(json!(null))));
    }

    #[tokio::test]
    async fn preserves_order_with_custom_chunk_size() {
        let (a, b) = transport_pair(ChunkConfig::with_chunk_size(1000));
        let mut inbound = JsonPort::subscribe(&b);

        for index in 0..5 {
            let filler = "y".repeat(2500 * (5 - index));
            a.post_message(json!({ "index": index, "filler": filler })).unwrap();
        }
        for index in 0..5 {
            let value = inbound.recv().await.unwrap();
            assert_eq!(value["index"], json!(index));
        }
    }

    #[tokio::test]
    async fn binary_payloads_skip_json() {
        let (a, b) = transport_pair(ChunkConfig::with_chunk_size(256));
        let mut all = b.subscribe();
        let mut json_only = JsonPort::subscribe(&b);

        let blob = Bytes::from((0..=255u8).cycle().take(1000).collect::<Vec<_>>());
        a.send(blob.clone()).unwrap();
        a.send(json!(1)).unwrap();

        assert_eq!(all.recv().await, Some(Payload::Binary(blob)));
        assert_eq!(all.recv().await, Some(Payload::Json(json!(1))));
        assert_eq!(json_only.recv().await, Some(json!(1)));
    }

    #[tokio::test]
    async fn waits_for_drain_before_next_chunk() {
        let channel = RecordingChannel::new(ChannelState::Open);
        let config = ChunkConfig {
            chunk_size: 256,
            low_water_mark: 100,
            ..ChunkConfig::default()
        };
        let transport = ChunkedTransport::new(channel.clone(), config);
        transport.send(Bytes::from(vec![1u8; 600])).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.sent(), 1);
        assert_eq!(channel.threshold.load(Ordering::SeqCst), 100);

        channel.drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.sent(), 2);

        channel.drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.sent(), 3);
    }

    #[tokio::test]
    async fn closed_channel_drops_messages() {
        let channel = RecordingChannel::new(ChannelState::Closed);
        let transport = ChunkedTransport::new(channel.clone(), ChunkConfig::default());
        transport.send(json!({ "dropped": true })).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.sent(), 0);
    }
}
