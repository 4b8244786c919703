//! Port-handle multiplexing over a JSON-only channel.
//!
//! Transferred ports are replaced in-frame by `{"__stub__": portId}` and their
//! traffic is carried as `{"__mpx__": true, "portId", "payload"}` frames. The
//! receiving side swaps each stub for a virtual [`MessagePort`] and hands the
//! frame to the application with the resolved ports attached.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::events::Emitter;
use crate::port::{JsonPort, MessagePort, PortEvent, PortOutlet};

const MPX_KEY: &str = "__mpx__";
const STUB_KEY: &str = "__stub__";
const TRANSFER_KEY: &str = "__transfer__";

/// A frame together with the ports it references. `{"__transfer__": n}`
/// inside `data` refers to `ports[n]`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub data: Value,
    pub ports: Vec<MessagePort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MuxFrame {
    #[serde(rename = "__mpx__")]
    mpx: bool,
    #[serde(rename = "portId")]
    port_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    close: bool,
}

impl MuxFrame {
    fn message(port_id: &str, payload: Value) -> Self {
        Self {
            mpx: true,
            port_id: port_id.to_string(),
            payload: Some(payload),
            close: false,
        }
    }

    fn close(port_id: &str) -> Self {
        Self {
            mpx: true,
            port_id: port_id.to_string(),
            payload: None,
            close: true,
        }
    }
}

#[derive(Clone)]
enum Handle {
    /// A port the local application transferred; its traffic is tapped.
    Transferred(MessagePort),
    /// Synthesized for a remote stub; no local backing.
    Virtual(MessagePort),
}

impl Handle {
    fn port(&self) -> &MessagePort {
        match self {
            Handle::Transferred(port) | Handle::Virtual(port) => port,
        }
    }
}

#[derive(Clone)]
pub struct HandleMultiplexer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    me: Weak<MuxInner>,
    phys: Arc<dyn JsonPort>,
    table: Mutex<HashMap<String, Handle>>,
    inbound: Emitter<Envelope>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HandleMultiplexer {
    pub fn new(phys: Arc<dyn JsonPort>) -> Self {
        let mut frames = phys.subscribe();
        let inner = Arc::new_cyclic(|me| MuxInner {
            me: me.clone(),
            phys,
            table: Mutex::new(HashMap::new()),
            inbound: Emitter::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let Some(mux) = weak.upgrade() else {
                    break;
                };
                mux.on_inbound(frame);
            }
        });
        inner.tasks.lock().push(reader);

        Self { inner }
    }

    /// Posts `data`, replacing each `{"__transfer__": n}` with a stub for
    /// `transfer[n]` and forwarding that port's traffic from then on.
    pub fn post_message(
        &self,
        data: Value,
        transfer: Vec<MessagePort>,
    ) -> Result<(), TransportError> {
        self.inner.post_message(data, transfer)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        self.inner.inbound.subscribe()
    }

    /// Number of live handles in the table.
    pub fn handle_count(&self) -> usize {
        self.inner.table.lock().len()
    }
}

impl MuxInner {
    fn post_message(&self, data: Value, transfer: Vec<MessagePort>) -> Result<(), TransportError> {
        if transfer.is_empty() {
            return self.phys.post_message(data);
        }

        let ids: Vec<String> = transfer
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        let patched = stub_transfers(data, &ids)?;
        {
            let mut table = self.table.lock();
            for (id, port) in ids.iter().zip(&transfer) {
                table.insert(id.clone(), Handle::Transferred(port.clone()));
            }
        }
        self.phys.post_message(patched)?;

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        for (id, port) in ids.into_iter().zip(transfer) {
            trace!(target = "peer_channel::mux", port_id = %id, "forwarding transferred port");
            tasks.push(tokio::spawn(forward_port(self.me.clone(), id, port)));
        }
        Ok(())
    }

    fn post_frame(&self, frame: &MuxFrame) -> Result<(), TransportError> {
        self.phys.post_message(serde_json::to_value(frame)?)
    }

    fn on_inbound(&self, value: Value) {
        if value.get(MPX_KEY) == Some(&Value::Bool(true)) {
            match MuxFrame::deserialize(&value) {
                Ok(frame) => self.route(frame),
                Err(err) => {
                    warn!(target = "peer_channel::mux", error = %err, "dropping malformed multiplex frame");
                }
            }
            return;
        }

        let mut ports = Vec::new();
        let data = self.revive(value, &mut ports);
        self.inbound.emit(Envelope { data, ports });
    }

    fn route(&self, frame: MuxFrame) {
        let handle = if frame.close {
            self.table.lock().remove(&frame.port_id)
        } else {
            self.table.lock().get(&frame.port_id).cloned()
        };
        let Some(handle) = handle else {
            trace!(target = "peer_channel::mux", port_id = %frame.port_id, "frame for unknown port");
            return;
        };

        if frame.close {
            debug!(target = "peer_channel::mux", port_id = %frame.port_id, "remote closed port");
            match handle {
                Handle::Transferred(port) => port.close(),
                Handle::Virtual(port) => port.deliver(PortEvent::Close),
            }
            return;
        }

        let payload = frame.payload.unwrap_or(Value::Null);
        match handle {
            Handle::Transferred(port) => {
                if let Err(err) = port.post_message(payload) {
                    debug!(target = "peer_channel::mux", port_id = %frame.port_id, error = %err, "transferred port rejected message");
                }
            }
            Handle::Virtual(port) => port.deliver(PortEvent::Message(payload)),
        }
    }

    fn revive(&self, value: Value, ports: &mut Vec<MessagePort>) -> Value {
        match value {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.revive(item, ports))
                    .collect(),
            ),
            Value::Object(map) => {
                if let Some(Value::String(id)) = map.get(STUB_KEY) {
                    let port = self.resolve(id);
                    ports.push(port);
                    return json!({ TRANSFER_KEY: ports.len() - 1 });
                }
                Value::Object(
                    map.into_iter()
                        .map(|(key, item)| (key, self.revive(item, ports)))
                        .collect::<Map<_, _>>(),
                )
            }
            other => other,
        }
    }

    fn resolve(&self, id: &str) -> MessagePort {
        let mut table = self.table.lock();
        if let Some(handle) = table.get(id) {
            return handle.port().clone();
        }
        let outlet: Weak<dyn PortOutlet> = self.me.clone();
        let port = MessagePort::new_virtual(id.to_string(), outlet);
        table.insert(id.to_string(), Handle::Virtual(port.clone()));
        trace!(target = "peer_channel::mux", port_id = %id, "created virtual port");
        port
    }
}

impl PortOutlet for MuxInner {
    fn forward(&self, port_id: &str, payload: Value) -> Result<(), TransportError> {
        self.post_frame(&MuxFrame::message(port_id, payload))
    }

    fn closed(&self, port_id: &str) {
        self.table.lock().remove(port_id);
        if let Err(err) = self.post_frame(&MuxFrame::close(port_id)) {
            debug!(target = "peer_channel::mux", port_id, error = %err, "failed to post close frame");
        }
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn forward_port(mux: Weak<MuxInner>, port_id: String, port: MessagePort) {
    while let Some(event) = port.recv_event().await {
        let Some(mux) = mux.upgrade() else {
            return;
        };
        match event {
            PortEvent::Message(payload) => {
                if let Err(err) = mux.forward(&port_id, payload) {
                    debug!(target = "peer_channel::mux", port_id = %port_id, error = %err, "failed to forward port message");
                }
            }
            PortEvent::Close => {
                mux.closed(&port_id);
                return;
            }
        }
    }
}

/// Replaces `{"__transfer__": n}` markers with `{"__stub__": ids[n]}`.
fn stub_transfers(value: Value, ids: &[String]) -> Result<Value, TransportError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| stub_transfers(item, ids))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(index) = map.get(TRANSFER_KEY).and_then(Value::as_u64) {
                    let id = usize::try_from(index)
                        .ok()
                        .and_then(|index| ids.get(index))
                        .ok_or_else(|| {
                            TransportError::Protocol(format!(
                                "transfer index {index} out of range ({} ports)",
                                ids.len()
                            ))
                        })?;
                    return Ok(json!({ STUB_KEY: id }));
                }
            }
            map.into_iter()
                .map(|(key, item)| stub_transfers(item, ids).map(|item| (key, item)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object)
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MessageChannel;

    /// Two JSON ports wired back to back.
    struct Loopback {
        peer: Mutex<Weak<Loopback>>,
        inbound: Emitter<Value>,
        posted: Mutex<Vec<Value>>,
    }

    impl Loopback {
        fn pair() -> (Arc<Self>, Arc<Self>) {
            let make = || {
                Arc::new(Self {
                    peer: Mutex::new(Weak::new()),
                    inbound: Emitter::new(),
                    posted: Mutex::new(Vec::new()),
                })
            };
            let (a, b) = (make(), make());
            *a.peer.lock() = Arc::downgrade(&b);
            *b.peer.lock() = Arc::downgrade(&a);
            (a, b)
        }
    }

    impl JsonPort for Loopback {
        fn post_message(&self, message: Value) -> Result<(), TransportError> {
            self.posted.lock().push(message.clone());
            let peer = self.peer.lock().upgrade().ok_or(TransportError::ChannelClosed)?;
            peer.inbound.emit(message);
            Ok(())
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
            self.inbound.subscribe()
        }
    }

    fn mux_pair() -> (HandleMultiplexer, HandleMultiplexer, Arc<Loopback>) {
        let (a, b) = Loopback::pair();
        (
            HandleMultiplexer::new(a.clone()),
            HandleMultiplexer::new(b),
            a,
        )
    }

    #[test]
    fn stubs_replace_transfer_markers() {
        let ids = vec!["p0".to_string(), "p1".to_string()];
        let data = json!({ "args": [{ "__transfer__": 1 }, { "x": { "__transfer__": 0 } }] });
        assert_eq!(
            stub_transfers(data, &ids).unwrap(),
            json!({ "args": [{ "__stub__": "p1" }, { "x": { "__stub__": "p0" } }] })
        );
        assert!(matches!(
            stub_transfers(json!([{ "__transfer__": 2 }]), &ids),
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn plain_frames_pass_through_unchanged() {
        let (a, b, phys) = mux_pair();
        let mut inbound = b.subscribe();
        let frame = json!({ "id": 1, "args": [{ "__transfer__": 0 }] });
        a.post_message(frame.clone(), Vec::new()).unwrap();

        let envelope = inbound.recv().await.unwrap();
        assert_eq!(envelope.data, frame);
        assert!(envelope.ports.is_empty());
        assert_eq!(phys.posted.lock().as_slice(), &[frame]);
    }

    #[tokio::test]
    async fn transferred_port_round_trip() {
        let (a, b, phys) = mux_pair();
        let mut inbound = b.subscribe();
        let MessageChannel { port1, port2 } = MessageChannel::new();

        a.post_message(json!({ "callback": { "__transfer__": 0 } }), vec![port2])
            .unwrap();
        let Envelope { data, ports } = inbound.recv().await.unwrap();
        assert_eq!(data, json!({ "callback": { "__transfer__": 0 } }));
        let remote = ports.into_iter().next().unwrap();
        let port_id = remote.virtual_id().unwrap().to_string();
        assert_eq!(
            phys.posted.lock()[0],
            json!({ "callback": { "__stub__": port_id } })
        );

        remote.post_message(json!(42)).unwrap();
        assert_eq!(port1.recv().await, Some(json!(42)));

        port1.post_message(json!("ack")).unwrap();
        assert_eq!(remote.recv().await, Some(json!("ack")));
    }

    #[tokio::test]
    async fn same_stub_resolves_to_same_port() {
        let (a, b, _phys) = mux_pair();
        let mut inbound = b.subscribe();
        let MessageChannel { port1: _keep, port2 } = MessageChannel::new();
        a.post_message(json!([{ "__transfer__": 0 }]), vec![port2]).unwrap();
        let first = inbound.recv().await.unwrap().ports.remove(0);

        let stub = json!({ "__stub__": first.virtual_id().unwrap() });
        b.inner.on_inbound(json!({ "again": stub }));
        let second = inbound.recv().await.unwrap().ports.remove(0);
        assert!(first.same_port(&second));
        assert_eq!(b.handle_count(), 1);
    }

    #[tokio::test]
    async fn unknown_port_frames_are_ignored() {
        let (_a, b, _phys) = mux_pair();
        b.inner
            .on_inbound(json!({ "__mpx__": true, "portId": "nope", "payload": 1 }));
        b.inner
            .on_inbound(json!({ "__mpx__": true, "portId": "nope", "close": true }));
        assert_eq!(b.handle_count(), 0);
    }
}
