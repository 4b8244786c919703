//! In-process message ports.
//!
//! A [`MessageChannel`] yields two entangled [`MessagePort`]s: whatever one
//! side posts arrives at the other. Ports synthesized by a
//! [`crate::HandleMultiplexer`] are *virtual*: posting on them emits multiplex
//! frames instead of delivering locally. Either way, closing a port delivers a
//! single [`PortEvent::Close`] to the other side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::error::TransportError;

/// A duplex endpoint that only carries JSON values.
pub trait JsonPort: Send + Sync {
    fn post_message(&self, message: Value) -> Result<(), TransportError>;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Message(Value),
    Close,
}

/// Receives the traffic of virtual ports.
pub(crate) trait PortOutlet: Send + Sync {
    fn forward(&self, port_id: &str, payload: Value) -> Result<(), TransportError>;

    fn closed(&self, port_id: &str);
}

enum Sink {
    Entangled(Weak<PortInner>),
    Virtual {
        port_id: String,
        outlet: Weak<dyn PortOutlet>,
    },
}

struct PortInner {
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<PortEvent>>>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<PortEvent>>,
    sink: Sink,
    closed: AtomicBool,
}

impl PortInner {
    fn new(sink: Sink) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inbox_tx: Mutex::new(Some(tx)),
            inbox_rx: AsyncMutex::new(rx),
            sink,
            closed: AtomicBool::new(false),
        }
    }

    fn deliver(&self, event: PortEvent) {
        let mut inbox = self.inbox_tx.lock();
        match event {
            PortEvent::Message(_) => {
                if let Some(tx) = inbox.as_ref() {
                    let _ = tx.send(event);
                }
            }
            PortEvent::Close => {
                if self.closed.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(tx) = inbox.take() {
                    let _ = tx.send(PortEvent::Close);
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inbox_tx.lock().take();
        match &self.sink {
            Sink::Entangled(other) => {
                if let Some(other) = other.upgrade() {
                    other.deliver(PortEvent::Close);
                }
            }
            Sink::Virtual { port_id, outlet } => {
                if let Some(outlet) = outlet.upgrade() {
                    outlet.closed(port_id);
                }
            }
        }
    }
}

impl Drop for PortInner {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone)]
pub struct MessagePort {
    inner: Arc<PortInner>,
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("virtual_id", &self.virtual_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MessagePort {
    pub(crate) fn new_virtual(port_id: String, outlet: Weak<dyn PortOutlet>) -> Self {
        Self {
            inner: Arc::new(PortInner::new(Sink::Virtual { port_id, outlet })),
        }
    }

    pub fn post_message(&self, message: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        match &self.inner.sink {
            Sink::Entangled(other) => {
                let other = other.upgrade().ok_or(TransportError::ChannelClosed)?;
                other.deliver(PortEvent::Message(message));
                Ok(())
            }
            Sink::Virtual { port_id, outlet } => outlet
                .upgrade()
                .ok_or(TransportError::ChannelClosed)?
                .forward(port_id, message),
        }
    }

    /// Next event posted by the other side. `None` once this port is closed
    /// and its inbox drained.
    pub async fn recv_event(&self) -> Option<PortEvent> {
        self.inner.inbox_rx.lock().await.recv().await
    }

    /// Next message; `None` after a close from either side.
    pub async fn recv(&self) -> Option<Value> {
        match self.recv_event().await? {
            PortEvent::Message(value) => Some(value),
            PortEvent::Close => None,
        }
    }

    pub(crate) fn deliver(&self, event: PortEvent) {
        self.inner.deliver(event);
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The multiplex id of a virtual port.
    pub fn virtual_id(&self) -> Option<&str> {
        match &self.inner.sink {
            Sink::Virtual { port_id, .. } => Some(port_id.as_str()),
            Sink::Entangled(_) => None,
        }
    }

    pub fn same_port(&self, other: &MessagePort) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A pair of entangled ports.
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageChannel {
    pub fn new() -> Self {
        let mut second = None;
        let first = Arc::new_cyclic(|first_weak: &Weak<PortInner>| {
            let port2 = Arc::new(PortInner::new(Sink::Entangled(first_weak.clone())));
            let sink = Sink::Entangled(Arc::downgrade(&port2));
            second = Some(port2);
            PortInner::new(sink)
        });
        let second = second.unwrap_or_else(|| Arc::new(PortInner::new(Sink::Entangled(Weak::new()))));
        Self {
            port1: MessagePort { inner: first },
            port2: MessagePort { inner: second },
        }
    }
}
