use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Typed fan-out of events to any number of listeners.
///
/// Every `subscribe()` call registers a fresh unbounded queue; dropping the
/// receiver unsubscribes it (the sender is pruned on the next `emit`).
#[derive(Debug)]
pub struct Emitter<T> {
    listeners: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Delivers `event` to every live listener and returns how many received it.
    pub fn emit(&self, event: T) -> usize {
        let mut guard = self.listeners.lock();
        guard.retain(|tx| tx.send(event.clone()).is_ok());
        guard.len()
    }

    pub fn listener_count(&self) -> usize {
        let mut guard = self.listeners.lock();
        guard.retain(|tx| !tx.is_closed());
        guard.len()
    }

    /// Drops every listener; their receivers observe the end of the stream.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let emitter = Emitter::new();
        let mut kept = emitter.subscribe();
        let dropped = emitter.subscribe();
        drop(dropped);

        assert_eq!(emitter.emit(7u32), 1);
        assert_eq!(kept.recv().await, Some(7));
    }

    #[tokio::test]
    async fn clear_ends_streams() {
        let emitter: Emitter<u32> = Emitter::new();
        let mut rx = emitter.subscribe();
        emitter.clear();
        assert_eq!(rx.recv().await, None);
        assert_eq!(emitter.listener_count(), 0);
    }
}
