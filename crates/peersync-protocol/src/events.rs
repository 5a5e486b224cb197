use std::collections::HashMap;

use tokio::sync::mpsc;

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 10;

/// Opaque handle returned by [`EventEmitter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Best-effort fan-out of events to subscribers.
///
/// Emitting never blocks: a subscriber whose buffer is full misses the event,
/// and a subscriber whose receiver was dropped is removed.
pub struct EventEmitter<T> {
    inner: parking_lot::Mutex<Subscribers<T>>,
    buffer: usize,
}

struct Subscribers<T> {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<T>>,
}

impl<T: Clone> EventEmitter<T> {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Subscribers {
                next_id: 1,
                senders: HashMap::new(),
            }),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.senders.insert(id, tx);
        (SubscriptionId(id), rx)
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().senders.remove(&id.0).is_some()
    }

    pub fn emit(&self, event: T) {
        let mut inner = self.inner.lock();
        inner.senders.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("event subscriber {id} is full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn clear(&self) {
        self.inner.lock().senders.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().senders.len()
    }
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_every_subscriber() {
        let emitter = EventEmitter::new(4);
        let (_a, mut rx_a) = emitter.subscribe();
        let (_b, mut rx_b) = emitter.subscribe();
        emitter.emit(42u32);
        assert_eq!(rx_a.recv().await, Some(42));
        assert_eq!(rx_b.recv().await, Some(42));
    }

    #[test]
    fn full_subscriber_drops_events() {
        let emitter = EventEmitter::new(2);
        let (_id, mut rx) = emitter.subscribe();
        for i in 0..5u32 {
            emitter.emit(i);
        }
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(emitter.subscriber_count(), 1);
    }

    #[test]
    fn unsubscribe_and_dropped_receivers() {
        let emitter = EventEmitter::<u32>::new(2);
        let (id, _rx) = emitter.subscribe();
        let (_other, other_rx) = emitter.subscribe();
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        drop(other_rx);
        emitter.emit(1);
        assert_eq!(emitter.subscriber_count(), 0);
    }
}
