//! Delivery of published events to downstream consumers (§5): a bounded,
//! per-connection ring buffer that the core enqueues into and a pool of
//! I/O workers drains asynchronously. The core never blocks on a full
//! buffer — the record is counted as missed and dropped instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// A published event record, as the pub-sub layer (`subscribe` / `publish`
/// in §6) hands it to the bus. The channel id is the small per-connection
/// bitset slot the dispatcher assigns.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub channel: u8,
    pub payload: Vec<u8>,
}

struct Inner {
    queue: VecDeque<PublishedEvent>,
    missed: u64,
    capacity: usize,
}

struct Slot {
    inner: Arc<Mutex<Inner>>,
    notify: watch::Sender<usize>,
}

/// Fan-out point the core publishes into. One slot per connected
/// subscriber; a full slot drops the newest record rather than blocking
/// the publisher.
#[derive(Default)]
pub struct EventBus {
    slots: Vec<Slot>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capacity: usize) -> EventReceiver {
        let inner = Arc::new(Mutex::new(Inner { queue: VecDeque::new(), missed: 0, capacity }));
        let (tx, rx) = watch::channel(0);
        self.slots.push(Slot { inner: inner.clone(), notify: tx });
        EventReceiver { inner, notify: rx }
    }

    /// Enqueues `event` onto every registered slot. Never blocks: a slot
    /// at capacity drops the event and bumps its missed-count instead.
    /// Returns the number of slots that actually received it.
    pub fn publish(&self, event: PublishedEvent) -> usize {
        let mut delivered = 0;
        for slot in &self.slots {
            let mut lock = slot.inner.lock().expect("eventbus mutex poisoned");
            if lock.queue.len() >= lock.capacity {
                lock.missed += 1;
                continue;
            }
            lock.queue.push_back(event.clone());
            let len = lock.queue.len();
            drop(lock);
            let _ = slot.notify.send(len);
            delivered += 1;
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.len()
    }
}

/// A single subscriber's receiving end. Cloning shares the underlying
/// queue (load-balances across clones), matching how a worker pool would
/// fan a connection's deliveries across its threads.
#[derive(Clone)]
pub struct EventReceiver {
    inner: Arc<Mutex<Inner>>,
    notify: watch::Receiver<usize>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<PublishedEvent> {
        loop {
            {
                let mut lock = self.inner.lock().expect("eventbus mutex poisoned");
                if let Some(ev) = lock.queue.pop_front() {
                    return Some(ev);
                }
            }
            if self.notify.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Number of records dropped for this subscriber since the last call.
    pub fn take_missed(&self) -> u64 {
        let mut lock = self.inner.lock().expect("eventbus mutex poisoned");
        std::mem::take(&mut lock.missed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn delivers_to_registered_subscriber() {
        let mut bus = EventBus::new();
        let mut rx = bus.register(4);
        assert_eq!(bus.publish(PublishedEvent { channel: 0, payload: vec![1] }), 1);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.payload, vec![1]);
    }

    #[test_log::test(tokio::test)]
    async fn drops_and_counts_when_full() {
        let mut bus = EventBus::new();
        let rx = bus.register(1);
        bus.publish(PublishedEvent { channel: 0, payload: vec![1] });
        bus.publish(PublishedEvent { channel: 0, payload: vec![2] });
        assert_eq!(rx.take_missed(), 1);
    }
}
