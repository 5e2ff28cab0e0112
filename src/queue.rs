use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded FIFO buffering outbound operations while no peer is reachable.
///
/// `enqueue` reports rejection instead of blocking when the buffer is full;
/// delivery is at-least-once, so receivers must be idempotent.
pub struct OfflineQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> OfflineQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Returns false when the queue is full; the item is dropped by the caller.
    pub fn enqueue(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    pub fn dequeue(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Removes and returns up to `max` items in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock().unwrap();
        let take = max.min(items.len());
        items.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}
