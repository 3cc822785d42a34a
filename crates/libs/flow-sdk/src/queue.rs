use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Capacity of each per-session queue.
pub const MAX_QUEUE_SIZE: usize = 128;

/// Fixed-capacity FIFO with drop-oldest overflow.
///
/// `push` never blocks: when the queue is already full the oldest entry is
/// evicted and logged. `pop` waits up to a timeout and returns `None` when
/// nothing arrived, which is a normal empty-poll result.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T: Debug> BoundedQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, item: T) {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        while items.len() >= self.capacity {
            if let Some(evicted) = items.pop_front() {
                log::warn!("queue({}): full, dropping oldest entry {:?}", self.name, evicted);
            }
        }
        items.push_back(item);
        drop(items);
        self.available.notify_one();
    }

    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let items = self.items.lock().expect("queue mutex poisoned");
        let (mut items, _) = self
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .expect("queue mutex poisoned");
        items.pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().expect("queue mutex poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards everything still buffered and returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        let dropped = items.len();
        items.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn overflow_keeps_the_newest_entries_in_order() {
        let queue = BoundedQueue::new("test");
        for value in 0..(MAX_QUEUE_SIZE + 40) {
            queue.push(value);
        }
        assert_eq!(queue.len(), MAX_QUEUE_SIZE);

        let drained = std::iter::from_fn(|| queue.try_pop()).collect::<Vec<_>>();
        let expected = (40..(MAX_QUEUE_SIZE + 40)).collect::<Vec<_>>();
        assert_eq!(drained, expected);
    }

    #[test]
    fn push_at_capacity_evicts_exactly_one() {
        let queue = BoundedQueue::with_capacity("small", 3);
        queue.push("a");
        queue.push("b");
        queue.push("c");
        queue.push("d");
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), Some("c"));
        assert_eq!(queue.try_pop(), Some("d"));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn pop_on_empty_returns_none_after_timeout() {
        let queue: BoundedQueue<u32> = BoundedQueue::new("empty");
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "blocked too long: {elapsed:?}");
    }

    #[test]
    fn pop_wakes_when_an_item_arrives() {
        let queue = Arc::new(BoundedQueue::new("wake"));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.push(7_u32);
            })
        };

        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_secs(5)), Some(7));
        assert!(started.elapsed() < Duration::from_secs(5));
        producer.join().unwrap();
    }

    #[test]
    fn clear_discards_buffered_entries() {
        let queue = BoundedQueue::new("clear");
        queue.push(1_u8);
        queue.push(2_u8);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
