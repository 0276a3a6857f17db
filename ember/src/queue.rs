// src/queue.rs
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::sync::lock_or_recover;

/// Fixed-capacity blocking FIFO.
///
/// `push` never blocks: a full queue wakes every waiter and reports
/// failure so the producer decides what to do. `pop` blocks until an item
/// arrives; `pop_timeout` gives up after the deadline. Shared by the async
/// log sink and the worker pool.
pub struct BlockQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    cond: Condvar,
}

impl<T> BlockQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "block queue capacity must be positive");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) -> bool {
        let mut items = lock_or_recover(&self.items);
        if items.len() >= self.capacity {
            self.cond.notify_all();
            return false;
        }
        items.push_back(item);
        self.cond.notify_all();
        true
    }

    pub fn pop(&self) -> T {
        let mut items = lock_or_recover(&self.items);
        loop {
            match items.pop_front() {
                Some(item) => return item,
                None => {
                    items = self
                        .cond
                        .wait(items)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let items = lock_or_recover(&self.items);
        let (mut items, _result) = self
            .cond
            .wait_timeout_while(items, timeout, |q| q.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        lock_or_recover(&self.items).clear();
    }
}

impl<T: Clone> BlockQueue<T> {
    pub fn front(&self) -> Option<T> {
        lock_or_recover(&self.items).front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        lock_or_recover(&self.items).back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = BlockQueue::new(4);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.front(), Some(1));
        assert_eq!(q.back(), Some(3));
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
    }

    #[test]
    fn push_past_capacity_fails() {
        let q = BlockQueue::new(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_timeout_expires() {
        let q: BlockQueue<u32> = BlockQueue::new(2);
        assert_eq!(q.pop_timeout(Duration::from_millis(20)), None);
        q.push(7);
        assert_eq!(q.pop_timeout(Duration::from_millis(20)), Some(7));
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(BlockQueue::new(1));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.push(42u32);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn clear_empties() {
        let q = BlockQueue::new(3);
        q.push(1);
        q.push(2);
        q.clear();
        assert!(q.is_empty());
        assert!(q.push(9));
    }

    #[test]
    #[should_panic]
    fn zero_capacity_is_fatal() {
        let _q: BlockQueue<u8> = BlockQueue::new(0);
    }
}
