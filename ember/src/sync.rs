// src/sync.rs
use std::sync::{Condvar, Mutex, MutexGuard};

/// Counting semaphore over the std mutex/condvar pair.
///
/// `wait` blocks until the count is positive and decrements it; `post`
/// increments and wakes one waiter. The store pool and the work queue are
/// the only users, neither needs re-entrancy.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = lock_or_recover(&self.count);
        while *count == 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(|e| e.into_inner());
        }
        *count -= 1;
    }

    pub fn post(&self) {
        let mut count = lock_or_recover(&self.count);
        *count += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> usize {
        *lock_or_recover(&self.count)
    }
}

/// A poisoned lock means another thread panicked mid-update; the protected
/// counters here are plain integers, so the value itself is still sound.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn counts_down_and_up() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        assert_eq!(sem.available(), 0);
        sem.post();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            sem2.wait();
            true
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        sem.post();
        assert!(handle.join().unwrap());
    }
}
