use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Bounded FIFO queue with drop-oldest backpressure and terminate/reset semantics.
///
/// Mirrors the mutex+condvar queue used on the capture side of the pipeline,
/// but shaped for safe sharing across threads via `Arc`.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    terminated: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                terminated: false,
            }),
            cv: Condvar::new(),
            capacity,
        })
    }

    /// Push an item. If the queue is full, the oldest item is dropped and a
    /// count of dropped items is returned (0 or 1).
    pub fn push(&self, item: T) -> usize {
        let mut guard = self.inner.lock().unwrap();
        if guard.terminated {
            return 0;
        }
        let mut dropped = 0;
        if guard.items.len() >= self.capacity {
            guard.items.pop_front();
            dropped = 1;
        }
        guard.items.push_back(item);
        drop(guard);
        self.cv.notify_one();
        dropped
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        guard.items.pop_front()
    }

    /// Blocking pop with a timeout; returns `None` on timeout or once the
    /// queue is terminated and drained.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                return Some(item);
            }
            if guard.terminated {
                return None;
            }
            let (new_guard, result) = self.cv.wait_timeout(guard, timeout).unwrap();
            guard = new_guard;
            if result.timed_out() && guard.items.is_empty() {
                return None;
            }
        }
    }

    /// Wake all waiters and cause future pops on an empty queue to return `None`.
    pub fn terminate(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.terminated = true;
        drop(guard);
        self.cv.notify_all();
    }

    /// Empty the queue and clear the terminated flag.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.items.clear();
        guard.terminated = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().unwrap().terminated
    }
}

pub type AudioQueue = BoundedQueue<crate::types::AudioFrame>;
pub type ResultQueue = BoundedQueue<crate::types::RecognitionResult>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_pop_fifo() {
        let q: Arc<BoundedQueue<i32>> = BoundedQueue::new(4);
        q.push(1);
        q.push(2);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn drop_oldest_on_overflow() {
        let q: Arc<BoundedQueue<i32>> = BoundedQueue::new(2);
        q.push(1);
        q.push(2);
        let dropped = q.push(3);
        assert_eq!(dropped, 1);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
    }

    #[test]
    fn terminate_wakes_waiters() {
        let q: Arc<BoundedQueue<i32>> = BoundedQueue::new(4);
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop_wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        q.terminate();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn reset_reactivates() {
        let q: Arc<BoundedQueue<i32>> = BoundedQueue::new(4);
        q.terminate();
        assert!(q.is_terminated());
        q.reset();
        assert!(!q.is_terminated());
        q.push(5);
        assert_eq!(q.try_pop(), Some(5));
    }
}
