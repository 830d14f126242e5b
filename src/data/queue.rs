//! Bounded blocking work queue.
//!
//! `push` blocks while the queue holds `bound` items, which keeps the
//! number of in-flight data blocks bounded. `pop` blocks while the queue is
//! empty. After [`BoundedWorkQueue::finish`], pushes are refused and `pop`
//! returns `None` once the remaining items are drained.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Debug)]
pub struct BoundedWorkQueue<T> {
    bound: usize,
    state: Mutex<QueueState<T>>,
    pushed: Condvar,
    popped: Condvar,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    finished: bool,
}

impl<T> BoundedWorkQueue<T> {
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            bound,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(bound),
                finished: false,
            }),
            pushed: Condvar::new(),
            popped: Condvar::new(),
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Enqueue `item`, waiting for room. Hands the item back if the queue
    /// was finished.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.finished && state.items.len() >= self.bound {
            state = self
                .popped
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.finished {
            return Err(item);
        }
        state.items.push_back(item);
        self.pushed.notify_all();
        Ok(())
    }

    /// Dequeue the oldest item, waiting for one. `None` means finished and
    /// drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(item) = state.items.pop_front() {
                self.popped.notify_all();
                return Some(item);
            }
            if state.finished {
                return None;
            }
            state = self
                .pushed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting work and wake every waiter.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.finished = true;
        self.pushed.notify_all();
        self.popped.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_backpressure_blocks_producer() {
        let queue = Arc::new(BoundedWorkQueue::new(2));
        let pushed = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                for job in 0..10u32 {
                    queue.push(job).unwrap();
                    pushed.fetch_add(1, Ordering::SeqCst);
                }
                queue.finish();
            })
        };

        // Nobody is consuming yet: the producer stalls with two outstanding.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 2);

        let mut seen = Vec::new();
        while let Some(job) = queue.pop() {
            assert!(queue.len() <= 2);
            seen.push(job);
            thread::sleep(Duration::from_millis(5));
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(pushed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_finish_wakes_idle_consumers() {
        let queue: Arc<BoundedWorkQueue<u8>> = Arc::new(BoundedWorkQueue::new(4));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.finish();
        for c in consumers {
            assert_eq!(c.join().unwrap(), None);
        }
    }

    #[test]
    fn test_push_after_finish_is_refused() {
        let queue = BoundedWorkQueue::new(1);
        queue.push(1).unwrap();
        queue.finish();
        assert_eq!(queue.push(2), Err(2));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_each_item_delivered_once_across_workers() {
        let queue = Arc::new(BoundedWorkQueue::new(3));
        let total = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(job) = queue.pop() {
                        total.fetch_add(job, Ordering::SeqCst);
                        mine.push(job);
                    }
                    mine
                })
            })
            .collect();
        for job in 1..=100usize {
            queue.push(job).unwrap();
        }
        queue.finish();

        let mut all: Vec<usize> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());
        assert_eq!(total.load(Ordering::SeqCst), 5050);
    }
}
