//! Bounded, lossy sample queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::sample::Sample;

/// Last-N FIFO of samples shared between a worker and its consumers.
///
/// `push` never blocks: when the queue is full the oldest sample is
/// evicted. Taking is destructive; [`peek_latest`](Self::peek_latest) is
/// not.
#[derive(Debug, Clone)]
pub struct SampleQueue {
    inner: Arc<Mutex<VecDeque<Sample>>>,
    capacity: usize,
}

impl SampleQueue {
    /// Create a queue holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Sample>> {
        // A panic while holding the lock cannot leave the deque invalid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a sample, evicting the oldest if full.
    ///
    /// Returns the evicted sample, if any.
    pub fn push(&self, sample: Sample) -> Option<Sample> {
        let mut queue = self.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(sample);
        evicted
    }

    /// Remove and return the oldest sample without waiting.
    pub fn try_take(&self) -> Option<Sample> {
        self.lock().pop_front()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&self) -> Vec<Sample> {
        self.lock().drain(..).collect()
    }

    /// Copy of the newest sample.
    pub fn peek_latest(&self) -> Option<Sample> {
        self.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
