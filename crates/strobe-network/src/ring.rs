//! Bounded lock-free MPMC ring
//!
//! A thin layer over `crossbeam`'s `ArrayQueue` that enforces the
//! power-of-two capacity the engine sizes its queues with and exposes the
//! free-slot probes the status line prints. Enqueue and dequeue are
//! lock-free; ownership of the queued value transfers with the operation.

use crossbeam::queue::ArrayQueue;

#[derive(Debug)]
pub struct Ring<T> {
    queue: ArrayQueue<T>,
    capacity: usize,
}

impl<T> Ring<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two; queue sizing is
    /// validated in the configuration long before this runs.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two, got {}",
            capacity
        );
        Self {
            queue: ArrayQueue::new(capacity),
            capacity,
        }
    }

    /// Returns the value back on a full ring
    pub fn push(&self, value: T) -> Result<(), T> {
        self.queue.push(value)
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.capacity - self.queue.len()
    }

    /// Free slots as a percentage, for the status line
    pub fn percent_free(&self) -> f64 {
        self.free_count() as f64 * 100.0 / self.capacity as f64
    }
}
