//! Bounded insertion-ordered queue with front eviction.
//!
//! [`BoundedQueue`] holds at most `capacity` elements. Pushing into a full
//! queue evicts the front element into the overflow callback before the new
//! element is admitted, so the element being pushed is never the one evicted
//! by its own push. The queue knows nothing about RPC; the owner decides what
//! eviction means.
//!
//! Mutation happens from a single logical thread of control, so there is no
//! internal locking.

use std::collections::VecDeque;

/// Callback invoked with each evicted element.
pub type OverflowFn<T> = Box<dyn FnMut(T) + Send>;

pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    overflow: OverflowFn<T>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue with the given capacity (must be non-zero).
    pub fn new(capacity: usize, overflow: OverflowFn<T>) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            overflow,
        }
    }

    /// Append at the back, evicting the front element first when full.
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            if let Some(evicted) = self.items.pop_front() {
                (self.overflow)(evicted);
            }
        }
        self.items.push_back(item);
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    pub fn first(&self) -> Option<&T> {
        self.items.front()
    }

    /// Remove and return the front element.
    pub fn shift(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("items", &self.items)
            .field("capacity", &self.capacity)
            .finish()
    }
}
