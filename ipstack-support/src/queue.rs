//! Fixed-capacity ring-buffer queue shared by the IP egress path and the
//! per-socket receive queues.
//!
//! Push never overwrites: it returns `false` when full, so a caller can
//! distinguish "backpressure" from "accepted".

use std::fmt;

pub struct BoundedQueue<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let slots = std::iter::repeat_with(|| None).take(capacity).collect();
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Push an item to the tail. Returns `false` if the queue is full.
    pub fn push(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        let cap = self.capacity();
        if cap == 0 {
            return false;
        }
        let tail = (self.head + self.len) % cap;
        self.slots[tail] = Some(item);
        self.len += 1;
        true
    }

    /// Pop an item from the head.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let idx = self.head;
        self.head = (self.head + 1) % cap;
        self.len -= 1;
        self.slots[idx].take()
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            let _ = slot.take();
        }
        self.head = 0;
        self.len = 0;
    }

    /// Capacity left before the next `push` would be rejected. Holds the
    /// round-trip law `len() + rest_capacity() == capacity()`.
    pub fn rest_capacity(&self) -> usize {
        self.capacity() - self.len
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Push as many of `items` as fit, front to back. Returns the number
    /// accepted; a short count means the rest was rejected, not buffered.
    pub fn push_many(&mut self, items: &[T]) -> usize {
        let mut accepted = 0;
        for item in items {
            if !self.push(item.clone()) {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Pop up to `max` items in FIFO order.
    pub fn pop_many(&mut self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.len));
        while out.len() < max {
            match self.pop() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_wraparound() {
        let mut q = BoundedQueue::new(3);
        assert!(q.push(1));
        assert!(q.push(2));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(3));
        assert!(q.push(4));
        assert!(!q.push(5), "queue should reject past capacity");
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_many_rejects_past_capacity_and_rest_capacity_law_holds() {
        let mut q: BoundedQueue<u8> = BoundedQueue::new(4);
        assert_eq!(q.push_many(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(q.len() + q.rest_capacity(), q.capacity());
        assert_eq!(q.rest_capacity(), 0);
        assert_eq!(q.pop_many(2), vec![1, 2]);
        assert_eq!(q.len() + q.rest_capacity(), q.capacity());
        assert_eq!(q.pop_many(10), vec![3, 4]);
        assert!(q.is_empty());
    }
}
