use std::collections::VecDeque;

use serde::{Serialize, Serializer};

/// Fixed-capacity FIFO buffer that evicts the oldest entry on overflow
#[derive(Clone, Debug, PartialEq)]
pub struct RingBuffer<T> {
    /// Internal storage, oldest entry at the front
    entries: VecDeque<T>,

    /// Maximum capacity
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a new entry, evicting oldest if at capacity
    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Iterate entries oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Most recently pushed entry
    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// All entries in insertion order
    pub fn data(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_keeps_last_capacity_items_in_order() {
        let mut ring = RingBuffer::new(300);
        for i in 0..307 {
            ring.push(i);
        }

        let data = ring.data();
        assert_eq!(data.len(), 300);
        assert_eq!(data.first(), Some(&7));
        assert_eq!(data.last(), Some(&306));
        assert!(data.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_partial_fill() {
        let mut ring = RingBuffer::new(4);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.data(), vec!["a", "b"]);
        assert_eq!(ring.last(), Some(&"b"));
    }

    #[test]
    fn test_zero_capacity_drops_everything() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_serializes_as_sequence() {
        let mut ring = RingBuffer::new(2);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(serde_json::to_string(&ring).unwrap(), "[2,3]");
    }
}
