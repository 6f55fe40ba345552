//! Bounded reordering queue.
//!
//! A min-heap on `OrderingKey` with a hard capacity. When full, the oldest
//! pending frame (smallest key) is evicted to make room, so under sustained
//! overload the queue holds the most recent frames rather than the backlog.
//! Frames sharing a key pop in insertion order.

use anyhow::{anyhow, Result};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::frame::{Frame, OrderingKey};

/// Result of `ReorderingQueue::try_push`.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; this frame was removed to admit the new one.
    Evicted(Frame),
}

impl PushOutcome {
    pub fn evicted(&self) -> bool {
        matches!(self, PushOutcome::Evicted(_))
    }
}

struct Entry {
    key: OrderingKey,
    seq: u64,
    frame: Frame,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct ReorderingQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    capacity: usize,
    next_seq: u64,
}

impl ReorderingQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("queue capacity must be greater than zero"));
        }
        Ok(Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
            next_seq: 0,
        })
    }

    /// Insert a frame, evicting the current minimum if the queue is full.
    ///
    /// The incoming frame is never rejected.
    pub fn try_push(&mut self, frame: Frame) -> PushOutcome {
        let outcome = if self.heap.len() >= self.capacity {
            match self.heap.pop() {
                Some(Reverse(oldest)) => PushOutcome::Evicted(oldest.frame),
                None => PushOutcome::Queued,
            }
        } else {
            PushOutcome::Queued
        };

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse(Entry {
            key: frame.key(),
            seq,
            frame,
        }));
        outcome
    }

    /// Remove and return the frame with the smallest key.
    pub fn pop_min(&mut self) -> Option<Frame> {
        self.heap.pop().map(|Reverse(entry)| entry.frame)
    }

    pub fn peek_key(&self) -> Option<OrderingKey> {
        self.heap.peek().map(|Reverse(entry)| entry.key)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeader;
    use serde_json::json;

    fn make_frame(acquisition: u64, frame_num: u64, tag: &str) -> Frame {
        let header = FrameHeader::from_value(json!({ "frame_num": frame_num, "tag": tag })).unwrap();
        Frame::new(
            OrderingKey::new(acquisition, frame_num),
            header,
            tag.as_bytes().to_vec(),
        )
    }

    fn drain_keys(queue: &mut ReorderingQueue) -> Vec<OrderingKey> {
        std::iter::from_fn(|| queue.pop_min().map(|f| f.key())).collect()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(ReorderingQueue::new(0).is_err());
    }

    #[test]
    fn pops_in_key_order_regardless_of_push_order() {
        let mut queue = ReorderingQueue::new(10).unwrap();
        for i in (0..10).rev() {
            assert!(!queue.try_push(make_frame(0, i, "a")).evicted());
        }
        let keys = drain_keys(&mut queue);
        let expected: Vec<_> = (0..10).map(|i| OrderingKey::new(0, i)).collect();
        assert_eq!(keys, expected);
        assert!(queue.pop_min().is_none());
    }

    #[test]
    fn acquisition_dominates_frame_number() {
        let mut queue = ReorderingQueue::new(4).unwrap();
        queue.try_push(make_frame(1, 0, "a"));
        queue.try_push(make_frame(0, 50, "a"));
        queue.try_push(make_frame(1, 2, "a"));
        assert_eq!(
            drain_keys(&mut queue),
            vec![
                OrderingKey::new(0, 50),
                OrderingKey::new(1, 0),
                OrderingKey::new(1, 2)
            ]
        );
    }

    #[test]
    fn full_queue_evicts_minimum() {
        let mut queue = ReorderingQueue::new(3).unwrap();
        for i in 0..3 {
            queue.try_push(make_frame(0, i, "a"));
        }
        match queue.try_push(make_frame(0, 3, "a")) {
            PushOutcome::Evicted(frame) => assert_eq!(frame.key(), OrderingKey::new(0, 0)),
            PushOutcome::Queued => panic!("expected eviction"),
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_key(), Some(OrderingKey::new(0, 1)));
    }

    #[test]
    fn full_queue_admits_even_older_frame() {
        let mut queue = ReorderingQueue::new(2).unwrap();
        queue.try_push(make_frame(0, 5, "a"));
        queue.try_push(make_frame(0, 6, "a"));
        let outcome = queue.try_push(make_frame(0, 1, "a"));
        assert!(outcome.evicted());
        assert_eq!(
            drain_keys(&mut queue),
            vec![OrderingKey::new(0, 1), OrderingKey::new(0, 6)]
        );
    }

    #[test]
    fn equal_keys_pop_in_insertion_order() {
        let mut queue = ReorderingQueue::new(4).unwrap();
        queue.try_push(make_frame(0, 2, "first"));
        queue.try_push(make_frame(0, 1, "x"));
        queue.try_push(make_frame(0, 2, "second"));
        queue.pop_min();
        let a = queue.pop_min().unwrap();
        let b = queue.pop_min().unwrap();
        assert_eq!(a.payload(), b"first");
        assert_eq!(b.payload(), b"second");
    }

    #[test]
    fn len_never_exceeds_capacity() {
        let mut queue = ReorderingQueue::new(5).unwrap();
        for i in 0..50 {
            queue.try_push(make_frame(i % 3, i, "a"));
            assert!(queue.len() <= queue.capacity());
        }
        assert_eq!(queue.len(), 5);
    }
}
