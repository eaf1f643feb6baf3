//! Arena-backed bounded min-heap keyed by capture timestamp
//!
//! The heap stores ops in a slot arena and orders slot indices in a
//! separate vector, making the capacity/latency trade-off of bounded
//! reordering an explicit, testable parameter rather than a property of a
//! library container. Ties on timestamp break by arrival sequence so the
//! emitted order is deterministic.

use crate::playback::format::RecordedOp;
use chrono::{DateTime, Utc};

struct Slot {
    op: RecordedOp,
    /// Arrival sequence, the timestamp tie-breaker
    arrival: u64,
}

/// Min-heap over (seen timestamp, arrival sequence)
pub struct OrderHeap {
    arena: Vec<Option<Slot>>,
    free: Vec<usize>,
    heap: Vec<usize>,
    next_arrival: u64,
}

impl OrderHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: Vec::with_capacity(capacity),
            free: Vec::new(),
            heap: Vec::with_capacity(capacity),
            next_arrival: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Timestamp of the minimum element
    pub fn peek_seen(&self) -> Option<DateTime<Utc>> {
        let slot_index = *self.heap.first()?;
        self.arena[slot_index].as_ref().map(|slot| slot.op.seen)
    }

    pub fn push(&mut self, op: RecordedOp) {
        let slot = Slot {
            op,
            arrival: self.next_arrival,
        };
        self.next_arrival += 1;

        let slot_index = match self.free.pop() {
            Some(index) => {
                self.arena[index] = Some(slot);
                index
            }
            None => {
                self.arena.push(Some(slot));
                self.arena.len() - 1
            }
        };
        self.heap.push(slot_index);
        self.sift_up(self.heap.len() - 1);
    }

    pub fn pop(&mut self) -> Option<RecordedOp> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let slot_index = self.heap.pop()?;
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        self.free.push(slot_index);
        self.arena[slot_index].take().map(|slot| slot.op)
    }

    fn key(&self, heap_pos: usize) -> (DateTime<Utc>, u64) {
        let slot_index = self.heap[heap_pos];
        let slot = self.arena[slot_index]
            .as_ref()
            .expect("heap index points at occupied slot");
        (slot.op.seen, slot.arrival)
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.key(pos) >= self.key(parent) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;
            if left < self.heap.len() && self.key(left) < self.key(smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.key(right) < self.key(smallest) {
                smallest = right;
            }
            if smallest == pos {
                return;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::format::RawOp;
    use chrono::TimeZone;

    fn op_at(millis: i64) -> RecordedOp {
        let seen = Utc.timestamp_millis_opt(millis).unwrap();
        RecordedOp::new(seen, String::new(), String::new(), 0, RawOp::empty())
    }

    #[test]
    fn test_pop_orders_by_timestamp() {
        let mut heap = OrderHeap::with_capacity(8);
        for millis in [50, 10, 40, 20, 30] {
            heap.push(op_at(millis));
        }
        let mut seen = Vec::new();
        while let Some(op) = heap.pop() {
            seen.push(op.seen.timestamp_millis());
        }
        assert_eq!(seen, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_ties_break_by_arrival() {
        let mut heap = OrderHeap::with_capacity(4);
        let mut first = op_at(10);
        first.connection_num = 1;
        let mut second = op_at(10);
        second.connection_num = 2;
        heap.push(first);
        heap.push(second);
        assert_eq!(heap.pop().unwrap().connection_num, 1);
        assert_eq!(heap.pop().unwrap().connection_num, 2);
    }

    #[test]
    fn test_slots_are_reused() {
        let mut heap = OrderHeap::with_capacity(2);
        for round in 0..10 {
            heap.push(op_at(round));
            heap.push(op_at(round + 100));
            heap.pop();
            heap.pop();
        }
        assert!(heap.is_empty());
        assert!(heap.arena.len() <= 3, "arena grew to {}", heap.arena.len());
    }

    #[test]
    fn test_peek_seen() {
        let mut heap = OrderHeap::with_capacity(2);
        assert!(heap.peek_seen().is_none());
        heap.push(op_at(42));
        assert_eq!(heap.peek_seen().unwrap().timestamp_millis(), 42);
    }
}
