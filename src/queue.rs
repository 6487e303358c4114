use crate::supply::StopId;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

/// A label and the (stop, side) it belongs to; the unit of work in the
/// labeling loop. The side says whether the label is the trip-side or the
/// non-trip-side hyperpath cost of the stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelStop {
    pub label: f64,
    pub stop_id: StopId,
    pub is_trip: bool,
}

impl Eq for LabelStop {}

// Pop order: label ascending, then stop id, then the trip side before the
// plain side. NaN labels are rejected before they get here, so total_cmp
// gives a real total order.
impl Ord for LabelStop {
    fn cmp(&self, other: &LabelStop) -> Ordering {
        self.label
            .total_cmp(&other.label)
            .then_with(|| self.stop_id.cmp(&other.stop_id))
            .then_with(|| other.is_trip.cmp(&self.is_trip))
    }
}

impl PartialOrd for LabelStop {
    fn partial_cmp(&self, other: &LabelStop) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("popped from an empty label queue")]
    Empty,
    #[error("queue record has no side-table entry")]
    MissingEntry,
    #[error("queue record outlived its physical count")]
    StaleCount,
}

#[derive(Debug, Clone, Copy)]
struct LabelCount {
    /// Lowest label for this (stop, side) in the heap; the only valid one.
    best_label: f64,
    /// Is this (stop, side) currently valid in the queue?
    valid: bool,
    /// Number of heap records for this (stop, side), valid and invalid.
    physical_count: u32,
}

/// A min-priority queue of stop labels with the additional constraint that
/// each (stop, side) is validly present at most once.
///
/// Physical deletion from a binary heap is O(n), so a superseded record is
/// left in place and marked stale in a side table; pop_top skips stale
/// records. `valid_count` tracks the true size.
#[derive(Default)]
pub struct LabelStopQueue {
    heap: BinaryHeap<Reverse<LabelStop>>,
    table: HashMap<(StopId, bool), LabelCount>,
    valid_count: usize,
}

impl LabelStopQueue {
    pub fn new() -> LabelStopQueue {
        LabelStopQueue::default()
    }

    pub fn push(&mut self, label_stop: LabelStop) {
        debug_assert!(!label_stop.label.is_nan());
        let key = (label_stop.stop_id, label_stop.is_trip);

        match self.table.get_mut(&key) {
            None => {
                self.heap.push(Reverse(label_stop));
                self.table.insert(
                    key,
                    LabelCount { best_label: label_stop.label, valid: true, physical_count: 1 },
                );
                self.valid_count += 1;
            }
            // All valid instances have been popped, so the side is effectively
            // absent; re-arm it.
            Some(entry) if !entry.valid => {
                self.heap.push(Reverse(label_stop));
                entry.best_label = label_stop.label;
                entry.valid = true;
                entry.physical_count += 1;
                self.valid_count += 1;
            }
            // Present and valid: a better label supersedes the old record,
            // which stays in the heap but will be skipped on pop.
            Some(entry) if label_stop.label < entry.best_label => {
                self.heap.push(Reverse(label_stop));
                entry.best_label = label_stop.label;
                entry.physical_count += 1;
                // no additional valid entries
            }
            // A worse label while a better one is pending is a no-op.
            Some(_) => {}
        }
    }

    /// Pop the lowest *valid* label stop.
    pub fn pop_top(&mut self) -> Result<LabelStop, QueueError> {
        loop {
            let Reverse(top) = *self.heap.peek().ok_or(QueueError::Empty)?;
            let key = (top.stop_id, top.is_trip);
            let entry = self.table.get_mut(&key).ok_or(QueueError::MissingEntry)?;
            if entry.physical_count == 0 {
                return Err(QueueError::StaleCount);
            }

            // Stale: either the whole side was invalidated, or this record's
            // label was superseded by a better push.
            if !entry.valid || entry.best_label != top.label {
                entry.physical_count -= 1;
                self.heap.pop();
                continue;
            }

            entry.valid = false;
            entry.physical_count -= 1;
            self.valid_count -= 1;
            self.heap.pop();
            return Ok(top);
        }
    }

    pub fn len(&self) -> usize {
        self.valid_count
    }

    pub fn is_empty(&self) -> bool {
        self.valid_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ls(label: f64, stop_id: StopId, is_trip: bool) -> LabelStop {
        LabelStop { label, stop_id, is_trip }
    }

    #[test]
    fn supersede_then_drain() {
        let mut queue = LabelStopQueue::new();
        queue.push(ls(5.0, 1, false));
        queue.push(ls(3.0, 1, false));
        queue.push(ls(7.0, 2, false));
        assert_eq!(queue.len(), 2);

        let first = queue.pop_top().unwrap();
        assert_eq!((first.label, first.stop_id), (3.0, 1));
        let second = queue.pop_top().unwrap();
        assert_eq!((second.label, second.stop_id), (7.0, 2));
        assert!(queue.is_empty());
        assert_eq!(queue.pop_top(), Err(QueueError::Empty));
    }

    #[test]
    fn worse_label_is_a_noop() {
        let mut queue = LabelStopQueue::new();
        queue.push(ls(2.0, 4, true));
        queue.push(ls(6.0, 4, true));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_top().unwrap().label, 2.0);
        assert!(queue.is_empty());
    }

    #[test]
    fn repush_after_pop_is_valid_again() {
        let mut queue = LabelStopQueue::new();
        queue.push(ls(4.0, 9, false));
        assert_eq!(queue.pop_top().unwrap().label, 4.0);
        queue.push(ls(8.0, 9, false));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_top().unwrap().label, 8.0);
    }

    #[test]
    fn ties_pop_trip_side_first() {
        let mut queue = LabelStopQueue::new();
        queue.push(ls(1.0, 3, false));
        queue.push(ls(1.0, 3, true));
        queue.push(ls(1.0, 2, false));
        let a = queue.pop_top().unwrap();
        let b = queue.pop_top().unwrap();
        let c = queue.pop_top().unwrap();
        assert_eq!((a.stop_id, a.is_trip), (2, false));
        assert_eq!((b.stop_id, b.is_trip), (3, true));
        assert_eq!((c.stop_id, c.is_trip), (3, false));
    }

    // Shadow model: for any sequence of pushes and pops, len() matches the
    // number of (stop, side) pairs whose latest push has not been popped, and
    // each pop returns the best label pushed since that side's last pop.
    #[test]
    fn random_push_pop_matches_model() {
        let mut rng = fastrand::Rng::with_seed(0xfeed);
        for _ in 0..50 {
            let mut queue = LabelStopQueue::new();
            let mut model: HashMap<(StopId, bool), f64> = HashMap::new();
            for _ in 0..200 {
                if rng.f64() < 0.7 || model.is_empty() {
                    let label = (rng.u32(0..1000) as f64) / 10.0;
                    let stop_id = rng.u32(0..20);
                    let is_trip = rng.bool();
                    queue.push(ls(label, stop_id, is_trip));
                    let entry = model.entry((stop_id, is_trip)).or_insert(f64::INFINITY);
                    if label < *entry {
                        *entry = label;
                    }
                } else {
                    let popped = queue.pop_top().unwrap();
                    let expected = model.remove(&(popped.stop_id, popped.is_trip)).unwrap();
                    assert_eq!(popped.label, expected);
                    // min-label: nothing valid is cheaper than what popped
                    assert!(model.values().all(|&l| l >= popped.label));
                }
                assert_eq!(queue.len(), model.len());
            }
        }
    }

    #[test]
    fn drain_is_sorted_after_bulk_push() {
        let mut rng = fastrand::Rng::with_seed(0xbeef);
        let mut queue = LabelStopQueue::new();
        for _ in 0..300 {
            queue.push(ls(rng.f64() * 100.0, rng.u32(0..40), rng.bool()));
        }
        let mut last = f64::NEG_INFINITY;
        while !queue.is_empty() {
            let popped = queue.pop_top().unwrap();
            assert!(popped.label >= last);
            last = popped.label;
        }
    }
}
