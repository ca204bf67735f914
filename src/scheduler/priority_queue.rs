//! Bounded priority queue of pending alerts (C3, `spec.md` §4.3).
//!
//! Ordered by priority class first, then score within a class (`spec.md`
//! §4.3: "lower priorityClass first"), then FIFO on `enqueued_at_ms` when
//! class and score (within `SCORE_TOLERANCE`) tie. When full, an incoming
//! alert evicts the current lowest-ranked entry if it outranks it;
//! otherwise the push is rejected with [`QueueFull`] (`spec.md` §4.6's
//! overload behaviour).
//!
//! Backed by an array-based binary heap plus an `AlertId -> index` side
//! table, so `remove_by_id` and `update_priority` can locate their target in
//! O(1) and restore heap order in O(log n) rather than scanning.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::{Alert, AlertId, PriorityClass};

/// `0.1 priorityScore per minute waited`, applied against each entry's own
/// elapsed wait rather than a flat per-tick increment.
pub const AGING_RATE_PER_MINUTE: f64 = 0.1;

/// Score differences at or below this are treated as a tie, falling
/// through to the FIFO tiebreak.
const SCORE_TOLERANCE: f64 = 0.01;

pub struct QueueFull;

/// Snapshot of queue-wide statistics (`spec.md` §4.3's `metrics` surface).
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub total_queued: usize,
    pub by_priority: HashMap<PriorityClass, usize>,
    pub avg_wait_time_ms: f64,
    pub avg_priority_score: f64,
    pub oldest_enqueued_at_ms: Option<u64>,
}

/// Rank comparator: `Greater` means `a` pops before `b`. `BinaryHeap`-style
/// max-heap semantics, implemented here over a plain `Vec` so the index
/// side table can be kept in sync on every swap.
fn rank_cmp(a: &Alert, b: &Alert) -> Ordering {
    b.priority_class
        .cmp(&a.priority_class)
        .then_with(|| {
            let diff = a.priority_score - b.priority_score;
            if diff.abs() <= SCORE_TOLERANCE {
                Ordering::Equal
            } else {
                diff.partial_cmp(&0.0).unwrap_or(Ordering::Equal)
            }
        })
        .then_with(|| b.enqueued_at_ms.cmp(&a.enqueued_at_ms))
}

pub struct PriorityQueue {
    heap: Vec<Alert>,
    index: HashMap<AlertId, usize>,
    max_size: Option<usize>,
}

impl PriorityQueue {
    pub fn new(max_size: Option<usize>) -> Self {
        Self { heap: Vec::new(), index: HashMap::new(), max_size }
    }

    pub fn push(&mut self, alert: Alert) -> Result<(), QueueFull> {
        if let Some(max) = self.max_size {
            if self.heap.len() >= max {
                match self.lowest_index() {
                    Some(lowest) if rank_cmp(&alert, &self.heap[lowest]) == Ordering::Greater => {
                        self.remove_at(lowest);
                    }
                    _ => return Err(QueueFull),
                }
            }
        }
        let id = alert.id;
        self.heap.push(alert);
        let idx = self.heap.len() - 1;
        self.index.insert(id, idx);
        self.sift_up(idx);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Alert> {
        if self.heap.is_empty() {
            None
        } else {
            Some(self.remove_at(0))
        }
    }

    pub fn peek(&self) -> Option<&Alert> {
        self.heap.first()
    }

    /// Removes the entry with the given id in O(log n), if present.
    pub fn remove_by_id(&mut self, id: AlertId) -> Option<Alert> {
        let idx = self.index.get(&id).copied()?;
        Some(self.remove_at(idx))
    }

    /// Updates an entry's class and score in place and restores heap order
    /// in O(log n). Returns `false` if the id is not queued.
    pub fn update_priority(&mut self, id: AlertId, priority_class: PriorityClass, priority_score: f64) -> bool {
        let Some(&idx) = self.index.get(&id) else {
            return false;
        };
        self.heap[idx].priority_class = priority_class;
        self.heap[idx].priority_score = priority_score;
        self.sift(idx);
        true
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Boosts every queued alert's score by `AGING_RATE_PER_MINUTE` times
    /// its own elapsed wait (`now_ms - enqueued_at_ms`), then re-heapifies.
    pub fn age(&mut self, now_ms: u64) {
        for alert in self.heap.iter_mut() {
            let waited_minutes = now_ms.saturating_sub(alert.enqueued_at_ms) as f64 / 60_000.0;
            alert.priority_score += AGING_RATE_PER_MINUTE * waited_minutes;
        }
        self.rebuild();
    }

    pub fn metrics(&self, now_ms: u64) -> QueueMetrics {
        if self.heap.is_empty() {
            return QueueMetrics::default();
        }
        let mut by_priority: HashMap<PriorityClass, usize> = HashMap::new();
        let mut wait_sum = 0.0;
        let mut score_sum = 0.0;
        let mut oldest = u64::MAX;
        for alert in &self.heap {
            *by_priority.entry(alert.priority_class).or_insert(0) += 1;
            wait_sum += now_ms.saturating_sub(alert.enqueued_at_ms) as f64;
            score_sum += alert.priority_score;
            oldest = oldest.min(alert.enqueued_at_ms);
        }
        let total_queued = self.heap.len();
        QueueMetrics {
            total_queued,
            by_priority,
            avg_wait_time_ms: wait_sum / total_queued as f64,
            avg_priority_score: score_sum / total_queued as f64,
            oldest_enqueued_at_ms: Some(oldest),
        }
    }

    fn lowest_index(&self) -> Option<usize> {
        (0..self.heap.len()).min_by(|&a, &b| rank_cmp(&self.heap[a], &self.heap[b]))
    }

    /// Removes and returns the entry at `idx`, filling the gap with the
    /// last element and restoring heap order from there.
    fn remove_at(&mut self, idx: usize) -> Alert {
        let last = self.heap.len() - 1;
        self.swap_entries(idx, last);
        let removed = self.heap.pop().expect("heap non-empty");
        self.index.remove(&removed.id);
        if idx < self.heap.len() {
            self.sift(idx);
        }
        removed
    }

    /// A single entry's key changed (or a leaf was moved into `idx` by a
    /// removal); the rest of the heap is still valid, so it can only need
    /// to move in one direction.
    fn sift(&mut self, idx: usize) {
        if idx > 0 {
            let parent = (idx - 1) / 2;
            if rank_cmp(&self.heap[idx], &self.heap[parent]) == Ordering::Greater {
                self.sift_up(idx);
                return;
            }
        }
        self.sift_down(idx);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if rank_cmp(&self.heap[i], &self.heap[parent]) == Ordering::Greater {
                self.swap_entries(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut largest = i;
            if left < len && rank_cmp(&self.heap[left], &self.heap[largest]) == Ordering::Greater {
                largest = left;
            }
            if right < len && rank_cmp(&self.heap[right], &self.heap[largest]) == Ordering::Greater {
                largest = right;
            }
            if largest == i {
                break;
            }
            self.swap_entries(i, largest);
            i = largest;
        }
    }

    fn swap_entries(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    fn rebuild(&mut self) {
        self.index.clear();
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i);
        }
        for (i, alert) in self.heap.iter().enumerate() {
            self.index.insert(alert.id, i);
        }
    }
}
