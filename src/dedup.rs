//! Suppresses repeated alerts within a time window via content
//! fingerprints (C5, `spec.md` §4.5).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A sliding window of seen fingerprints. Bounded storage; eviction is
/// oldest-first once the window's time bound is exceeded.
pub struct Deduplicator {
    window: Duration,
    seen: DashMap<String, Instant>,
    order: parking_lot::Mutex<VecDeque<(String, Instant)>>,
    max_entries: usize,
}

impl Deduplicator {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            seen: DashMap::new(),
            order: parking_lot::Mutex::new(VecDeque::new()),
            max_entries,
        }
    }

    /// Returns `true` if this fingerprint was seen within the window (the
    /// alert is a duplicate and should be admitted only as a metric
    /// increment, not scheduled). Records the fingerprint either way.
    pub fn check_and_record(&self, fingerprint: &str) -> bool {
        self.evict_expired();

        let now = Instant::now();
        let is_duplicate = match self.seen.get(fingerprint) {
            Some(seen_at) => now.duration_since(*seen_at) < self.window,
            None => false,
        };

        self.seen.insert(fingerprint.to_string(), now);
        let mut order = self.order.lock();
        order.push_back((fingerprint.to_string(), now));
        while order.len() > self.max_entries {
            if let Some((oldest, _)) = order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        is_duplicate
    }

    fn evict_expired(&self) {
        let cutoff = Instant::now() - self.window;
        let mut order = self.order.lock();
        while let Some((fp, seen_at)) = order.front() {
            if *seen_at < cutoff {
                self.seen.remove(fp);
                order.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_occurrence_within_window_is_duplicate() {
        let dedup = Deduplicator::new(Duration::from_secs(60), 1000);
        assert!(!dedup.check_and_record("fp-1"));
        assert!(dedup.check_and_record("fp-1"));
    }

    #[test]
    fn distinct_fingerprints_are_not_duplicates() {
        let dedup = Deduplicator::new(Duration::from_secs(60), 1000);
        assert!(!dedup.check_and_record("fp-a"));
        assert!(!dedup.check_and_record("fp-b"));
    }

    #[test]
    fn occurrence_after_window_is_not_duplicate() {
        let dedup = Deduplicator::new(Duration::from_millis(10), 1000);
        assert!(!dedup.check_and_record("fp-1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!dedup.check_and_record("fp-1"));
    }

    #[test]
    fn bounded_storage_evicts_oldest() {
        let dedup = Deduplicator::new(Duration::from_secs(3600), 3);
        dedup.check_and_record("a");
        dedup.check_and_record("b");
        dedup.check_and_record("c");
        dedup.check_and_record("d");
        assert_eq!(dedup.len(), 3);
        // "a" was evicted, so it reads as fresh again.
        assert!(!dedup.check_and_record("a"));
    }
}
