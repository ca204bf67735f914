//! Scheduler (C6): owns the priority queue, the active-investigation set,
//! a bounded worker pool, and burst-mode concurrency (`spec.md` §4.6).
//!
//! This is a single-owner component: every mutation happens through `&mut
//! self` from the one main-context task that holds it, matching the
//! "centralise in a single-owner task, mutate only via a command channel"
//! design note in `spec.md` §9.

pub mod priority_queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::dedup::Deduplicator;
use crate::priority::PriorityCalculator;
use crate::types::{Alert, AlertId, DropReason, Investigation, InvestigationId, PriorityClass, Report};
use priority_queue::PriorityQueue;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub burst_concurrent: usize,
    pub burst_max_duration: Duration,
    pub preemption_threshold: f64,
    pub max_preemptions: u32,
    pub queue_max_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            burst_concurrent: 8,
            burst_max_duration: Duration::from_secs(600),
            preemption_threshold: 0.3,
            max_preemptions: 2,
            queue_max_size: Some(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub accepted: bool,
    pub drop_reason: Option<DropReason>,
}

/// Spawns the isolated task that runs one Investigation to completion. The
/// scheduler never touches the reasoning service or tools itself; it only
/// owns the queue, the active set, and cancellation signals.
pub trait InvestigationSpawner: Send + Sync {
    fn spawn(
        &self,
        investigation: Investigation,
        cancel: watch::Receiver<bool>,
        done: mpsc::UnboundedSender<(InvestigationId, Report)>,
    );
}

struct ActiveSlot {
    alert: Alert,
    cancel: watch::Sender<bool>,
}

struct BurstState {
    active: bool,
    started_at: Instant,
}

pub struct SchedulerSnapshot {
    pub queue_size: usize,
    pub running_investigations: usize,
    pub burst_mode_active: bool,
}

pub struct Scheduler {
    queue: PriorityQueue,
    active: HashMap<InvestigationId, ActiveSlot>,
    dedup: Deduplicator,
    calculator: PriorityCalculator,
    config: SchedulerConfig,
    burst: BurstState,
    preemption_counts: HashMap<AlertId, u32>,
    spawner: Arc<dyn InvestigationSpawner>,
    done_tx: mpsc::UnboundedSender<(InvestigationId, Report)>,
    done_rx: mpsc::UnboundedReceiver<(InvestigationId, Report)>,
    shutting_down: bool,
    preemptions_since_poll: u32,
    queue_full_drops_since_poll: u32,
    queue_wait_samples_since_poll: Vec<(PriorityClass, u64)>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        dedup: Deduplicator,
        calculator: PriorityCalculator,
        spawner: Arc<dyn InvestigationSpawner>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            queue: PriorityQueue::new(config.queue_max_size),
            active: HashMap::new(),
            dedup,
            calculator,
            config,
            burst: BurstState {
                active: false,
                started_at: Instant::now(),
            },
            preemption_counts: HashMap::new(),
            spawner,
            done_tx,
            done_rx,
            shutting_down: false,
            preemptions_since_poll: 0,
            queue_full_drops_since_poll: 0,
            queue_wait_samples_since_poll: Vec::new(),
        }
    }

    /// Triage has already produced `alert.reason`; this runs dedup,
    /// computes priority, and enqueues. Never blocks on Ingress: queue
    /// overflow and duplicates are reported back as a drop reason rather
    /// than an error.
    pub fn dispatch(
        &mut self,
        mut alert: Alert,
        now: chrono::DateTime<chrono::Utc>,
        history_frequency: f64,
    ) -> DispatchOutcome {
        if self.shutting_down {
            return DispatchOutcome {
                accepted: false,
                drop_reason: Some(DropReason::Shutdown),
            };
        }

        let fingerprint = alert.fingerprint();
        if self.dedup.check_and_record(&fingerprint) {
            return DispatchOutcome {
                accepted: false,
                drop_reason: Some(DropReason::Duplicate),
            };
        }

        let (class, score) = self.calculator.score(&alert, now, history_frequency);
        alert.priority_class = class;
        alert.priority_score = score;

        match self.queue.push(alert) {
            Ok(()) => DispatchOutcome {
                accepted: true,
                drop_reason: None,
            },
            Err(_) => DispatchOutcome {
                accepted: false,
                drop_reason: Some(DropReason::QueueFull),
            },
        }
    }

    /// Drain loop: while a free worker slot exists and the queue is
    /// non-empty, pop and launch. Then attempt preemption if the queue's
    /// head still outranks a running MEDIUM/LOW investigation. `now_ms`
    /// feeds the queue-wait sample recorded for each launch.
    pub fn tick(&mut self, now_ms: u64) {
        self.update_burst_mode();
        while self.has_free_slot() {
            match self.queue.pop() {
                Some(alert) => self.launch(alert, now_ms),
                None => break,
            }
        }
        if !self.has_free_slot() {
            self.try_preempt(now_ms);
        }
    }

    fn capacity(&self) -> usize {
        if self.burst.active {
            self.config.burst_concurrent
        } else {
            self.config.max_concurrent
        }
    }

    fn has_free_slot(&self) -> bool {
        self.active.len() < self.capacity()
    }

    fn update_burst_mode(&mut self) {
        let urgent_present = self
            .queue
            .peek()
            .map(|a| matches!(a.priority_class, PriorityClass::Critical | PriorityClass::High))
            .unwrap_or(false)
            || self
                .active
                .values()
                .any(|s| matches!(s.alert.priority_class, PriorityClass::Critical | PriorityClass::High));

        if self.burst.active {
            let expired = self.burst.started_at.elapsed() >= self.config.burst_max_duration;
            if expired || !urgent_present {
                self.burst.active = false;
            }
        } else if urgent_present {
            self.burst.active = true;
            self.burst.started_at = Instant::now();
        }
    }

    fn launch(&mut self, alert: Alert, now_ms: u64) {
        let wait_ms = now_ms.saturating_sub(alert.enqueued_at_ms);
        self.queue_wait_samples_since_poll.push((alert.priority_class, wait_ms));

        let investigation_id = InvestigationId::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let investigation = Investigation::new(investigation_id, alert.clone());
        self.active.insert(investigation_id, ActiveSlot { alert, cancel: cancel_tx });
        self.spawner.spawn(investigation, cancel_rx, self.done_tx.clone());
    }

    /// Preempt at most one running investigation per tick: pick the
    /// lowest-ranked eligible victim among MEDIUM/LOW investigations that
    /// the queue's head clears by more than `preemptionThreshold` and that
    /// has not already hit `maxPreemptions`.
    fn try_preempt(&mut self, now_ms: u64) {
        if self.burst.active {
            return;
        }
        let Some(top) = self.queue.peek().cloned() else {
            return;
        };

        let victim_id = self
            .active
            .iter()
            .filter(|(_, slot)| matches!(slot.alert.priority_class, PriorityClass::Medium | PriorityClass::Low))
            .filter(|(_, slot)| top.priority_class < slot.alert.priority_class)
            .filter(|(_, slot)| top.priority_score - slot.alert.priority_score > self.config.preemption_threshold)
            .filter(|(_, slot)| {
                self.preemption_counts.get(&slot.alert.id).copied().unwrap_or(0) < self.config.max_preemptions
            })
            .max_by(|(_, a), (_, b)| {
                a.alert
                    .priority_class
                    .cmp(&b.alert.priority_class)
                    .then_with(|| a.alert.priority_score.partial_cmp(&b.alert.priority_score).unwrap_or(std::cmp::Ordering::Equal))
            })
            .map(|(id, _)| *id);

        if let Some(victim_id) = victim_id {
            self.preempt(victim_id, now_ms);
        }
    }

    fn preempt(&mut self, investigation_id: InvestigationId, now_ms: u64) {
        let Some(slot) = self.active.remove(&investigation_id) else {
            return;
        };
        let _ = slot.cancel.send(true);
        *self.preemption_counts.entry(slot.alert.id).or_insert(0) += 1;
        self.preemptions_since_poll += 1;
        // Re-enqueue preserving enqueued_at_ms so aging is not lost. The
        // queue can reject this if it is saturated with entries that all
        // outrank the preempted alert -- that is a genuine drop, recorded
        // rather than swallowed (spec.md §3: never silently lost).
        let alert_id = slot.alert.id;
        if self.queue.push(slot.alert).is_err() {
            self.queue_full_drops_since_poll += 1;
            warn!(alert_id = %alert_id, "preempted alert dropped: queue full of higher-ranked entries");
        }
        if let Some(next) = self.queue.pop() {
            self.launch(next, now_ms);
        }
    }

    /// `0.1 priorityScore per minute waited`, computed from each entry's own
    /// elapsed wait rather than a flat per-tick increment.
    pub fn age_tick(&mut self, now_ms: u64) {
        self.queue.age(now_ms);
    }

    /// Drains the queue-wait samples (priority class, wait in ms) recorded
    /// since the last call, for the caller to feed into
    /// `queue_wait_seconds`.
    pub fn take_queue_wait_samples(&mut self) -> Vec<(PriorityClass, u64)> {
        std::mem::take(&mut self.queue_wait_samples_since_poll)
    }

    /// Drains the count of preempted alerts that could not be re-enqueued
    /// because the queue was saturated with higher-ranked entries.
    pub fn take_queue_full_drops(&mut self) -> u32 {
        std::mem::take(&mut self.queue_full_drops_since_poll)
    }

    /// Point-in-time queue statistics (`spec.md` §4.3's `metrics` surface).
    pub fn queue_metrics(&self, now_ms: u64) -> priority_queue::QueueMetrics {
        self.queue.metrics(now_ms)
    }

    /// Drains completed investigations reported since the last call,
    /// releasing their worker slots and clearing preemption history for
    /// alerts that reached a terminal state.
    pub fn poll_completions(&mut self) -> Vec<Report> {
        let mut reports = Vec::new();
        while let Ok((investigation_id, report)) = self.done_rx.try_recv() {
            self.active.remove(&investigation_id);
            self.preemption_counts.remove(&report.alert_id);
            reports.push(report);
        }
        reports
    }

    /// Drains the preemption count accumulated since the last call, for the
    /// caller to feed into `preemptions_total`.
    pub fn take_preemptions(&mut self) -> u32 {
        std::mem::take(&mut self.preemptions_since_poll)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            queue_size: self.queue.len(),
            running_investigations: self.active.len(),
            burst_mode_active: self.burst.active,
        }
    }

    /// Stop admission, cancel and discard queued alerts (after logging
    /// their count), and wait up to `timeout` for active investigations to
    /// finish before cancelling whatever remains.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.shutting_down = true;
        let dropped = self.queue.len();
        if dropped > 0 {
            warn!(dropped, "discarding queued alerts on shutdown");
        }
        self.queue.clear();
        for slot in self.active.values() {
            let _ = slot.cancel.send(true);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.active.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.done_rx.recv()).await {
                Ok(Some((investigation_id, _report))) => {
                    self.active.remove(&investigation_id);
                }
                _ => break,
            }
        }
        if !self.active.is_empty() {
            warn!(
                count = self.active.len(),
                "cancelling investigations still active past shutdown grace"
            );
            self.active.clear();
        }
    }
}
