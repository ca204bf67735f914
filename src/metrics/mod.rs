//! Metrics registry for Seraph (`spec.md` §6).
//!
//! A single in-process registry of counters, gauges, and histograms exposed
//! as Prometheus text exposition format from `GET /metrics`. Seraph only
//! ever needs the one export surface, so (unlike the file/OTLP backends this
//! module is adapted from) there is a single `Registry` rather than a
//! pluggable `Exporter` trait -- see `DESIGN.md` for the dropped backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Fixed-bucket histogram, upper-bounds inclusive, plus an overflow `+Inf`
/// bucket. Matches Prometheus's cumulative bucket convention.
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum: Mutex<f64>,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self { bounds, buckets, sum: Mutex::new(0.0), count: AtomicU64::new(0) }
    }

    pub fn observe(&self, value: f64) {
        let idx = self.bounds.iter().position(|b| value <= *b).unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        *self.sum.lock() += value;
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, labels: &str, out: &mut String) {
        let mut cumulative = 0u64;
        for (i, bound) in self.bounds.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let le = if labels.is_empty() {
                format!("le=\"{bound}\"")
            } else {
                format!("{labels},le=\"{bound}\"")
            };
            out.push_str(&format!("{name}_bucket{{{le}}} {cumulative}\n"));
        }
        cumulative += self.buckets[self.bounds.len()].load(Ordering::Relaxed);
        let le_inf = if labels.is_empty() {
            "le=\"+Inf\"".to_string()
        } else {
            format!("{labels},le=\"+Inf\"")
        };
        out.push_str(&format!("{name}_bucket{{{le_inf}}} {cumulative}\n"));
        let label_suffix = if labels.is_empty() { String::new() } else { format!("{{{labels}}}") };
        out.push_str(&format!("{name}_sum{label_suffix} {}\n", *self.sum.lock()));
        out.push_str(&format!("{name}_count{label_suffix} {}\n", self.count.load(Ordering::Relaxed)));
    }
}

const DURATION_BOUNDS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

#[derive(Default)]
struct LabeledCounters(Mutex<HashMap<String, AtomicU64>>);

impl LabeledCounters {
    fn inc(&self, label: &str) {
        let mut map = self.0.lock();
        map.entry(label.to_string()).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, label_name: &str, out: &mut String) {
        for (label, count) in self.0.lock().iter() {
            out.push_str(&format!(
                "{name}{{{label_name}=\"{label}\"}} {}\n",
                count.load(Ordering::Relaxed)
            ));
        }
    }
}

#[derive(Default)]
struct LabeledHistograms(Mutex<HashMap<String, Histogram>>);

impl LabeledHistograms {
    fn observe(&self, label: &str, value: f64) {
        let mut map = self.0.lock();
        map.entry(label.to_string())
            .or_insert_with(|| Histogram::new(DURATION_BOUNDS.to_vec()))
            .observe(value);
    }

    fn render(&self, name: &str, label_name: &str, out: &mut String) {
        for (label, hist) in self.0.lock().iter() {
            hist.render(name, &format!("{label_name}=\"{label}\""), out);
        }
    }
}

#[derive(Default)]
struct LabeledGauges(Mutex<HashMap<String, AtomicI64>>);

impl LabeledGauges {
    fn set(&self, label: &str, value: i64) {
        let mut map = self.0.lock();
        map.entry(label.to_string()).or_insert_with(|| AtomicI64::new(0)).store(value, Ordering::Relaxed);
    }

    fn render(&self, name: &str, label_name: &str, out: &mut String) {
        for (label, gauge) in self.0.lock().iter() {
            out.push_str(&format!(
                "{name}{{{label_name}=\"{label}\"}} {}\n",
                gauge.load(Ordering::Relaxed)
            ));
        }
    }
}

/// The full counter/gauge/histogram taxonomy from `spec.md` §6.
pub struct Registry {
    logs_received_total: AtomicU64,
    logs_dropped_total: LabeledCounters,
    investigations_started_total: LabeledCounters,
    investigations_completed_total: LabeledCounters,
    preemptions_total: AtomicU64,
    cache_hits_total: AtomicU64,
    cache_misses_total: AtomicU64,
    tool_calls_total: Mutex<HashMap<(String, String), AtomicU64>>,

    queue_size: AtomicI64,
    running_investigations: AtomicI64,
    burst_mode_active: AtomicI64,
    circuit_state: LabeledGauges,

    investigation_duration_seconds: LabeledHistograms,
    queue_wait_seconds: LabeledHistograms,
    tool_duration_seconds: LabeledHistograms,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            logs_received_total: AtomicU64::new(0),
            logs_dropped_total: LabeledCounters::default(),
            investigations_started_total: LabeledCounters::default(),
            investigations_completed_total: LabeledCounters::default(),
            preemptions_total: AtomicU64::new(0),
            cache_hits_total: AtomicU64::new(0),
            cache_misses_total: AtomicU64::new(0),
            tool_calls_total: Mutex::new(HashMap::new()),
            queue_size: AtomicI64::new(0),
            running_investigations: AtomicI64::new(0),
            burst_mode_active: AtomicI64::new(0),
            circuit_state: LabeledGauges::default(),
            investigation_duration_seconds: LabeledHistograms::default(),
            queue_wait_seconds: LabeledHistograms::default(),
            tool_duration_seconds: LabeledHistograms::default(),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_logs_received(&self) {
        self.logs_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_logs_dropped(&self, reason: &str) {
        self.logs_dropped_total.inc(reason);
    }

    pub fn inc_investigations_started(&self, priority: &str) {
        self.investigations_started_total.inc(priority);
    }

    pub fn inc_investigations_completed(&self, outcome: &str) {
        self.investigations_completed_total.inc(outcome);
    }

    pub fn inc_preemptions(&self) {
        self.preemptions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_calls(&self, tool: &str, outcome: &str) {
        let mut map = self.tool_calls_total.lock();
        map.entry((tool.to_string(), outcome.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_size(&self, value: i64) {
        self.queue_size.store(value, Ordering::Relaxed);
    }

    pub fn set_running_investigations(&self, value: i64) {
        self.running_investigations.store(value, Ordering::Relaxed);
    }

    pub fn set_burst_mode_active(&self, active: bool) {
        self.burst_mode_active.store(active as i64, Ordering::Relaxed);
    }

    pub fn set_circuit_state(&self, endpoint: &str, state: &str) {
        let value = match state {
            "closed" => 0,
            "half_open" => 1,
            "open" => 2,
            _ => -1,
        };
        self.circuit_state.set(endpoint, value);
    }

    pub fn observe_investigation_duration(&self, priority: &str, seconds: f64) {
        self.investigation_duration_seconds.observe(priority, seconds);
    }

    pub fn observe_queue_wait(&self, priority: &str, seconds: f64) {
        self.queue_wait_seconds.observe(priority, seconds);
    }

    pub fn observe_tool_duration(&self, tool: &str, seconds: f64) {
        self.tool_duration_seconds.observe(tool, seconds);
    }

    /// Renders the full registry as Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE logs_received_total counter\n");
        out.push_str(&format!("logs_received_total {}\n", self.logs_received_total.load(Ordering::Relaxed)));

        out.push_str("# TYPE logs_dropped_total counter\n");
        self.logs_dropped_total.render("logs_dropped_total", "reason", &mut out);

        out.push_str("# TYPE investigations_started_total counter\n");
        self.investigations_started_total.render("investigations_started_total", "priority", &mut out);

        out.push_str("# TYPE investigations_completed_total counter\n");
        self.investigations_completed_total.render("investigations_completed_total", "outcome", &mut out);

        out.push_str("# TYPE preemptions_total counter\n");
        out.push_str(&format!("preemptions_total {}\n", self.preemptions_total.load(Ordering::Relaxed)));

        out.push_str("# TYPE cache_hits_total counter\n");
        out.push_str(&format!("cache_hits_total {}\n", self.cache_hits_total.load(Ordering::Relaxed)));
        out.push_str("# TYPE cache_misses_total counter\n");
        out.push_str(&format!("cache_misses_total {}\n", self.cache_misses_total.load(Ordering::Relaxed)));

        out.push_str("# TYPE tool_calls_total counter\n");
        for ((tool, outcome), count) in self.tool_calls_total.lock().iter() {
            out.push_str(&format!(
                "tool_calls_total{{tool=\"{tool}\",outcome=\"{outcome}\"}} {}\n",
                count.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE queue_size gauge\n");
        out.push_str(&format!("queue_size {}\n", self.queue_size.load(Ordering::Relaxed)));
        out.push_str("# TYPE running_investigations gauge\n");
        out.push_str(&format!("running_investigations {}\n", self.running_investigations.load(Ordering::Relaxed)));
        out.push_str("# TYPE burst_mode_active gauge\n");
        out.push_str(&format!("burst_mode_active {}\n", self.burst_mode_active.load(Ordering::Relaxed)));
        out.push_str("# TYPE circuit_state gauge\n");
        self.circuit_state.render("circuit_state", "endpoint", &mut out);

        out.push_str("# TYPE investigation_duration_seconds histogram\n");
        self.investigation_duration_seconds.render("investigation_duration_seconds", "priority", &mut out);
        out.push_str("# TYPE queue_wait_seconds histogram\n");
        self.queue_wait_seconds.render("queue_wait_seconds", "priority", &mut out);
        out.push_str("# TYPE tool_duration_seconds histogram\n");
        self.tool_duration_seconds.render("tool_duration_seconds", "tool", &mut out);

        out
    }
}
