//! Core identifiers and data types shared across the investigation core.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(AlertId);
uuid_id!(InvestigationId);
uuid_id!(IncidentId);

/// Priority class, ordered so that `CRITICAL < HIGH < MEDIUM < LOW` under
/// `Ord` — lower values sort first, matching the queue comparator in
/// `spec.md` §4.3 ("lower priorityClass first").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PriorityClass {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
}

impl PriorityClass {
    /// Classify a numeric score per `spec.md` §4.4's thresholds.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            PriorityClass::Critical
        } else if score >= 0.6 {
            PriorityClass::High
        } else if score >= 0.3 {
            PriorityClass::Medium
        } else {
            PriorityClass::Low
        }
    }
}

/// Severity reported alongside a log line, if known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Metadata attached to an alert at admission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertMetadata {
    pub service: Option<String>,
    pub severity: Option<LogLevel>,
    pub tags: Vec<String>,
    pub source: Option<String>,
}

/// An admitted log line awaiting or undergoing investigation.
///
/// Created by Ingress. Mutated only by the Scheduler (score aging, priority
/// updates). Destroyed on dispatch or overflow eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub log: String,
    pub reason: String,
    pub metadata: AlertMetadata,
    pub priority_class: PriorityClass,
    pub priority_score: f64,
    /// Monotonic milliseconds since an arbitrary epoch, not wall-clock time.
    pub enqueued_at_ms: u64,
    pub estimated_duration_ms: u64,
}

impl Alert {
    /// Stable content fingerprint used for dedup and cache lookup: a hash
    /// of the normalized log text plus the service tag, so near-identical
    /// repeats of the same incident collapse to one fingerprint.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let normalized = self.log.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        if let Some(service) = &self.metadata.service {
            hasher.update(b"|");
            hasher.update(service.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// One entry in an investigation's scratchpad.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScratchpadEntry {
    Observation { content: String },
    Thought { content: String },
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, content: String },
}

/// Runtime state of an Investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvestigationState {
    Running,
    Preempted,
    Completed,
    Failed,
    TimedOut,
}

/// A bounded reasoning loop over one alert, producing a report.
///
/// Created by the Scheduler on dispatch; mutated only by its worker;
/// destroyed when a terminal state is reached and the report is handed to
/// the Alerter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investigation {
    pub id: InvestigationId,
    pub alert: Alert,
    pub state: InvestigationState,
    pub scratchpad: Vec<ScratchpadEntry>,
    pub tool_usage: Vec<ToolUsageRecord>,
    pub preemption_count: u32,
}

impl Investigation {
    pub fn new(id: InvestigationId, alert: Alert) -> Self {
        Self {
            id,
            alert,
            state: InvestigationState::Running,
            scratchpad: Vec::new(),
            tool_usage: Vec::new(),
            preemption_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsageRecord {
    pub tool_name: String,
    pub duration_ms: u64,
    pub outcome: String,
}

/// Outcome an Investigation terminates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Completed,
    Failed,
    TimedOut,
    /// Synthesis JSON extraction failed at every fallback tier.
    Skeleton,
}

/// The terminal artifact of an Investigation, handed to the Alerter's
/// enrich phase. Persistence of the report itself is out of scope
/// (external report database); this is the in-process value a caller's
/// `ReportSink` may persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub investigation_id: InvestigationId,
    pub alert_id: AlertId,
    pub root_cause_analysis: String,
    pub impact_assessment: String,
    pub suggested_remediation: Vec<String>,
    pub scratchpad: Vec<ScratchpadEntry>,
    pub outcome: ReportOutcome,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// Trait for persisting a finished report. Implementations are an external
/// concern (report database/viewer, out of scope for this crate); the
/// default no-op sink is used when none is configured.
#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    async fn store(&self, report: &Report) -> Result<(), String>;
}

/// Discards reports. Used when no external sink is configured.
pub struct NullReportSink;

#[async_trait::async_trait]
impl ReportSink for NullReportSink {
    async fn store(&self, _report: &Report) -> Result<(), String> {
        Ok(())
    }
}

/// A configured upstream service, used by the PriorityCalculator's
/// `service` term and by keyword matching against the log text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub criticality: ServiceCriticality,
    pub business_impact: f64,
    pub user_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCriticality {
    Critical,
    High,
    Medium,
    Low,
}

impl ServiceCriticality {
    pub fn weight(self) -> f64 {
        match self {
            ServiceCriticality::Critical => 1.0,
            ServiceCriticality::High => 0.8,
            ServiceCriticality::Medium => 0.5,
            ServiceCriticality::Low => 0.2,
        }
    }
}

/// Why an admitted alert was dropped instead of becoming an investigation,
/// per `spec.md` §3's "no alert is silently lost" invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    QueueFull,
    Duplicate,
    Shutdown,
}

pub type Tags = HashMap<String, String>;
