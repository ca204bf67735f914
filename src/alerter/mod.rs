//! Alerter (C9): two-phase fire/enrich alert lifecycle (`spec.md` §4.9).
//!
//! Phase 1 posts a minimal `firing` alert as soon as triage produces a
//! `reason`. Phase 2, once the investigation completes, posts a follow-up
//! `resolved` alert carrying the report. Delivery goes through the shared
//! CircuitBreaker + RetryManager with the HTTP retry predicate, grounded on
//! the webhook delivery style in the scheduler's delivery routing.
//! Delivery failures are logged and metered; they never block investigation
//! completion.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::retry::{is_http_retryable, retry_with_backoff, RetryConfig};
use crate::types::{AlertId, IncidentId, InvestigationId, Report};

pub const ALERTER_ENDPOINT: &str = "alertmanager";

#[derive(Debug, Clone)]
pub struct AlerterConfig {
    pub sink_url: String,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for AlerterConfig {
    fn default() -> Self {
        Self {
            sink_url: String::new(),
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Normalizes a configured sink URL once: strips a trailing slash and a
/// trailing `/api/v2/alerts` suffix some operators paste in by habit, so
/// both forms append the endpoint path consistently.
pub fn normalize_sink_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    trimmed
        .strip_suffix("/api/v2/alerts")
        .unwrap_or(trimmed)
        .to_string()
}

#[derive(Debug, Serialize)]
struct FiringAlert<'a> {
    #[serde(rename = "alertname")]
    alert_name: &'static str,
    incident_id: IncidentId,
    log_hash: &'a str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ResolvedAlert<'a> {
    incident_id: IncidentId,
    status: &'static str,
    root_cause_analysis: &'a str,
    impact_assessment: &'a str,
    suggested_remediation: &'a [String],
    report_id: InvestigationId,
}

#[async_trait::async_trait]
pub trait AlertTransport: Send + Sync {
    async fn post(&self, url: &str, body: serde_json::Value) -> Result<(), String>;
}

pub struct HttpAlertTransport {
    client: reqwest::Client,
}

impl HttpAlertTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait::async_trait]
impl AlertTransport for HttpAlertTransport {
    async fn post(&self, url: &str, body: serde_json::Value) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("http {status}"))
        }
    }
}

pub struct Alerter {
    config: AlerterConfig,
    transport: Arc<dyn AlertTransport>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
}

impl Alerter {
    pub fn new(
        config: AlerterConfig,
        transport: Arc<dyn AlertTransport>,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self { config, transport, circuit_breakers }
    }

    fn endpoint_url(&self) -> String {
        format!("{}/api/v2/alerts", normalize_sink_url(&self.config.sink_url))
    }

    /// Phase 1: fire as soon as triage has a `reason`.
    pub async fn fire(&self, incident_id: IncidentId, alert_id: AlertId, log_hash: &str) {
        let body = serde_json::to_value(FiringAlert {
            alert_name: "seraph_investigation",
            incident_id,
            log_hash,
            status: "firing",
        })
        .expect("FiringAlert is always serializable");
        self.deliver(body, alert_id).await;
    }

    /// Phase 2: enrich once the investigation has a report. Failures never
    /// propagate to the caller; investigation completion is independent of
    /// alert delivery.
    pub async fn send_enriched(&self, incident_id: IncidentId, report: &Report) {
        let body = serde_json::to_value(ResolvedAlert {
            incident_id,
            status: "resolved",
            root_cause_analysis: &report.root_cause_analysis,
            impact_assessment: &report.impact_assessment,
            suggested_remediation: &report.suggested_remediation,
            report_id: report.investigation_id,
        })
        .expect("ResolvedAlert is always serializable");
        self.deliver(body, report.alert_id).await;
    }

    async fn deliver(&self, body: serde_json::Value, alert_id: AlertId) {
        if self.circuit_breakers.check(ALERTER_ENDPOINT).await.is_err() {
            warn!(%alert_id, "alert delivery skipped: circuit open");
            return;
        }

        let url = self.endpoint_url();
        let result = retry_with_backoff(
            &self.config.retry,
            || self.transport.post(&url, body.clone()),
            |err: &String| {
                err.strip_prefix("http ")
                    .and_then(|code| code.parse::<u16>().ok())
                    .map(is_http_retryable)
                    .unwrap_or(true)
            },
        )
        .await;

        match result {
            Ok(()) => self.circuit_breakers.record_success(ALERTER_ENDPOINT).await,
            Err(err) => {
                self.circuit_breakers.record_failure(ALERTER_ENDPOINT).await;
                warn!(%alert_id, error = %err, "alert delivery failed");
            }
        }
    }
}
