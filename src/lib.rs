//! Seraph: a priority-aware log-triage and LLM-driven investigation core.
//!
//! [`Seraph`] is the composition root. It owns every long-lived component
//! (queue, dedup, cache, circuit breakers, dispatcher, alerter) in a single
//! struct and drives the scheduler loop from one task, matching `spec.md`
//! §5's single-owner concurrency model: Ingress, Scheduler, ToolDispatcher,
//! and Alerter all live in this one context, and each Investigation runs
//! in its own isolated task reachable only by message passing.

pub mod alerter;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod metrics;
pub mod priority;
pub mod reasoning;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use alerter::{Alerter, AlerterConfig, HttpAlertTransport};
use cache::{CacheConfig, SimilarityCache};
use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, ObservableState};
use config::RuntimeConfig;
use dedup::Deduplicator;
use dispatcher::tool::Tool;
use dispatcher::{ToolDispatcher, ToolRequest};
use error::SeraphError;
use ingress::{AdmittedLog, IngressConfig, IngressState, StatusView};
use metrics::Registry;
use priority::{BusinessHours, KeywordRules, PriorityCalculator, PriorityWeights};
use reasoning::{ReasoningProvider, ToolDescriptor};
use scheduler::{InvestigationSpawner, Scheduler, SchedulerConfig};
use types::{
    Alert, AlertMetadata, Investigation, InvestigationId, LogLevel, NullReportSink, Report,
    ReportSink, ServiceCriticality, ServiceDescriptor,
};
use worker::{InvestigationWorker, WorkerConfig};

/// Runs each Investigation in its own task, reporting completion back to
/// the scheduler over the `done` channel it's handed per spawn call. The
/// scheduler never touches the worker, reasoning service, or tools itself.
struct WorkerSpawner {
    worker: Arc<InvestigationWorker>,
}

impl InvestigationSpawner for WorkerSpawner {
    fn spawn(
        &self,
        investigation: Investigation,
        cancel: watch::Receiver<bool>,
        done: mpsc::UnboundedSender<(InvestigationId, Report)>,
    ) {
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            let id = investigation.id;
            let alert_id = investigation.alert.id;
            let report = worker.run(investigation, cancel).await;
            info!(%id, %alert_id, outcome = ?report.outcome, "investigation finished");
            let _ = done.send((id, report));
        });
    }
}

fn build_calculator(config: &config::PriorityQueueConfig) -> Result<PriorityCalculator, SeraphError> {
    let keywords = KeywordRules::compile(
        &config.critical_keywords,
        &config.high_priority_keywords,
        &config.medium_priority_keywords,
    )?;
    let services = config
        .services
        .iter()
        .map(|s| ServiceDescriptor {
            name: s.name.clone(),
            criticality: match s.criticality.to_lowercase().as_str() {
                "critical" => ServiceCriticality::Critical,
                "high" => ServiceCriticality::High,
                "medium" => ServiceCriticality::Medium,
                _ => ServiceCriticality::Low,
            },
            business_impact: 0.0,
            user_count: s.user_count,
        })
        .collect();
    Ok(PriorityCalculator {
        weights: PriorityWeights {
            keyword: config.priority_weights.keywords,
            service: config.priority_weights.service_impact,
            time: config.priority_weights.time_context,
            history: config.priority_weights.historical,
        },
        keywords,
        services,
        business_hours: BusinessHours {
            start_hour: config.business_hours.start,
            end_hour: config.business_hours.end,
            peak_start_hour: None,
            peak_end_hour: None,
        },
    })
}

/// Converts an admitted log into an Alert with a minimal triage reason.
/// Real anomaly classification is an external collaborator (`spec.md` §1);
/// this assigns a reason from the configured keyword sets so the
/// PriorityCalculator always has something to score against.
fn triage(log: &AdmittedLog) -> Alert {
    let reason = match log.level.as_deref() {
        Some("error") | Some("fatal") => "error-level log admitted for triage".to_string(),
        Some("warn") => "warning-level log admitted for triage".to_string(),
        _ => "log admitted for triage".to_string(),
    };
    let severity = match log.level.as_deref() {
        Some("trace") => Some(LogLevel::Trace),
        Some("debug") => Some(LogLevel::Debug),
        Some("info") => Some(LogLevel::Info),
        Some("warn") => Some(LogLevel::Warn),
        Some("error") => Some(LogLevel::Error),
        Some("fatal") => Some(LogLevel::Fatal),
        _ => None,
    };
    Alert {
        id: types::AlertId::new(),
        log: log.message.clone(),
        reason,
        metadata: AlertMetadata {
            service: log.service.clone(),
            severity,
            tags: log.tags.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            source: Some(log.client_id.clone()),
        },
        priority_class: types::PriorityClass::Low,
        priority_score: 0.0,
        enqueued_at_ms: monotonic_ms(),
        estimated_duration_ms: 30_000,
    }
}

fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Tracks how often a fingerprint has recently recurred, normalised to
/// `[0, 1]`, feeding the PriorityCalculator's history term.
struct HistoryTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl HistoryTracker {
    fn new() -> Self {
        Self { counts: Mutex::new(HashMap::new()) }
    }

    fn record_and_score(&self, fingerprint: &str) -> f64 {
        let mut counts = self.counts.lock();
        let count = counts.entry(fingerprint.to_string()).or_insert(0);
        *count += 1;
        (*count as f64 / 10.0).min(1.0)
    }
}

pub struct Seraph {
    pub config: RuntimeConfig,
    pub metrics: Arc<Registry>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    scheduler: Scheduler,
    alerter: Arc<Alerter>,
    dispatcher: Arc<ToolDispatcher>,
    tool_requests_rx: Option<mpsc::UnboundedReceiver<ToolRequest>>,
    ingress_state: IngressState,
    admitted_rx: mpsc::UnboundedReceiver<AdmittedLog>,
    status: Arc<RwLock<StatusView>>,
    history: HistoryTracker,
    report_sink: Arc<dyn ReportSink>,
}

impl Seraph {
    pub fn new(
        config: RuntimeConfig,
        reasoning: Arc<dyn ReasoningProvider>,
        tools: Vec<Arc<dyn Tool>>,
        report_sink: Option<Arc<dyn ReportSink>>,
    ) -> Result<Self, SeraphError> {
        config.validate()?;

        let metrics = Arc::new(Registry::new());
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));

        let cache = Arc::new(SimilarityCache::new(CacheConfig {
            default_ttl: Duration::from_secs(config.llm_cache.ttl_seconds),
            similarity_threshold: config.llm_cache.similarity_threshold as f32,
        }));

        let calculator = build_calculator(&config.priority_queue)?;
        let dedup = Deduplicator::new(Duration::from_secs(600), 50_000);

        let tool_descriptors: Vec<ToolDescriptor> = tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();

        let (tool_requests_tx, tool_requests_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(ToolDispatcher::with_metrics(
            tools,
            Arc::clone(&circuit_breakers),
            Duration::from_secs(10),
            Arc::clone(&metrics),
        ));

        let worker = Arc::new(InvestigationWorker {
            config: WorkerConfig::default(),
            reasoning,
            circuit_breakers: Arc::clone(&circuit_breakers),
            retry_config: retry::RetryConfig::default(),
            cache,
            tool_descriptors,
            tool_requests: tool_requests_tx,
            metrics: Arc::clone(&metrics),
        });

        let scheduler_config = SchedulerConfig {
            max_concurrent: config.priority_queue.max_concurrent,
            burst_concurrent: config.priority_queue.burst_concurrent,
            burst_max_duration: Duration::from_secs(config.priority_queue.burst_max_duration_seconds),
            preemption_threshold: config.priority_queue.preemption_threshold,
            max_preemptions: config.priority_queue.max_preemptions,
            queue_max_size: Some(config.priority_queue.max_queue_size),
        };
        let scheduler = Scheduler::new(
            scheduler_config,
            dedup,
            calculator,
            Arc::new(WorkerSpawner { worker }),
        );

        let alerter = Arc::new(Alerter::new(
            AlerterConfig {
                sink_url: config.alert_manager.url.clone(),
                retry: retry::RetryConfig::default(),
                request_timeout: Duration::from_secs(10),
            },
            Arc::new(HttpAlertTransport::new(Duration::from_secs(10))),
            Arc::clone(&circuit_breakers),
        ));

        let status = Arc::new(RwLock::new(StatusView::default()));
        let (ingress_state, admitted_rx) = IngressState::new(
            IngressConfig {
                bind_address: config.bind_address.clone(),
                port: config.port,
                max_body_bytes: 1024 * 1024,
                rate_limit_per_minute: 100,
                api_key: config.server_api_key.clone(),
            },
            Arc::clone(&metrics),
            Arc::clone(&status),
            None,
        );

        Ok(Self {
            config,
            metrics,
            circuit_breakers,
            scheduler,
            alerter,
            dispatcher,
            tool_requests_rx: Some(tool_requests_rx),
            ingress_state,
            admitted_rx,
            status,
            history: HistoryTracker::new(),
            report_sink: report_sink.unwrap_or_else(|| Arc::new(NullReportSink)),
        })
    }

    /// Runs the HTTP ingress and the scheduler loop until `shutdown` fires.
    /// Both halves share this context: ingress only ever reads a published
    /// `StatusView` and sends into `admitted_rx`, never touching the
    /// scheduler directly.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SeraphError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let tool_requests_rx = self.tool_requests_rx.take().expect("run() called once");
        tokio::spawn(async move {
            dispatcher.run(tool_requests_rx).await;
        });

        let listener = tokio::net::TcpListener::bind((
            self.ingress_state_bind_address(),
            self.config.port,
        ))
        .await
        .map_err(|e| SeraphError::Internal(format!("failed to bind ingress: {e}")))?;
        let app = ingress::build_router(self.ingress_state.clone());
        let mut http_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.changed().await;
                })
                .await;
        });

        self.status.write().ready = true;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                Some(log) = self.admitted_rx.recv() => {
                    self.admit(log);
                }
            }
        }

        info!("seraph shutting down");
        self.ingress_state.mark_shutting_down();
        self.status.write().ready = false;
        self.scheduler.shutdown(Duration::from_secs(5)).await;
        let _ = server.await;
        Ok(())
    }

    fn ingress_state_bind_address(&self) -> std::net::IpAddr {
        self.config
            .bind_address
            .parse()
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)))
    }

    fn admit(&mut self, log: AdmittedLog) {
        let alert = triage(&log);
        let fingerprint = alert.fingerprint();
        let history_frequency = self.history.record_and_score(&fingerprint);
        let outcome = self.scheduler.dispatch(alert.clone(), chrono::Utc::now(), history_frequency);
        if outcome.accepted {
            self.metrics.inc_investigations_started(&format!("{:?}", alert.priority_class).to_lowercase());
            let alerter = Arc::clone(&self.alerter);
            let incident_id = types::IncidentId::new();
            let alert_id = alert.id;
            let log_hash = fingerprint.clone();
            tokio::spawn(async move {
                alerter.fire(incident_id, alert_id, &log_hash).await;
            });
        } else if let Some(reason) = outcome.drop_reason {
            self.metrics.inc_logs_dropped(&format!("{:?}", reason).to_lowercase());
        }
    }

    async fn tick(&mut self) {
        let now_ms = monotonic_ms();
        self.scheduler.age_tick(now_ms);
        self.scheduler.tick(now_ms);
        for _ in 0..self.scheduler.take_preemptions() {
            self.metrics.inc_preemptions();
        }
        for _ in 0..self.scheduler.take_queue_full_drops() {
            self.metrics.inc_logs_dropped(&format!("{:?}", types::DropReason::QueueFull).to_lowercase());
        }
        for (priority, wait_ms) in self.scheduler.take_queue_wait_samples() {
            let label = format!("{priority:?}").to_lowercase();
            self.metrics.observe_queue_wait(&label, wait_ms as f64 / 1000.0);
        }
        let reports = self.scheduler.poll_completions();
        for report in reports {
            let outcome = format!("{:?}", report.outcome).to_lowercase();
            self.metrics.inc_investigations_completed(&outcome);
            let alerter = Arc::clone(&self.alerter);
            let sink = Arc::clone(&self.report_sink);
            let incident_id = types::IncidentId::new();
            tokio::spawn(async move {
                alerter.send_enriched(incident_id, &report).await;
                if let Err(err) = sink.store(&report).await {
                    error!(%err, "report sink failed");
                }
            });
        }

        let snapshot = self.scheduler.snapshot();
        self.metrics.set_queue_size(snapshot.queue_size as i64);
        self.metrics.set_running_investigations(snapshot.running_investigations as i64);
        self.metrics.set_burst_mode_active(snapshot.burst_mode_active);
        {
            let mut status = self.status.write();
            status.queue_size = snapshot.queue_size;
            status.running_investigations = snapshot.running_investigations;
            status.burst_mode_active = snapshot.burst_mode_active;
        }

        for endpoint in [worker::REASONING_ENDPOINT, alerter::ALERTER_ENDPOINT] {
            if let Some(state) = self.circuit_breakers.get_state(endpoint).await {
                self.metrics.set_circuit_state(endpoint, observable_state_name(state));
            }
        }
    }
}

fn observable_state_name(state: ObservableState) -> &'static str {
    match state {
        ObservableState::Closed => "closed",
        ObservableState::Open => "open",
        ObservableState::HalfOpen => "half_open",
    }
}
