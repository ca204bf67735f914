//! InvestigationWorker (C7): one isolated task per Investigation, driving
//! the `IDLE -> LOADED -> REASONING -> TOOL_WAIT -> (REASONING|SYNTHESIS)
//! -> DONE` state machine from `spec.md` §4.7.
//!
//! A worker never touches tools or the reasoning service's transport
//! directly: tool calls go through a channel to the ToolDispatcher, and
//! the reasoning call is wrapped in the shared CircuitBreaker + RetryManager.

mod extract;

pub use extract::extract_synthesis_json;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info_span, warn, Instrument};

use crate::cache::SimilarityCache;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::dispatcher::{ToolReply, ToolRequest};
use crate::metrics::Registry;
use crate::reasoning::{GenerateResponse, ReasoningError, ReasoningProvider, ToolCallRequest, ToolDescriptor};
use crate::retry::{is_reasoning_retryable, retry_with_backoff, RetryConfig};
use crate::types::{Investigation, InvestigationState, PriorityClass, Report, ReportOutcome, ScratchpadEntry};

pub const REASONING_ENDPOINT: &str = "reasoning-service";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_turns: u32,
    pub tool_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_turns: 5,
            tool_timeout: Duration::from_secs(10),
        }
    }
}

pub struct InvestigationWorker {
    pub config: WorkerConfig,
    pub reasoning: Arc<dyn ReasoningProvider>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub retry_config: RetryConfig,
    pub cache: Arc<SimilarityCache>,
    pub tool_descriptors: Vec<ToolDescriptor>,
    pub tool_requests: mpsc::UnboundedSender<ToolRequest>,
    pub metrics: Arc<Registry>,
}

impl InvestigationWorker {
    /// Drives one Investigation to a terminal Report. `cancel` is polled
    /// before every suspension point; on a cancel signal the worker stops
    /// before the next reasoning call or abandons an in-flight tool wait
    /// (the dispatcher drops the orphan reply).
    pub async fn run(&self, mut investigation: Investigation, mut cancel: watch::Receiver<bool>) -> Report {
        let span = info_span!("investigation", investigation_id = %investigation.id);
        let started = std::time::Instant::now();
        let priority_label = priority_label(investigation.alert.priority_class);
        let report = async move {
            investigation.scratchpad.push(ScratchpadEntry::Observation {
                content: format!("alert: {} ({})", investigation.alert.log, investigation.alert.reason),
            });

            let mut turn = 0u32;
            let outcome = loop {
                if *cancel.borrow() {
                    break ReportOutcome::Failed;
                }
                if turn >= self.config.max_turns {
                    break self.synthesize(&mut investigation).await;
                }

                let prompt = self.build_reasoning_prompt(&investigation);
                let response = match self.call_reasoning(&prompt, &mut cancel).await {
                    Ok(response) => response,
                    Err(Cancelled) => break ReportOutcome::Failed,
                };

                if !response.text.is_empty() {
                    investigation
                        .scratchpad
                        .push(ScratchpadEntry::Thought { content: response.text.clone() });
                }

                match response.tool_calls.first() {
                    None => {
                        investigation.scratchpad.push(ScratchpadEntry::Observation {
                            content: "no actionable tool call or FINISH; retrying".into(),
                        });
                        turn += 1;
                        continue;
                    }
                    Some(call) if call.name.eq_ignore_ascii_case("FINISH") => {
                        break self.synthesize(&mut investigation).await;
                    }
                    Some(call) => {
                        let call = call.clone();
                        if self.run_tool_call(&mut investigation, &call, &mut cancel).await.is_err() {
                            break ReportOutcome::Failed;
                        }
                        turn += 1;
                    }
                }
            };

            investigation.state = match outcome {
                ReportOutcome::Completed | ReportOutcome::Skeleton => InvestigationState::Completed,
                ReportOutcome::Failed => InvestigationState::Failed,
                ReportOutcome::TimedOut => InvestigationState::TimedOut,
            };

            self.finish(investigation, outcome)
        }
        .instrument(span)
        .await;
        self.metrics.observe_investigation_duration(priority_label, started.elapsed().as_secs_f64());
        report
    }

    fn build_reasoning_prompt(&self, investigation: &Investigation) -> String {
        let tools: Vec<String> = self
            .tool_descriptors
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        let scratchpad: Vec<String> = investigation
            .scratchpad
            .iter()
            .map(format_scratchpad_entry)
            .collect();
        format!(
            "You are investigating an alert. Available tools:\n{}\n- FINISH: call when you have enough information.\n\nScratchpad so far:\n{}",
            tools.join("\n"),
            scratchpad.join("\n")
        )
    }

    async fn call_reasoning(
        &self,
        prompt: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<GenerateResponse, Cancelled> {
        if *cancel.borrow() {
            return Err(Cancelled);
        }
        match self.cache.get(prompt).and_then(|cached| serde_json::from_str::<GenerateResponse>(&cached).ok()) {
            Some(response) => {
                self.metrics.inc_cache_hit();
                return Ok(response);
            }
            None => self.metrics.inc_cache_miss(),
        }

        if self.circuit_breakers.check(REASONING_ENDPOINT).await.is_err() {
            return Ok(GenerateResponse {
                text: "reasoning service unavailable (circuit open)".into(),
                tool_calls: vec![ToolCallRequest {
                    id: "circuit-open".into(),
                    name: "FINISH".into(),
                    arguments: "{}".into(),
                }],
            });
        }

        let tools = self.tool_descriptors.clone();
        let result = retry_with_backoff(
            &self.retry_config,
            || self.reasoning.generate(prompt, &tools),
            |err: &ReasoningError| is_reasoning_retryable(err.http_status(), &err.to_string()),
        )
        .await;

        match result {
            Ok(response) => {
                self.circuit_breakers.record_success(REASONING_ENDPOINT).await;
                if let Ok(serialized) = serde_json::to_string(&response) {
                    self.cache.set(prompt, serialized, response.text.len() as u32);
                }
                Ok(response)
            }
            Err(_err) => {
                self.circuit_breakers.record_failure(REASONING_ENDPOINT).await;
                Ok(GenerateResponse {
                    text: "reasoning service error".into(),
                    tool_calls: vec![ToolCallRequest {
                        id: "error".into(),
                        name: "FINISH".into(),
                        arguments: "{}".into(),
                    }],
                })
            }
        }
    }

    async fn run_tool_call(
        &self,
        investigation: &mut Investigation,
        call: &ToolCallRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Cancelled> {
        investigation.scratchpad.push(ScratchpadEntry::ToolCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let arguments: serde_json::Value =
            serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let request = ToolRequest {
            investigation_id: investigation.id,
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments,
            reply_to: reply_tx,
        };
        let started = std::time::Instant::now();
        if self.tool_requests.send(request).is_err() {
            investigation.scratchpad.push(ScratchpadEntry::ToolResult {
                name: call.name.clone(),
                content: "error: dispatcher unavailable".into(),
            });
            return Ok(());
        }

        let reply: Option<ToolReply> = tokio::select! {
            biased;
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Err(Cancelled);
                }
                None
            }
            reply = reply_rx.recv() => reply,
            _ = tokio::time::sleep(self.config.tool_timeout) => None,
        };

        let content = match reply {
            Some(ToolReply { result: Ok(value), .. }) => value.to_string(),
            Some(ToolReply { result: Err(err), .. }) => format!("error: {}", err.message),
            None => "error: tool call timed out".into(),
        };
        let outcome = if content.starts_with("error:") { "error" } else { "ok" };
        investigation.tool_usage.push(crate::types::ToolUsageRecord {
            tool_name: call.name.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            outcome: outcome.into(),
        });
        investigation.scratchpad.push(ScratchpadEntry::ToolResult {
            name: call.name.clone(),
            content,
        });
        Ok(())
    }

    async fn synthesize(&self, investigation: &mut Investigation) -> ReportOutcome {
        let prompt = format!(
            "{}\n\nProvide a final JSON object with fields rootCauseAnalysis, impactAssessment, suggestedRemediation (array of strings).",
            self.build_reasoning_prompt(investigation)
        );
        let mut cancel_dummy = watch::channel(false).1;
        let response = match self.call_reasoning(&prompt, &mut cancel_dummy).await {
            Ok(response) => response,
            Err(Cancelled) => return ReportOutcome::Failed,
        };
        investigation.scratchpad.push(ScratchpadEntry::Thought { content: response.text.clone() });
        match extract_synthesis_json(&response.text) {
            Some(_) => ReportOutcome::Completed,
            None => {
                warn!(investigation_id = %investigation.id, "synthesis JSON extraction failed at every fallback tier");
                ReportOutcome::Skeleton
            }
        }
    }

    fn finish(&self, investigation: Investigation, outcome: ReportOutcome) -> Report {
        let synthesis_text = investigation
            .scratchpad
            .iter()
            .rev()
            .find_map(|entry| match entry {
                ScratchpadEntry::Thought { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let (root_cause_analysis, impact_assessment, suggested_remediation) =
            match extract_synthesis_json(&synthesis_text) {
                Some(extracted) => extracted,
                None => (
                    "unstructured reply: manual review required".into(),
                    "unknown".into(),
                    vec!["review scratchpad manually".into()],
                ),
            };

        Report {
            investigation_id: investigation.id,
            alert_id: investigation.alert.id,
            root_cause_analysis,
            impact_assessment,
            suggested_remediation,
            scratchpad: investigation.scratchpad,
            outcome,
            generated_at: chrono::Utc::now(),
        }
    }
}

struct Cancelled;

fn priority_label(class: PriorityClass) -> &'static str {
    match class {
        PriorityClass::Critical => "critical",
        PriorityClass::High => "high",
        PriorityClass::Medium => "medium",
        PriorityClass::Low => "low",
    }
}

fn format_scratchpad_entry(entry: &ScratchpadEntry) -> String {
    match entry {
        ScratchpadEntry::Observation { content } => format!("[observation] {content}"),
        ScratchpadEntry::Thought { content } => format!("[thought] {content}"),
        ScratchpadEntry::ToolCall { name, arguments } => format!("[tool_call] {name}({arguments})"),
        ScratchpadEntry::ToolResult { name, content } => format!("[tool_result] {name} -> {content}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tool::{Tool, ToolError};
    use crate::dispatcher::ToolDispatcher;
    use crate::types::{Alert, AlertId, AlertMetadata, InvestigationId, PriorityClass};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        responses: std::sync::Mutex<Vec<GenerateResponse>>,
    }

    #[async_trait]
    impl ReasoningProvider for ScriptedProvider {
        async fn generate(
            &self,
            _prompt: &str,
            _tools: &[ToolDescriptor],
        ) -> Result<GenerateResponse, ReasoningError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(GenerateResponse {
                    text: "nothing left".into(),
                    tool_calls: vec![ToolCallRequest {
                        id: "final".into(),
                        name: "FINISH".into(),
                        arguments: "{}".into(),
                    }],
                })
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "lookup_logs"
        }
        fn description(&self) -> &str {
            "looks up logs"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({ "lines": ["oom-killer invoked"] }))
        }
    }

    fn alert() -> Alert {
        Alert {
            id: AlertId::new(),
            log: "checkout service OOM".into(),
            reason: "keyword match".into(),
            metadata: AlertMetadata::default(),
            priority_class: PriorityClass::Critical,
            priority_score: 0.9,
            enqueued_at_ms: 0,
            estimated_duration_ms: 0,
        }
    }

    fn worker(
        responses: Vec<GenerateResponse>,
        tool_requests: mpsc::UnboundedSender<ToolRequest>,
    ) -> InvestigationWorker {
        InvestigationWorker {
            config: WorkerConfig::default(),
            reasoning: Arc::new(ScriptedProvider { responses: std::sync::Mutex::new(responses) }),
            circuit_breakers: Arc::new(CircuitBreakerRegistry::default()),
            retry_config: RetryConfig::default(),
            cache: Arc::new(SimilarityCache::new(crate::cache::CacheConfig::default())),
            tool_descriptors: vec![],
            tool_requests,
            metrics: Arc::new(Registry::new()),
        }
    }

    #[tokio::test]
    async fn repeated_prompt_records_a_cache_hit_on_the_registry() {
        let dispatcher = Arc::new(ToolDispatcher::new(
            vec![Arc::new(EchoTool)],
            Arc::new(CircuitBreakerRegistry::default()),
            Duration::from_secs(1),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher.run(rx));

        let scripted = vec![GenerateResponse {
            text: r#"{"rootCauseAnalysis": "x", "impactAssessment": "y", "suggestedRemediation": []}"#.into(),
            tool_calls: vec![ToolCallRequest { id: "1".into(), name: "FINISH".into(), arguments: "{}".into() }],
        }];
        let w = worker(scripted, tx);
        let metrics = w.metrics.clone();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        w.run(Investigation::new(InvestigationId::new(), alert()), cancel_rx).await;

        let (_cancel_tx2, cancel_rx2) = watch::channel(false);
        w.run(Investigation::new(InvestigationId::new(), alert()), cancel_rx2).await;

        // Run 1 misses on both its reasoning call and its synthesis call (the
        // synthesis prompt differs from the reasoning prompt); run 2 replays
        // an identical scratchpad and hits the cache both times.
        let text = metrics.render();
        assert!(text.contains("cache_hits_total 2"));
        assert!(text.contains("cache_misses_total 2"));
    }

    #[tokio::test]
    async fn finish_without_tool_calls_produces_skeleton_on_unparseable_text() {
        let dispatcher = Arc::new(ToolDispatcher::new(
            vec![Arc::new(EchoTool)],
            Arc::new(CircuitBreakerRegistry::default()),
            Duration::from_secs(1),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher.run(rx));

        let w = worker(vec![], tx);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let investigation = Investigation::new(InvestigationId::new(), alert());
        let report = w.run(investigation, cancel_rx).await;
        assert_eq!(report.outcome, ReportOutcome::Skeleton);
    }

    #[tokio::test]
    async fn tool_call_then_finish_produces_completed_structured_report() {
        let dispatcher = Arc::new(ToolDispatcher::new(
            vec![Arc::new(EchoTool)],
            Arc::new(CircuitBreakerRegistry::default()),
            Duration::from_secs(1),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher.run(rx));

        let scripted = vec![
            GenerateResponse {
                text: "let's check logs".into(),
                tool_calls: vec![ToolCallRequest {
                    id: "1".into(),
                    name: "lookup_logs".into(),
                    arguments: "{}".into(),
                }],
            },
            GenerateResponse {
                text: r#"{"rootCauseAnalysis": "OOM killer invoked", "impactAssessment": "checkout down", "suggestedRemediation": ["scale up memory"]}"#.into(),
                tool_calls: vec![ToolCallRequest {
                    id: "2".into(),
                    name: "FINISH".into(),
                    arguments: "{}".into(),
                }],
            },
        ];
        let w = worker(scripted, tx);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let investigation = Investigation::new(InvestigationId::new(), alert());
        let report = w.run(investigation, cancel_rx).await;
        assert_eq!(report.outcome, ReportOutcome::Completed);
        assert_eq!(report.root_cause_analysis, "OOM killer invoked");
        assert_eq!(report.suggested_remediation, vec!["scale up memory".to_string()]);
        assert!(report.scratchpad.iter().any(|e| matches!(e, ScratchpadEntry::ToolResult { .. })));
    }

    #[tokio::test]
    async fn cancellation_before_reasoning_call_stops_the_worker() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let w = worker(vec![], tx);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let investigation = Investigation::new(InvestigationId::new(), alert());
        let report = w.run(investigation, cancel_rx).await;
        assert_eq!(report.outcome, ReportOutcome::Failed);
    }

    #[tokio::test]
    async fn deterministic_given_identical_scripted_replies() {
        let dispatcher = Arc::new(ToolDispatcher::new(
            vec![Arc::new(EchoTool)],
            Arc::new(CircuitBreakerRegistry::default()),
            Duration::from_secs(1),
        ));
        let (tx1, rx1) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher.clone().run(rx1));
        let (tx2, rx2) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher.run(rx2));

        let scripted = || {
            vec![GenerateResponse {
                text: r#"{"rootCauseAnalysis": "same", "impactAssessment": "same", "suggestedRemediation": ["a"]}"#.into(),
                tool_calls: vec![ToolCallRequest { id: "1".into(), name: "FINISH".into(), arguments: "{}".into() }],
            }]
        };
        let alert_value = alert();
        let w1 = worker(scripted(), tx1);
        let w2 = worker(scripted(), tx2);
        let (_c1, cr1) = watch::channel(false);
        let (_c2, cr2) = watch::channel(false);
        let r1 = w1.run(Investigation::new(InvestigationId::new(), alert_value.clone()), cr1).await;
        let r2 = w2.run(Investigation::new(InvestigationId::new(), alert_value), cr2).await;
        assert_eq!(r1.root_cause_analysis, r2.root_cause_analysis);
        assert_eq!(r1.outcome, r2.outcome);
        let _ = AtomicU32::new(0);
    }
}
