//! End-to-end scenarios exercising the full `Seraph` composition root over
//! real HTTP: admission through to investigation completion, duplicate
//! suppression, and a circuit trip surfacing in the metrics endpoint.
//!
//! Module-level scenarios (queue overload/eviction, preemption, aging,
//! path traversal, rate limiting) are already covered where they live:
//! `scheduler::tests`, `dispatcher::safety::tests`, `ingress::tests`.
//! These tests cover what only exists once every component is wired
//! together by `Seraph::new`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use seraph_core::config::RuntimeConfig;
use seraph_core::reasoning::{GenerateResponse, ReasoningError, ReasoningProvider, ToolCallRequest, ToolDescriptor};
use seraph_core::Seraph;

struct FinishImmediately;

#[async_trait]
impl ReasoningProvider for FinishImmediately {
    async fn generate(&self, _prompt: &str, _tools: &[ToolDescriptor]) -> Result<GenerateResponse, ReasoningError> {
        Ok(GenerateResponse {
            text: r#"{"rootCauseAnalysis":"disk pressure","impactAssessment":"checkout degraded","suggestedRemediation":["grow volume"]}"#.into(),
            tool_calls: vec![ToolCallRequest { id: "1".into(), name: "FINISH".into(), arguments: "{}".into() }],
        })
    }
}

struct AlwaysUnauthorized;

#[async_trait]
impl ReasoningProvider for AlwaysUnauthorized {
    async fn generate(&self, _prompt: &str, _tools: &[ToolDescriptor]) -> Result<GenerateResponse, ReasoningError> {
        Err(ReasoningError::Auth("no credentials".into()))
    }
}

fn config_on_port(port: u16) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.port = port;
    config.bind_address = "127.0.0.1".into();
    config
}

async fn spawn_seraph(config: RuntimeConfig, reasoning: Arc<dyn ReasoningProvider>) -> watch::Sender<bool> {
    let seraph = Seraph::new(config, reasoning, vec![], None).expect("valid config");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = seraph.run(shutdown_rx).await;
    });
    shutdown_tx
}

async fn wait_for_ready(base: &str, client: &reqwest::Client) {
    for _ in 0..50 {
        if let Ok(resp) = client.get(format!("{base}/status")).send().await {
            if resp.status() == reqwest::StatusCode::OK {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server never became ready");
}

async fn wait_for_metric(base: &str, client: &reqwest::Client, needle: &str) -> String {
    for _ in 0..60 {
        if let Ok(resp) = client.get(format!("{base}/metrics")).send().await {
            if let Ok(body) = resp.text().await {
                if body.contains(needle) {
                    return body;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("metric containing {needle:?} never appeared");
}

#[tokio::test]
async fn admitted_log_drives_an_investigation_to_completion() {
    let port = 18180;
    let base = format!("http://127.0.0.1:{port}");
    let shutdown = spawn_seraph(config_on_port(port), Arc::new(FinishImmediately)).await;

    let client = reqwest::Client::new();
    wait_for_ready(&base, &client).await;

    let response = client
        .post(format!("{base}/logs"))
        .body("checkout-db-3 disk usage at 95%, out of memory killer invoked")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let body = wait_for_metric(&base, &client, "investigations_completed_total").await;
    assert!(body.contains("investigations_started_total"));

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn duplicate_log_is_admitted_twice_but_scheduled_once() {
    let port = 18181;
    let base = format!("http://127.0.0.1:{port}");
    let shutdown = spawn_seraph(config_on_port(port), Arc::new(FinishImmediately)).await;

    let client = reqwest::Client::new();
    wait_for_ready(&base, &client).await;

    for _ in 0..2 {
        let response = client
            .post(format!("{base}/logs"))
            .body("identical payload for dedup check")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    }

    let body = wait_for_metric(&base, &client, "logs_dropped_total").await;
    assert!(body.contains(r#"logs_dropped_total{reason="duplicate"}"#));

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn repeated_reasoning_failures_trip_the_circuit_and_surface_in_metrics() {
    let port = 18182;
    let base = format!("http://127.0.0.1:{port}");
    let shutdown = spawn_seraph(config_on_port(port), Arc::new(AlwaysUnauthorized)).await;

    let client = reqwest::Client::new();
    wait_for_ready(&base, &client).await;

    for i in 0..4 {
        let response = client
            .post(format!("{base}/logs"))
            .body(format!("distinct alert body number {i} to avoid dedup"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    }

    let body = wait_for_metric(&base, &client, r#"circuit_state{endpoint="reasoning-service"}"#).await;
    assert!(
        body.contains(r#"circuit_state{endpoint="reasoning-service"} 2"#),
        "expected the reasoning-service circuit to be open (state 2), got:\n{body}"
    );

    let _ = shutdown.send(true);
}
