//! Ingress (C10): the HTTP admission surface (`spec.md` §4.10).
//!
//! Grounded on the webhook server's auth/concurrency pattern, generalised
//! from a single webhook path to the four Seraph routes and from a
//! `Semaphore` concurrency cap to a per-client token bucket (the admission
//! policy needs genuine "N requests per window" semantics, which a
//! semaphore can't express). Admission never waits on triage or
//! investigation: a valid request gets `202 Accepted` and the body is
//! hand off over a channel for the main context to pick up on its own time.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::metrics::Registry;
use crate::reasoning::ReasoningProvider;

const ONE_MIB: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub rate_limit_per_minute: u32,
    pub api_key: Option<String>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            port: 8080,
            max_body_bytes: ONE_MIB,
            rate_limit_per_minute: 100,
            api_key: None,
        }
    }
}

/// A log line (or JSON log) that passed admission and is ready for triage.
#[derive(Debug, Clone)]
pub struct AdmittedLog {
    pub message: String,
    pub level: Option<String>,
    pub service: Option<String>,
    pub tags: std::collections::HashMap<String, String>,
    pub client_id: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /logs` accepts either a raw line or a JSON object with at least
/// `message`; everything else about the JSON shape is optional.
fn parse_log_body(text: &str) -> AdmittedLogFields {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(text) {
        let message = map.get("message").and_then(|v| v.as_str()).map(str::to_string);
        let Some(message) = message else {
            return AdmittedLogFields { message: text.to_string(), level: None, service: None, tags: Default::default() };
        };
        let level = map.get("level").and_then(|v| v.as_str()).map(str::to_string);
        let service = map.get("service").and_then(|v| v.as_str()).map(str::to_string);
        let tags = map
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "message" | "level" | "service" | "timestamp"))
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        AdmittedLogFields { message, level, service, tags }
    } else {
        AdmittedLogFields { message: text.to_string(), level: None, service: None, tags: Default::default() }
    }
}

struct AdmittedLogFields {
    message: String,
    level: Option<String>,
    service: Option<String>,
    tags: std::collections::HashMap<String, String>,
}

/// Readiness and counters published by the main context for `GET /status`,
/// read-only from the ingress side so it never touches the scheduler
/// directly.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusView {
    pub ready: bool,
    pub queue_size: usize,
    pub running_investigations: usize,
    pub burst_mode_active: bool,
}

type ClientLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Clone)]
pub struct IngressState {
    config: Arc<IngressConfig>,
    admitted_tx: mpsc::UnboundedSender<AdmittedLog>,
    limiter: Arc<ClientLimiter>,
    metrics: Arc<Registry>,
    status: Arc<RwLock<StatusView>>,
    reasoning: Option<Arc<dyn ReasoningProvider>>,
    shutting_down: Arc<AtomicBool>,
}

impl IngressState {
    pub fn new(
        config: IngressConfig,
        metrics: Arc<Registry>,
        status: Arc<RwLock<StatusView>>,
        reasoning: Option<Arc<dyn ReasoningProvider>>,
    ) -> (Self, mpsc::UnboundedReceiver<AdmittedLog>) {
        let quota = Quota::per_minute(
            NonZeroU32::new(config.rate_limit_per_minute.max(1)).expect("nonzero by construction"),
        );
        let (admitted_tx, admitted_rx) = mpsc::unbounded_channel();
        let state = Self {
            config: Arc::new(config),
            admitted_tx,
            limiter: Arc::new(RateLimiter::keyed(quota)),
            metrics,
            status,
            reasoning,
            shutting_down: Arc::new(AtomicBool::new(false)),
        };
        (state, admitted_rx)
    }

    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

pub fn build_router(state: IngressState) -> Router {
    let protected = Router::new()
        .route("/logs", post(logs_handler))
        .route("/chat", post(chat_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes + 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<IngressState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.api_key.as_ref() else {
        return Ok(next.run(request).await);
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    subtle::ConstantTimeEq::ct_eq(a, b).into()
}

fn client_id(headers: &HeaderMap) -> String {
    headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

fn injection_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\beval\s*\(|\bexec\s*\(|<script[\s>]|\$\{.*\}|\{\{.*\}\}").unwrap()
    })
}

fn looks_like_injection(body: &str) -> bool {
    injection_pattern().is_match(body)
}

async fn logs_handler(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if state.shutting_down.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let client = client_id(&headers);

    if state.limiter.check_key(&client).is_err() {
        state.metrics.inc_logs_dropped("rate_limited");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    if body.len() > state.config.max_body_bytes {
        state.metrics.inc_logs_dropped("too_large");
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    if body.is_empty() {
        state.metrics.inc_logs_dropped("empty_body");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let text = match std::str::from_utf8(&body) {
        Ok(text) if !text.trim().is_empty() => text.to_string(),
        _ => {
            state.metrics.inc_logs_dropped("non_string_body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if looks_like_injection(&text) {
        state.metrics.inc_logs_dropped("injection_signature");
        warn!(%client, "rejected log payload matching an injection signature");
        return StatusCode::BAD_REQUEST.into_response();
    }

    state.metrics.inc_logs_received();
    let fields = parse_log_body(&text);
    let admitted = AdmittedLog {
        message: fields.message,
        level: fields.level,
        service: fields.service,
        tags: fields.tags,
        client_id: client,
        received_at: chrono::Utc::now(),
    };
    // The receiver lives in the main context; if it's gone we're shutting
    // down and there's nobody left to triage this anyway.
    let _ = state.admitted_tx.send(admitted);

    StatusCode::ACCEPTED.into_response()
}

#[derive(Serialize)]
struct ChatResponse {
    text: String,
}

async fn chat_handler(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let client = client_id(&headers);

    if state.limiter.check_key(&client).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if body.len() > state.config.max_body_bytes {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }
    let Ok(text) = std::str::from_utf8(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if text.trim().is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if looks_like_injection(text) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let Some(reasoning) = state.reasoning.clone() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    match reasoning.generate(text, &[]).await {
        Ok(response) => Json(ChatResponse { text: response.text }).into_response(),
        Err(err) => {
            let status = err.http_status().and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            status.into_response()
        }
    }
}

async fn status_handler(State(state): State<IngressState>) -> Response {
    let view = state.status.read().clone();
    let code = if view.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(view)).into_response()
}

async fn metrics_handler(State(state): State<IngressState>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> (IngressState, mpsc::UnboundedReceiver<AdmittedLog>) {
        IngressState::new(
            IngressConfig { rate_limit_per_minute: 2, ..IngressConfig::default() },
            Arc::new(Registry::new()),
            Arc::new(RwLock::new(StatusView { ready: true, ..Default::default() })),
            None,
        )
    }

    #[tokio::test]
    async fn valid_log_is_accepted_and_forwarded() {
        let (state, mut rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(Request::post("/logs").body(Body::from("disk usage 92%")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let admitted = rx.recv().await.unwrap();
        assert_eq!(admitted.message, "disk usage 92%");
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(Request::post("/logs").body(Body::from("")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let (mut state, _rx) = test_state();
        state = IngressState::new(
            IngressConfig { max_body_bytes: 10, rate_limit_per_minute: 100, ..IngressConfig::default() },
            Arc::new(Registry::new()),
            Arc::new(RwLock::new(StatusView::default())),
            None,
        )
        .0;
        let app = build_router(state);
        let response = app
            .oneshot(Request::post("/logs").body(Body::from("this body is far too long")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn injection_signature_is_rejected() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::post("/logs")
                    .body(Body::from("user input: <script>alert(1)</script>"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limit_trips_after_quota_exhausted() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(Request::post("/logs").body(Body::from("line")).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        let response = app
            .oneshot(Request::post("/logs").body(Body::from("line")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn missing_bearer_token_is_rejected_when_key_configured() {
        let (state, _rx) = IngressState::new(
            IngressConfig { api_key: Some("secret-key".into()), ..IngressConfig::default() },
            Arc::new(Registry::new()),
            Arc::new(RwLock::new(StatusView::default())),
            None,
        );
        let app = build_router(state);
        let response = app
            .oneshot(Request::post("/logs").body(Body::from("line")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_bearer_token_is_accepted() {
        let (state, _rx) = IngressState::new(
            IngressConfig { api_key: Some("secret-key".into()), ..IngressConfig::default() },
            Arc::new(Registry::new()),
            Arc::new(RwLock::new(StatusView::default())),
            None,
        );
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::post("/logs")
                    .header("authorization", "Bearer secret-key")
                    .body(Body::from("line"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn status_and_metrics_are_unauthenticated() {
        let (state, _rx) = IngressState::new(
            IngressConfig { api_key: Some("secret-key".into()), ..IngressConfig::default() },
            Arc::new(Registry::new()),
            Arc::new(RwLock::new(StatusView { ready: true, ..Default::default() })),
            None,
        );
        let app = build_router(state);
        let response = app.clone().oneshot(Request::get("/status").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
