//! Crate-wide error taxonomy.
//!
//! One `thiserror` enum per subsystem, unified under [`SeraphError`], matching
//! the error classes in `spec.md` §7: `Validation`, `Admission`, `Transient`,
//! `CircuitOpen`, `Blocked`, `Internal`.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SeraphError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("circuit breaker: {0}")]
    CircuitBreaker(#[from] CircuitBreakerError),

    #[error("dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("alerter error: {0}")]
    Alerter(#[from] AlerterError),

    #[error("ingress error: {0}")]
    Ingress(#[from] IngressError),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("failed to read config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("keyword pattern rejected as unsafe: {pattern}")]
    UnsafeRegex { pattern: String },
}

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("queue is full")]
    QueueFull,
    #[error("alert {0} not found in queue")]
    NotFound(String),
}

#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug, Clone)]
pub enum CircuitBreakerError {
    #[error("circuit open for endpoint {endpoint}, retry after {retry_after_ms}ms")]
    Open {
        endpoint: String,
        retry_after_ms: u64,
    },
}

#[derive(Error, Debug, Clone)]
pub enum RetryError<E> {
    #[error("exhausted retries: {0}")]
    Exhausted(E),
}

/// Normalised tool-invocation failure, per `spec.md` §4.8.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("tool call timed out")]
    Timeout,
    #[error("upstream tool error: {0}")]
    Upstream(String),
    #[error("blocked by safety filter: {0}")]
    Blocked(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

#[derive(Error, Debug, Clone)]
pub enum AlerterError {
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

#[derive(Error, Debug, Clone)]
pub enum IngressError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("empty or non-string body")]
    EmptyBody,
    #[error("rejected injection-like payload")]
    Injection,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("authentication required")]
    Unauthorized,
}
