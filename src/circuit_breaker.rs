//! Circuit breaker and retry policy guarding outbound calls (C1).
//!
//! Three-state machine per protected endpoint: CLOSED -> OPEN -> HALF_OPEN
//! -> CLOSED, per `spec.md` §4.1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::CircuitBreakerError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservableState {
    Closed,
    Open,
    HalfOpen,
}

impl From<CircuitState> for ObservableState {
    fn from(s: CircuitState) -> Self {
        match s {
            CircuitState::Closed => ObservableState::Closed,
            CircuitState::Open { .. } => ObservableState::Open,
            CircuitState::HalfOpen => ObservableState::HalfOpen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            monitoring_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitMetrics {
    pub total_requests: AtomicU64,
    pub total_successes: AtomicU64,
    pub total_failures: AtomicU64,
}

impl Clone for CircuitMetrics {
    fn clone(&self) -> Self {
        Self {
            total_requests: AtomicU64::new(self.total_requests.load(Ordering::Relaxed)),
            total_successes: AtomicU64::new(self.total_successes.load(Ordering::Relaxed)),
            total_failures: AtomicU64::new(self.total_failures.load(Ordering::Relaxed)),
        }
    }
}

/// A single endpoint's breaker. State transitions are serialised by the
/// caller holding `&mut self` (the registry wraps each breaker in a lock).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Failure timestamps within the current monitoring window.
    failures_in_window: Vec<Instant>,
    /// Consecutive successes observed while HALF_OPEN.
    half_open_successes: u32,
    metrics: CircuitMetrics,
    last_transition_at: Instant,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures_in_window: Vec::new(),
            half_open_successes: 0,
            metrics: CircuitMetrics::default(),
            last_transition_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ObservableState {
        self.state.into()
    }

    pub fn failure_count(&self) -> usize {
        self.failures_in_window.len()
    }

    /// Admit or reject a call given current state. Transitions OPEN ->
    /// HALF_OPEN if `recovery_timeout` has elapsed.
    pub fn check(&mut self, endpoint: &str) -> Result<(), CircuitBreakerError> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    self.transition_to(CircuitState::HalfOpen);
                    Ok(())
                } else {
                    let retry_after = self
                        .config
                        .recovery_timeout
                        .saturating_sub(opened_at.elapsed());
                    Err(CircuitBreakerError::Open {
                        endpoint: endpoint.to_string(),
                        retry_after_ms: retry_after.as_millis() as u64,
                    })
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.metrics
            .total_successes
            .fetch_add(1, Ordering::Relaxed);
        match self.state {
            CircuitState::Closed => {
                self.prune_window();
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.metrics.total_failures.fetch_add(1, Ordering::Relaxed);
        match self.state {
            CircuitState::Closed => {
                self.prune_window();
                self.failures_in_window.push(Instant::now());
                if self.failures_in_window.len() as u32 >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open {
                        opened_at: Instant::now(),
                    });
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open {
                    opened_at: Instant::now(),
                });
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn force_open(&mut self) {
        self.transition_to(CircuitState::Open {
            opened_at: Instant::now(),
        });
    }

    pub fn force_close(&mut self) {
        self.transition_to(CircuitState::Closed);
    }

    fn prune_window(&mut self) {
        let cutoff = Instant::now() - self.config.monitoring_period;
        self.failures_in_window.retain(|t| *t >= cutoff);
    }

    fn transition_to(&mut self, new_state: CircuitState) {
        self.state = new_state;
        self.last_transition_at = Instant::now();
        if matches!(new_state, CircuitState::Closed) {
            self.failures_in_window.clear();
            self.half_open_successes = 0;
        }
        if matches!(new_state, CircuitState::Open { .. }) {
            self.half_open_successes = 0;
        }
    }
}

/// Per-endpoint breakers, auto-created with default config on first use.
/// Circuit breakers are per-endpoint singletons; state transitions are
/// serialised per `spec.md` §5.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub async fn check(&self, endpoint: &str) -> Result<(), CircuitBreakerError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.check(endpoint)
    }

    pub async fn record_success(&self, endpoint: &str) {
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()))
            .record_success();
    }

    pub async fn record_failure(&self, endpoint: &str) {
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()))
            .record_failure();
    }

    pub async fn get_state(&self, endpoint: &str) -> Option<ObservableState> {
        self.breakers.read().await.get(endpoint).map(|b| b.state())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
