//! Bounded exponential backoff retry wrapper (C1, `spec.md` §4.1).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = config.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = raw.min(config.max_delay.as_millis() as u64);
    if !config.jitter {
        return Duration::from_millis(capped);
    }
    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(0.75..=1.25);
    Duration::from_millis((capped as f64 * jitter_factor) as u64)
}

/// Standard retry predicate for network-level transport errors.
pub fn is_network_retryable(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("connection reset")
        || m.contains("connection refused")
        || m.contains("unreachable")
        || m.contains("timed out")
        || m.contains("timeout")
}

/// Standard retry predicate for HTTP status codes: 408, 425, 429, and 5xx
/// except 501 and 505, per `spec.md` §4.1.
pub fn is_http_retryable(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (status >= 500 && status < 600 && status != 501 && status != 505)
}

/// Standard retry predicate for the reasoning service: rate-limit, timeout,
/// transient overload. Auth failures (401/403) never retry.
pub fn is_reasoning_retryable(status: Option<u16>, message: &str) -> bool {
    if let Some(code) = status {
        if code == 401 || code == 403 {
            return false;
        }
        if is_http_retryable(code) {
            return true;
        }
    }
    let m = message.to_lowercase();
    m.contains("rate limit") || m.contains("overload") || is_network_retryable(&m)
}

/// Run `op` up to `config.max_retries` additional times, using
/// `should_retry` to decide whether a given error is worth retrying.
/// Returns the last error if every attempt is exhausted — a call that
/// fails `R+1` times returns the last error, never silently succeeds.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_retries || !should_retry(&err) {
                    return Err(err);
                }
                tokio::time::sleep(delay_for_attempt(config, attempt)).await;
                attempt += 1;
            }
        }
    }
}
