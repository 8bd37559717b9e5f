use reqwest::StatusCode;
use std::time::{Duration, SystemTime};

/// Transport-level retry policy of the HTTP client. The translation pipeline
/// itself never retries; this only covers rate limits and flaky connections
/// on a single request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay used for the first retry attempt.
    pub base_delay: Duration,
    /// Upper bound for any delay, including server hints.
    pub max_delay: Duration,
    /// Maximum number of retries after the initial request.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub const fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    pub const fn disabled() -> Self {
        Self::new(Duration::from_millis(0), Duration::from_millis(0), 0)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60), 2)
    }
}

/// Failure classes that influence retry decisions.
#[derive(Debug, Clone, Copy)]
pub enum RetryCause {
    Http {
        status: StatusCode,
        retry_after: Option<Duration>,
    },
    Network,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    pub used_hint: bool,
}

impl RetryDecision {
    const fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::from_millis(0),
            used_hint: false,
        }
    }

    fn after(delay: Duration, used_hint: bool, max_delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay: delay.min(max_delay),
            used_hint,
        }
    }
}

/// `previous_attempts` counts the retries already made for this request.
pub fn evaluate_retry(cause: RetryCause, policy: RetryPolicy, previous_attempts: u32) -> RetryDecision {
    if previous_attempts >= policy.max_retries {
        return RetryDecision::give_up();
    }

    match cause {
        RetryCause::Fatal => RetryDecision::give_up(),
        RetryCause::Http { status, .. } if !is_retryable_status(status) => RetryDecision::give_up(),
        RetryCause::Http {
            retry_after: Some(hint),
            ..
        } => RetryDecision::after(hint, true, policy.max_delay),
        RetryCause::Http { .. } | RetryCause::Network => RetryDecision::after(
            exponential_backoff(policy.base_delay, previous_attempts),
            false,
            policy.max_delay,
        ),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn exponential_backoff(base: Duration, previous_attempts: u32) -> Duration {
    let multiplier = 1u32.checked_shl(previous_attempts).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier)
}

/// Parses an HTTP `Retry-After` value, either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let instant = httpdate::parse_http_date(trimmed).ok()?;
    Some(instant.duration_since(now).unwrap_or(Duration::from_secs(0)))
}
