//! Failure classification and the shared retry policy.
//!
//! Every provider failure is reduced to a [`FailoverReason`] that
//! drives both circuit-breaker bookkeeping and the decision to retry.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// FailoverReason
// ---------------------------------------------------------------------------

/// Classified cause of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    Auth,
    RateLimit,
    Timeout,
    Billing,
    Format,
    Compaction,
    Unknown,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::Auth => "auth",
            FailoverReason::RateLimit => "rate_limit",
            FailoverReason::Timeout => "timeout",
            FailoverReason::Billing => "billing",
            FailoverReason::Format => "format",
            FailoverReason::Compaction => "compaction",
            FailoverReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failure with this reason is worth retrying on the same or
/// another provider. Billing, format, compaction, and auth failures
/// repeat deterministically; retrying them burns quota.
pub fn is_retryable(reason: FailoverReason) -> bool {
    matches!(reason, FailoverReason::RateLimit | FailoverReason::Timeout)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Network error codes treated as timeouts.
const NETWORK_TIMEOUT_CODES: [&str; 4] = [
    "ETIMEDOUT",
    "ESOCKETTIMEDOUT",
    "ECONNRESET",
    "ECONNABORTED",
];

const RATE_LIMIT_PATTERNS: [&str; 4] = [
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
];

const TIMEOUT_PATTERNS: [&str; 3] = ["timed out", "timeout", "deadline exceeded"];

const BILLING_PATTERNS: [&str; 4] = [
    "billing",
    "payment required",
    "insufficient credit",
    "insufficient funds",
];

const AUTH_PATTERNS: [&str; 4] = [
    "unauthorized",
    "forbidden",
    "invalid api key",
    "authentication",
];

const FORMAT_PATTERNS: [&str; 4] = [
    "invalid request",
    "malformed",
    "unsupported format",
    "schema validation",
];

const COMPACTION_PATTERNS: [&str; 4] = [
    "context length",
    "context window",
    "maximum context",
    "token limit",
];

/// Map an HTTP status code to a reason, when one applies.
fn classify_status(code: u16) -> Option<FailoverReason> {
    match code {
        402 => Some(FailoverReason::Billing),
        429 => Some(FailoverReason::RateLimit),
        401 | 403 => Some(FailoverReason::Auth),
        408 => Some(FailoverReason::Timeout),
        _ => None,
    }
}

/// Pull a `returned NNN` / `status NNN` code out of an error message.
fn status_from_message(msg: &str) -> Option<u16> {
    for marker in ["returned ", "status ", "status: "] {
        if let Some(at) = msg.find(marker) {
            let digits: String = msg[at + marker.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if digits.len() == 3 {
                if let Ok(code) = digits.parse() {
                    return Some(code);
                }
            }
        }
    }
    None
}

/// Classify an error into a [`FailoverReason`].
///
/// Precedence: explicit status codes, then network error codes, then
/// message pattern sets in the order rate_limit > timeout > billing >
/// auth > format > compaction. First match wins.
pub fn classify(err: &anyhow::Error) -> FailoverReason {
    if let Some(req_err) = err.downcast_ref::<reqwest::Error>() {
        if let Some(status) = req_err.status() {
            if let Some(reason) = classify_status(status.as_u16()) {
                return reason;
            }
        }
        if req_err.is_timeout() {
            return FailoverReason::Timeout;
        }
    }

    let msg = err.to_string();
    if let Some(code) = status_from_message(&msg) {
        if let Some(reason) = classify_status(code) {
            return reason;
        }
    }

    if NETWORK_TIMEOUT_CODES.iter().any(|c| msg.contains(c)) {
        return FailoverReason::Timeout;
    }

    let lower = msg.to_lowercase();
    let pattern_sets: [(&[&str], FailoverReason); 6] = [
        (&RATE_LIMIT_PATTERNS, FailoverReason::RateLimit),
        (&TIMEOUT_PATTERNS, FailoverReason::Timeout),
        (&BILLING_PATTERNS, FailoverReason::Billing),
        (&AUTH_PATTERNS, FailoverReason::Auth),
        (&FORMAT_PATTERNS, FailoverReason::Format),
        (&COMPACTION_PATTERNS, FailoverReason::Compaction),
    ];
    for (patterns, reason) in pattern_sets {
        if patterns.iter().any(|p| lower.contains(p)) {
            return reason;
        }
    }

    FailoverReason::Unknown
}

/// Messages an [`FailoverReason::Unknown`] failure is still retried on:
/// transient network hiccups that carry no classified reason.
const RETRYABLE_NETWORK_PATTERNS: [&str; 5] = [
    "connection refused",
    "connection reset",
    "broken pipe",
    "dns error",
    "temporarily unavailable",
];

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential-backoff retry parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubled up to the
    /// cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((scaled as u64).min(self.max_delay.as_millis() as u64))
    }
}

/// Decide whether an error should be retried at all.
fn should_retry(err: &anyhow::Error) -> bool {
    let reason = classify(err);
    if is_retryable(reason) {
        return true;
    }
    if matches!(
        reason,
        FailoverReason::Billing | FailoverReason::Format | FailoverReason::Compaction | FailoverReason::Auth
    ) {
        return false;
    }
    let lower = err.to_string().to_lowercase();
    RETRYABLE_NETWORK_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Run `op` with the retry policy: retriable failures back off and run
/// again, non-retriable ones surface immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retriable = should_retry(&e);
                if !retriable || attempt >= policy.max_retries {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    reason = %classify(&e),
                    error = %e,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
