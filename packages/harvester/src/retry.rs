//! Retry policy with exponential backoff for transient request failures.
//!
//! The transport classifies every failed attempt into a [`FailureKind`] and
//! asks the [`RetryPolicy`] what to do next. The policy knows nothing about
//! HTTP; it only turns (failure kind, attempt number) into a
//! [`RetryDecision`].
//!
//! ```
//! use std::time::Duration;
//! use oaipmh_harvester::retry::{FailureKind, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8))
//!     .with_jitter(Duration::ZERO);
//!
//! let throttled = FailureKind::Transient { retry_after: Some(Duration::from_secs(2)) };
//! assert_eq!(
//!     policy.decide(&throttled, 1),
//!     RetryDecision::Retry { delay: Duration::from_secs(2), attempt: 2 }
//! );
//! assert!(matches!(policy.decide(&throttled, 3), RetryDecision::GiveUp { .. }));
//! ```

use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_BACKOFF, DEFAULT_RETRIES,
    MAX_RETRY_AFTER,
};

/// Default upper bound for random jitter added to computed delays.
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(250);

/// How a failed attempt should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// May succeed when repeated: timeouts, connection errors, 5xx, 429.
    /// `retry_after` is the server's own delay request, when it sent one.
    Transient { retry_after: Option<Duration> },

    /// Repeating the identical request will fail the same way.
    Permanent,
}

/// What the transport should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `attempt` (1-indexed).
    Retry { delay: Duration, attempt: u32 },

    /// Stop and surface the failure.
    GiveUp { reason: String },
}

/// Bounded retry policy.
///
/// Delay for the retry after attempt `n` (1-indexed):
///
/// ```text
/// retry_after                                  if the server sent one
/// min(base * multiplier^(n-1), max) + jitter   otherwise
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first one.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRIES,
            base_delay: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Replaces the jitter bound. `Duration::ZERO` makes delays deterministic.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Replaces the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what follows failed attempt `attempt` (1-indexed).
    pub fn decide(&self, kind: &FailureKind, attempt: u32) -> RetryDecision {
        let retry_after = match kind {
            FailureKind::Permanent => {
                return RetryDecision::GiveUp {
                    reason: "permanent failure".to_string(),
                };
            }
            FailureKind::Transient { retry_after } => *retry_after,
        };

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::GiveUp {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = match retry_after {
            Some(server_delay) => server_delay.min(MAX_RETRY_AFTER),
            None => self.backoff(attempt) + self.jitter(),
        };

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Exponential delay without jitter, capped at `max_delay`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Parse a `Retry-After` header value.
///
/// Accepts delay-seconds (`120`) and HTTP-dates
/// (`Wed, 21 Oct 2015 07:28:00 GMT`). Fractional seconds are tolerated since
/// some repositories send them. Values beyond [`MAX_RETRY_AFTER`] are capped;
/// dates in the past yield zero.
///
/// ```
/// use std::time::Duration;
/// use oaipmh_harvester::retry::parse_retry_after;
///
/// assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            debug!(value, "ignoring negative or non-finite Retry-After");
            return None;
        }
        if secs > MAX_RETRY_AFTER.as_secs_f64() {
            warn!(
                seconds = secs,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(Duration::from_secs_f64(secs));
    }

    match httpdate::parse_http_date(value) {
        Ok(when) => Some(
            when.duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .min(MAX_RETRY_AFTER),
        ),
        Err(_) => {
            debug!(value, "unparseable Retry-After");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(500), Duration::from_secs(3))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = deterministic();
        let transient = FailureKind::Transient { retry_after: None };

        assert_eq!(
            policy.decide(&transient, 1),
            RetryDecision::Retry {
                delay: Duration::from_millis(500),
                attempt: 2
            }
        );
        assert_eq!(
            policy.decide(&transient, 2),
            RetryDecision::Retry {
                delay: Duration::from_millis(1000),
                attempt: 3
            }
        );
        assert_eq!(
            policy.decide(&transient, 3),
            RetryDecision::Retry {
                delay: Duration::from_millis(2000),
                attempt: 4
            }
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(3))
            .with_jitter(Duration::ZERO);
        let transient = FailureKind::Transient { retry_after: None };

        match policy.decide(&transient, 8) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(3)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let policy = deterministic();
        let throttled = FailureKind::Transient {
            retry_after: Some(Duration::from_secs(2)),
        };

        assert_eq!(
            policy.decide(&throttled, 1),
            RetryDecision::Retry {
                delay: Duration::from_secs(2),
                attempt: 2
            }
        );
    }

    #[test]
    fn test_retry_after_may_be_shorter_than_backoff() {
        let policy = RetryPolicy::new(4, Duration::from_secs(5), Duration::from_secs(30))
            .with_jitter(Duration::ZERO);
        let throttled = FailureKind::Transient {
            retry_after: Some(Duration::ZERO),
        };

        assert_eq!(
            policy.decide(&throttled, 1),
            RetryDecision::Retry {
                delay: Duration::ZERO,
                attempt: 2
            }
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = deterministic();
        let transient = FailureKind::Transient { retry_after: None };
        assert!(matches!(
            policy.decide(&transient, 4),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_permanent_is_never_retried() {
        let policy = deterministic();
        assert!(matches!(
            policy.decide(&FailureKind::Permanent, 1),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_max_attempts_clamped() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(Duration::from_millis(50));
        let transient = FailureKind::Transient { retry_after: None };

        for _ in 0..20 {
            match policy.decide(&transient, 1) {
                RetryDecision::Retry { delay, .. } => {
                    assert!(delay >= Duration::from_millis(100));
                    assert!(delay <= Duration::from_millis(150));
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("1.5"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("later"), None);
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_large_values() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("1e20"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("1e300"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("inf"), None);
    }

    #[test]
    fn test_multiplier_changes_growth() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1), Duration::from_secs(60))
            .with_jitter(Duration::ZERO)
            .with_multiplier(3.0);
        let transient = FailureKind::Transient { retry_after: None };

        assert_eq!(
            policy.decide(&transient, 3),
            RetryDecision::Retry {
                delay: Duration::from_secs(9),
                attempt: 4
            }
        );
        assert_eq!(
            RetryPolicy::default().with_multiplier(0.5),
            RetryPolicy::default().with_multiplier(1.0)
        );
    }

    #[test]
    fn test_parse_retry_after_past_date() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
