use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounds on how hard a client retries one request.
///
/// Throttling and transient failures draw from separate budgets: a busy
/// upstream can hold us back for a long time without that counting against
/// genuine errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_throttle_retries")]
    pub max_throttle_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound on a server-directed `Retry-After` wait.
    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_max_throttle_retries() -> u32 {
    8
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_retry_after_secs() -> u64 {
    120
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_throttle_retries: default_max_throttle_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retry_after_secs: default_max_retry_after_secs(),
        }
    }
}

/// Why a request attempt did not produce a usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Timeout, connection failure, 408 or 5xx.
    Transient,
    /// 429.
    Throttled,
}

pub fn classify_status(status: reqwest::StatusCode) -> Option<Failure> {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Some(Failure::Throttled)
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        Some(Failure::Transient)
    } else {
        None
    }
}

pub fn classify_transport(err: &reqwest::Error) -> Option<Failure> {
    if err.is_timeout() || err.is_connect() {
        Some(Failure::Transient)
    } else {
        None
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// budget for this kind of failure is spent.
    pub fn delay_for(
        &self,
        attempt: u32,
        failure: Failure,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        let budget = match failure {
            Failure::Transient => self.max_attempts.saturating_sub(1),
            Failure::Throttled => self.max_throttle_retries,
        };
        if attempt == 0 || attempt > budget {
            return None;
        }

        if failure == Failure::Throttled {
            if let Some(wait) = retry_after {
                return Some(wait.min(Duration::from_secs(self.max_retry_after_secs)));
            }
        }

        Some(Duration::from_millis(self.backoff_ms(attempt)))
    }

    fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff_ms
            .saturating_mul(exponent)
            .min(self.max_backoff_ms)
    }
}

/// Up to 150ms of jitter so parallel source runs do not retry in lockstep.
pub fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..150))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            max_throttle_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            max_retry_after_secs: 60,
        }
    }

    #[test]
    fn test_transient_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1, Failure::Transient, None), Some(Duration::from_millis(100)));
        assert_eq!(p.delay_for(2, Failure::Transient, None), Some(Duration::from_millis(200)));
        // Three attempts total means two retries.
        assert_eq!(p.delay_for(3, Failure::Transient, None), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut p = policy();
        p.max_attempts = 10;
        assert_eq!(p.delay_for(4, Failure::Transient, None), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_throttle_honours_retry_after_within_cap() {
        let p = policy();
        assert_eq!(
            p.delay_for(1, Failure::Throttled, Some(Duration::from_secs(10))),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            p.delay_for(1, Failure::Throttled, Some(Duration::from_secs(600))),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_throttle_budget_is_separate() {
        let p = policy();
        assert!(p.delay_for(5, Failure::Throttled, None).is_some());
        assert_eq!(p.delay_for(6, Failure::Throttled, None), None);
        // Transient budget is already spent at attempt 3.
        assert_eq!(p.delay_for(3, Failure::Transient, None), None);
    }

    #[test]
    fn test_classify_status() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), Some(Failure::Throttled));
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Some(Failure::Transient));
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), Some(Failure::Transient));
        assert_eq!(classify_status(StatusCode::NOT_FOUND), None);
        assert_eq!(classify_status(StatusCode::OK), None);
    }

    #[test]
    fn test_parse_retry_after() {
        let value = reqwest::header::HeaderValue::from_static("12");
        assert_eq!(parse_retry_after(Some(&value)), Some(Duration::from_secs(12)));
        let date = reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&date)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let p: RetryPolicy = serde_json::from_str(r#"{"maxAttempts": 2}"#).unwrap();
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.max_throttle_retries, 8);
    }
}
