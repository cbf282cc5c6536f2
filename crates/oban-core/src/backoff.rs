//! Exponential backoff + jitter, and the retry-with-retry helper for
//! transient store errors.

use crate::error::{Categorizable, SafeErrorCategory};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// `exponential(attempt) = min(2^attempt * mult + padding, cap)`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub mult_seconds: f64,
    pub padding_seconds: f64,
    pub cap_seconds: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            mult_seconds: 1.0,
            padding_seconds: 0.0,
            cap_seconds: 24.0 * 3600.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn base_seconds(&self, attempt: i32) -> f64 {
        let attempt = attempt.max(0) as i32;
        let raw = 2f64.powi(attempt) * self.mult_seconds + self.padding_seconds;
        raw.min(self.cap_seconds)
    }
}

/// How jitter is applied around the base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    /// Only ever shortens the delay.
    Dec,
    /// Only ever lengthens the delay.
    Inc,
    /// Both directions (the default).
    Both,
}

/// `j` is the jitter fraction (default 0.10): the base is multiplied by a
/// factor drawn uniformly from `[1-j, 1+j]` (or a one-sided half of that
/// range depending on `mode`).
#[derive(Debug, Clone, Copy)]
pub struct Jitter {
    pub fraction: f64,
    pub mode: JitterMode,
}

impl Default for Jitter {
    fn default() -> Self {
        Self {
            fraction: 0.10,
            mode: JitterMode::Both,
        }
    }
}

impl Jitter {
    pub fn apply(&self, base_seconds: f64) -> f64 {
        let mut rng = rand::thread_rng();
        let factor = match self.mode {
            JitterMode::Both => rng.gen_range((1.0 - self.fraction)..=(1.0 + self.fraction)),
            JitterMode::Inc => rng.gen_range(1.0..=(1.0 + self.fraction)),
            JitterMode::Dec => rng.gen_range((1.0 - self.fraction)..=1.0),
        };
        (base_seconds * factor).max(0.0)
    }
}

/// The full policy an executor applies to compute the next retry delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffPolicy {
    pub exponential: ExponentialBackoff,
    pub jitter: Jitter,
}

impl BackoffPolicy {
    /// Computes `now + backoff(attempt)` as a `chrono::Duration`-friendly
    /// number of seconds, applying jitter.
    pub fn delay_seconds(&self, attempt: i32) -> f64 {
        let base = self.exponential.base_seconds(attempt);
        self.jitter.apply(base)
    }

    pub fn delay(&self, attempt: i32) -> Duration {
        Duration::from_secs_f64(self.delay_seconds(attempt).max(0.0))
    }
}

/// Retry-with-retry: wraps a single DB operation with up to `max_tries`
/// attempts across transient errors, sleeping between tries using the
/// same exponential+jitter policy. Non-transient errors
/// return immediately on the first failure.
pub struct RetryPolicy {
    pub max_tries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Categorizable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                let transient = matches!(e.category(), SafeErrorCategory::Transient);
                if !transient || attempt >= policy.max_tries {
                    return Err(e);
                }
                let delay = policy.backoff.delay(attempt as i32);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_is_monotonic_until_cap() {
        let b = ExponentialBackoff::default();
        let mut prev = 0.0;
        for attempt in 0..10 {
            let v = b.base_seconds(attempt);
            assert!(v >= prev);
            prev = v;
        }
    }

    #[test]
    fn exponential_respects_cap() {
        let b = ExponentialBackoff {
            cap_seconds: 100.0,
            ..Default::default()
        };
        assert_eq!(b.base_seconds(30), 100.0);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let j = Jitter {
            fraction: 0.10,
            mode: JitterMode::Both,
        };
        for _ in 0..200 {
            let out = j.apply(100.0);
            assert!((90.0..=110.0).contains(&out), "out of bounds: {out}");
        }
    }

    #[test]
    fn jitter_dec_never_increases() {
        let j = Jitter {
            fraction: 0.10,
            mode: JitterMode::Dec,
        };
        for _ in 0..200 {
            assert!(j.apply(100.0) <= 100.0);
        }
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_non_transient() {
        use crate::error::JobStoreError;
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<(), JobStoreError> = with_retry(&policy, || {
            calls += 1;
            async { Err(JobStoreError::NotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn with_retry_retries_transient_up_to_max_tries() {
        use crate::error::JobStoreError;
        let policy = RetryPolicy {
            max_tries: 3,
            backoff: BackoffPolicy {
                exponential: ExponentialBackoff {
                    mult_seconds: 0.0001,
                    padding_seconds: 0.0001,
                    cap_seconds: 0.001,
                },
                jitter: Jitter {
                    fraction: 0.0,
                    mode: JitterMode::Both,
                },
            },
        };
        let mut calls = 0;
        let result: Result<(), JobStoreError> = with_retry(&policy, || {
            calls += 1;
            async { Err(JobStoreError::DbUnavailable("connection refused".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
