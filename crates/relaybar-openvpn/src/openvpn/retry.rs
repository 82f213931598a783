//! Bounded exponential backoff with cooperative cancellation.

use relaybar_core::VpnError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `fut` unless `token` fires first, in which case the future is
/// dropped and `Cancelled` returned.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, VpnError>
where
    F: Future<Output = Result<T, VpnError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(VpnError::Cancelled),
        r = fut => r,
    }
}

/// Sleep that ends early with `Cancelled`.
pub async fn sleep_or_cancel(token: &CancellationToken, d: Duration) -> Result<(), VpnError> {
    cancellable(token, async {
        tokio::time::sleep(d).await;
        Ok(())
    })
    .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `max_attempts` counts retries, so an operation runs at most
/// `max_attempts + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `min(base_delay * 2^attempt, max_delay)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with an error `is_retryable`
    /// rejects, or the attempts run out.
    ///
    /// The token is checked before every attempt and raced against both
    /// the attempt and the backoff sleep. Cancellation is returned as
    /// `VpnError::Cancelled` and never retried.
    pub async fn run<T, F, Fut, R>(
        &self,
        token: &CancellationToken,
        is_retryable: R,
        mut op: F,
    ) -> Result<T, VpnError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, VpnError>>,
        R: Fn(&VpnError) -> bool,
    {
        let mut attempt = 0;
        loop {
            if token.is_cancelled() {
                return Err(VpnError::Cancelled);
            }
            let err = match cancellable(token, op(attempt)).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if err.is_cancellation() || !is_retryable(&err) || attempt >= self.max_attempts {
                return Err(err);
            }
            let delay = self.delay_for(attempt);
            log::warn!(
                "Attempt {} of {} failed ({}), retrying in {:?}",
                attempt + 1,
                self.max_attempts + 1,
                err,
                delay
            );
            sleep_or_cancel(token, delay).await?;
            attempt += 1;
        }
    }
}

/// Named presets selectable from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    Conservative,
    #[default]
    #[serde(rename = "default")]
    Standard,
    Aggressive,
}

impl RetryPreset {
    pub fn policy(self) -> RetryPolicy {
        match self {
            Self::Conservative => RetryPolicy::conservative(),
            Self::Standard => RetryPolicy::default(),
            Self::Aggressive => RetryPolicy::aggressive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_then_caps() {
        let p = RetryPolicy::default();
        for i in 0..=p.max_attempts {
            let expected = (p.base_delay * 2u32.pow(i)).min(p.max_delay);
            assert_eq!(p.delay_for(i), expected);
        }
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
        assert_eq!(p.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn delay_saturates_on_huge_attempts() {
        let p = RetryPolicy::aggressive();
        assert_eq!(p.delay_for(40), p.max_delay);
        assert_eq!(p.delay_for(u32::MAX), p.max_delay);
    }

    #[test]
    fn presets() {
        assert_eq!(RetryPreset::Conservative.policy().max_attempts, 2);
        assert_eq!(RetryPreset::Standard.policy(), RetryPolicy::default());
        assert_eq!(RetryPreset::Aggressive.policy().base_delay, Duration::from_millis(500));
        let p: RetryPreset = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(p, RetryPreset::Standard);
        assert_eq!(serde_json::to_string(&RetryPreset::Aggressive).unwrap(), "\"aggressive\"");
    }

    #[tokio::test]
    async fn runs_max_attempts_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let token = CancellationToken::new();
        let res: Result<(), _> = fast(3)
            .run(&token, VpnError::is_retryable, |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(VpnError::ConnectionFailed("flaky".into()))
                }
            })
            .await;
        assert_eq!(res.unwrap_err(), VpnError::ConnectionFailed("flaky".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let token = CancellationToken::new();
        let res = fast(3)
            .run(&token, VpnError::is_retryable, |attempt| async move {
                if attempt < 2 {
                    Err(VpnError::Timeout)
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 2);
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let token = CancellationToken::new();
        let res: Result<(), _> = fast(5)
            .run(&token, VpnError::is_retryable, |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(VpnError::AuthenticationCancelled)
                }
            })
            .await;
        assert_eq!(res.unwrap_err(), VpnError::AuthenticationCancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let res: Result<(), _> = fast(3)
            .run(&token, |_| true, |_| async {
                Err::<(), _>(VpnError::Protocol("must not run".into()))
            })
            .await;
        assert_eq!(res.unwrap_err(), VpnError::Cancelled);
    }

    #[tokio::test]
    async fn cancel_during_backoff_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let token = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            t2.cancel();
        });
        let started = std::time::Instant::now();
        let res: Result<(), _> = policy
            .run(&token, |_| true, |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(VpnError::Timeout)
                }
            })
            .await;
        assert_eq!(res.unwrap_err(), VpnError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancel_interrupts_running_attempt() {
        let token = CancellationToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t2.cancel();
        });
        let res: Result<(), _> = RetryPolicy::none()
            .run(&token, |_| true, |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(res.unwrap_err().is_cancellation());
    }
}
