//! Exponential-backoff retry driver.
//!
//! Transient errors (unreachable, timeout) retry on the configured
//! schedule; rejections fail fast; cancellation aborts the wait.

use std::time::Duration;

use ork_domain::config::RetryConfig;

use crate::cancel::CancelToken;
use crate::traits::{Completion, CompletionRequest, ModelProvider, ProviderError};

/// Backoff schedule: `base * factor^(attempt-1)` capped at `cap`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            base_ms: c.base_ms,
            factor: c.factor,
            cap_ms: c.cap_ms,
            max_attempts: c.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given 1-based failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.base_ms as f64 * exp).min(self.cap_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Drive a provider call through the retry schedule.
///
/// `on_retry(attempt, delay, error)` fires once per scheduled retry so
/// the caller can append its audit event.
pub async fn complete_with_retry(
    provider: &dyn ModelProvider,
    req: &CompletionRequest,
    cancel: &CancelToken,
    policy: RetryPolicy,
    mut on_retry: impl FnMut(u32, Duration, &ProviderError),
) -> Result<Completion, ProviderError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match provider.complete(req, cancel).await {
            Ok(completion) => return Ok(completion),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    provider = provider.provider_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error, backing off"
                );
                on_retry(attempt, delay, &e);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubProvider;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_ms: 5,
            factor: 2.0,
            cap_ms: 40,
            max_attempts,
        }
    }

    #[test]
    fn schedule_follows_base_factor_cap() {
        let policy = RetryPolicy {
            base_ms: 1000,
            factor: 2.0,
            cap_ms: 30_000,
            max_attempts: 5,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_after(4), Duration::from_millis(8000));
        // Deep attempts hit the cap.
        assert_eq!(policy.delay_after(10), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let stub = StubProvider::new(vec![
            Err(ProviderError::Unreachable("refused".into())),
            Err(ProviderError::Unreachable("refused".into())),
            Ok(StubProvider::completion("ok")),
        ]);
        let cancel = CancelToken::new();
        let mut retries = Vec::new();

        let out = complete_with_retry(
            &stub,
            &CompletionRequest::default(),
            &cancel,
            fast_policy(5),
            |attempt, delay, _| retries.push((attempt, delay)),
        )
        .await
        .unwrap();

        assert_eq!(out.text, "ok");
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].0, 1);
        assert_eq!(retries[1].0, 2);
        // Backoff doubles between the two scheduled retries.
        assert_eq!(retries[1].1, retries[0].1 * 2);
    }

    #[tokio::test]
    async fn rejection_fails_fast_without_retry() {
        let stub = StubProvider::new(vec![
            Err(ProviderError::Rejected {
                status: 400,
                message: "bad prompt".into(),
            }),
            Ok(StubProvider::completion("never reached")),
        ]);
        let cancel = CancelToken::new();
        let mut retries = 0;

        let out = complete_with_retry(
            &stub,
            &CompletionRequest::default(),
            &cancel,
            fast_policy(5),
            |_, _, _| retries += 1,
        )
        .await;

        assert!(matches!(out, Err(ProviderError::Rejected { .. })));
        assert_eq!(retries, 0);
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_transient_error() {
        let stub = StubProvider::new(vec![Err(ProviderError::Timeout("slow".into()))]);
        let cancel = CancelToken::new();
        let mut retries = 0;

        let out = complete_with_retry(
            &stub,
            &CompletionRequest::default(),
            &cancel,
            fast_policy(3),
            |_, _, _| retries += 1,
        )
        .await;

        assert!(matches!(out, Err(ProviderError::Timeout(_))));
        assert_eq!(retries, 2);
        assert_eq!(stub.call_count(), 3);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_backoff_wait() {
        let stub = StubProvider::new(vec![Err(ProviderError::Unreachable("refused".into()))]);
        let cancel = CancelToken::new();
        let policy = RetryPolicy {
            base_ms: 60_000,
            factor: 2.0,
            cap_ms: 60_000,
            max_attempts: 5,
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let out = complete_with_retry(
            &stub,
            &CompletionRequest::default(),
            &cancel,
            policy,
            |_, _, _| {},
        )
        .await;
        assert!(matches!(out, Err(ProviderError::Cancelled)));
    }
}
