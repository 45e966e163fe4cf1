//! Retry with exponential backoff for kline requests.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::exchange::KlineError;

/// Backoff schedule for retried requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error,
/// or exhausts `max_attempts`.
pub async fn retry_with_backoff<F, Fut, T>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, KlineError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, KlineError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    "Attempt {}/{} failed for {}: {}. Retrying in {}ms...",
                    attempt,
                    max_attempts,
                    context,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(config.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(config.delay_for(3), Duration::from_millis(8_000));
        assert_eq!(config.delay_for(10), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = retry_with_backoff(
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(KlineError::RateLimited(Exchange::Binance))
                } else {
                    Ok(7)
                }
            },
            &fast(),
            "test",
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = retry_with_backoff(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KlineError::RateLimited(Exchange::Bybit))
            },
            &fast(),
            "test",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = retry_with_backoff(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KlineError::InvalidSymbol {
                    exchange: Exchange::Binance,
                    symbol: "X".into(),
                })
            },
            &fast(),
            "test",
        )
        .await;

        assert!(matches!(result, Err(KlineError::InvalidSymbol { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
