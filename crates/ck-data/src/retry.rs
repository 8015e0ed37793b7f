use crate::config::RetrySettings;
use ck_types::{CkError, CkResult, Retryable};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff with optional jitter, applied to fetches and writes alike
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Nominal delay after failed attempt `attempt` (1-based): `min(base * 2^(n-1), max)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay actually slept, drawn from the upper half of the nominal delay when jittered.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let nominal_ms = nominal.as_millis() as u64;
        let half = nominal_ms / 2;
        let extra = rand::rng().random_range(0..=nominal_ms - half);
        Duration::from_millis(half + extra)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. The closure receives the 1-based attempt number.
    ///
    /// The first attempt always runs; cancellation is observed between attempts.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> CkResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CkResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation = %label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CkError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_types::{SourceError, StorageError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1)).without_jitter()
    }

    fn network() -> CkError {
        SourceError::Network {
            message: "connection reset".to_string(),
        }
        .into()
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_secs(60));
        for attempt in 1..=6 {
            let nominal = policy.nominal_delay(attempt);
            for _ in 0..50 {
                let delay = policy.backoff(attempt);
                assert!(delay <= nominal);
                assert!(delay >= nominal / 2);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();

        let result = policy()
            .run("fetch", &cancel, |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(network())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: CkResult<()> = policy()
            .run("fetch", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SourceError::Api {
                        code: Some("AB1004".to_string()),
                        message: "bad request".to_string(),
                    }
                    .into())
                }
            })
            .await;

        assert!(matches!(result, Err(CkError::Source(SourceError::Api { .. }))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let seen = attempts.clone();

        let result: CkResult<()> = policy()
            .run("write", &cancel, |attempt| {
                seen.lock().push(attempt);
                async {
                    Err(StorageError::Transient {
                        message: "database is locked".to_string(),
                    }
                    .into())
                }
            })
            .await;

        assert!(matches!(result, Err(CkError::Storage(StorageError::Transient { .. }))));
        assert_eq!(*attempts.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_further_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: CkResult<()> = policy()
            .run("fetch", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(network()) }
            })
            .await;

        assert!(matches!(result, Err(CkError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
