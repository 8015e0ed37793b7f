use crate::config::RateLimitSettings;
use ck_types::{CkError, CkResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sliding-window request throttle shared by every worker of a run.
///
/// At most `max_requests` permits are handed out in any `per` interval, and
/// consecutive permits are at least `min_interval` apart.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    per: Duration,
    min_interval: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, per: Duration, min_interval: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            per,
            min_interval,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(
            settings.max_requests as usize,
            Duration::from_secs(settings.per_seconds),
            Duration::from_millis(settings.min_interval_ms),
        )
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, Duration::ZERO, Duration::ZERO)
    }

    /// Wait for a permit. Fails with `Cancelled` if the token fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> CkResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CkError::Cancelled);
            }

            let wait = {
                let mut issued = self.issued.lock();
                let now = Instant::now();
                while let Some(&oldest) = issued.front() {
                    if now.duration_since(oldest) >= self.per {
                        issued.pop_front();
                    } else {
                        break;
                    }
                }

                let mut wait = Duration::ZERO;
                if issued.len() >= self.max_requests {
                    if let Some(&oldest) = issued.front() {
                        wait = (oldest + self.per).saturating_duration_since(now);
                    }
                }
                if let Some(&latest) = issued.back() {
                    wait = wait.max((latest + self.min_interval).saturating_duration_since(now));
                }

                if wait.is_zero() {
                    issued.push_back(now);
                    None
                } else {
                    Some(wait)
                }
            };

            match wait {
                None => return Ok(()),
                Some(wait) => {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CkError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}
