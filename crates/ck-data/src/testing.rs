//! Scripted market-data source for pipeline tests.

use crate::providers::{MarketDataSource, RawCandle, Session};
use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use ck_types::{CkResult, FetchWindow, SourceError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;

/// Failure returned for windows starting at `start`; `remaining: None` means every time.
#[derive(Debug, Clone)]
struct ScriptedFailure {
    start: NaiveDateTime,
    error: SourceError,
    remaining: Option<u32>,
}

/// Serves one candle per granularity step inside every requested window,
/// aligned to local midnight, with timestamps carrying the exchange offset.
#[derive(Debug)]
pub struct FakeSource {
    tz: Tz,
    auth_error: Mutex<Option<SourceError>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    expire_calls: AtomicU32,
    price_base: Mutex<i64>,
    logins: AtomicU32,
    logouts: AtomicU32,
    calls: Mutex<Vec<FetchWindow>>,
    cancel_on: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeSource {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            auth_error: Mutex::new(None),
            failures: Mutex::new(Vec::new()),
            expire_calls: AtomicU32::new(0),
            price_base: Mutex::new(100),
            logins: AtomicU32::new(0),
            logouts: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            cancel_on: Mutex::new(None),
        }
    }

    pub fn reject_login(&self, error: SourceError) {
        *self.auth_error.lock() = Some(error);
    }

    pub fn fail_window(&self, start: NaiveDateTime, error: SourceError, times: Option<u32>) {
        self.failures.lock().push(ScriptedFailure {
            start,
            error,
            remaining: times,
        });
    }

    /// The next `n` candle requests report an expired session.
    pub fn expire_session(&self, n: u32) {
        self.expire_calls.store(n, Ordering::SeqCst);
    }

    /// Cancel `token` while serving candle request number `call` (1-based);
    /// that request still returns its data.
    pub fn cancel_on_call(&self, call: usize, token: CancellationToken) {
        *self.cancel_on.lock() = Some((call, token));
    }

    pub fn set_price_base(&self, base: i64) {
        *self.price_base.lock() = base;
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> u32 {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<FetchWindow> {
        self.calls.lock().clone()
    }

    fn scripted_failure(&self, window: &FetchWindow) -> Option<SourceError> {
        let mut failures = self.failures.lock();
        let failure = failures.iter_mut().find(|f| {
            f.start == window.start && f.remaining.map_or(true, |n| n > 0)
        })?;
        if let Some(n) = failure.remaining.as_mut() {
            *n -= 1;
        }
        Some(failure.error.clone())
    }

    fn generate(&self, window: &FetchWindow) -> Vec<RawCandle> {
        let step = window.granularity.step();
        let base = *self.price_base.lock();
        let mut rows = Vec::new();
        let mut t = window.start.date().and_time(NaiveTime::MIN);
        let mut index: i64 = 0;
        while t <= window.end {
            if t >= window.start {
                if let Some(local) = self.tz.from_local_datetime(&t).earliest() {
                    let open = base + index % 7;
                    rows.push(RawCandle {
                        timestamp: Some(local.to_rfc3339()),
                        open: Some(format!("{}.25", open)),
                        high: Some(format!("{}.5", open + 2)),
                        low: Some(format!("{}", open - 1)),
                        close: Some(format!("{}.75", open + 1)),
                        volume: Some(format!("{}", 10 + index % 5)),
                    });
                    index += 1;
                }
            }
            t += step;
        }
        rows
    }
}

#[async_trait]
impl MarketDataSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn authenticate(&self) -> CkResult<Session> {
        if let Some(error) = self.auth_error.lock().clone() {
            return Err(error.into());
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session::new(&format!("jwt-{}", n), "refresh", "feed"))
    }

    async fn get_candles(
        &self,
        _session: &Session,
        window: &FetchWindow,
    ) -> CkResult<Vec<RawCandle>> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(window.clone());
            calls.len()
        };
        if let Some((at, token)) = self.cancel_on.lock().as_ref() {
            if *at == call {
                token.cancel();
            }
        }

        let expired = self
            .expire_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if expired {
            return Err(SourceError::SessionExpired {
                message: "Token Expired".to_string(),
            }
            .into());
        }
        if let Some(error) = self.scripted_failure(window) {
            return Err(error.into());
        }
        Ok(self.generate(window))
    }

    async fn logout(&self, _session: &Session) -> CkResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
