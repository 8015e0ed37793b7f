//! Runtime configuration: a JSON file overlaid by environment variables.

use chrono::Duration;
use chrono_tz::Tz;
use ck_types::{config_error, CkResult, Granularity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Brokerage credentials. Never logged.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiCredentials {
    pub api_key: String,
    pub client_code: String,
    pub password: String,
    /// Current one-time code, supplied by the caller. It is replayed on every
    /// re-login, so a refresh after the code rolls over fails authentication.
    pub totp: String,
    pub base_url: String,
}

impl ApiCredentials {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty()
            && !self.client_code.is_empty()
            && !self.password.is_empty()
            && !self.totp.is_empty()
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key_set", &!self.api_key.is_empty())
            .field("client_code", &self.client_code)
            .field("password_set", &!self.password.is_empty())
            .field("totp_set", &!self.totp.is_empty())
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Maximum span of one request window, in days, per interval.
/// `None` means the whole range goes out as a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanLimits {
    pub one_minute: Option<u32>,
    pub five_minute: Option<u32>,
    pub fifteen_minute: Option<u32>,
    pub thirty_minute: Option<u32>,
    pub one_hour: Option<u32>,
    pub one_day: Option<u32>,
}

impl Default for SpanLimits {
    fn default() -> Self {
        Self {
            one_minute: Some(30),
            five_minute: Some(60),
            fifteen_minute: Some(60),
            thirty_minute: Some(60),
            one_hour: Some(100),
            one_day: None,
        }
    }
}

impl SpanLimits {
    /// Same cap for every interval.
    pub fn uniform(days: Option<u32>) -> Self {
        Self {
            one_minute: days,
            five_minute: days,
            fifteen_minute: days,
            thirty_minute: days,
            one_hour: days,
            one_day: days,
        }
    }

    pub fn days(&self, granularity: Granularity) -> Option<u32> {
        match granularity {
            Granularity::OneMinute => self.one_minute,
            Granularity::FiveMinute => self.five_minute,
            Granularity::FifteenMinute => self.fifteen_minute,
            Granularity::ThirtyMinute => self.thirty_minute,
            Granularity::OneHour => self.one_hour,
            Granularity::OneDay => self.one_day,
        }
    }

    pub fn max_span(&self, granularity: Granularity) -> Option<Duration> {
        self.days(granularity).map(|d| Duration::days(i64::from(d)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub per_seconds: u64,
    pub min_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 5,
            per_seconds: 60,
            min_interval_ms: 1_000,
        }
    }
}

/// Top-level configuration for an ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub api: ApiCredentials,
    pub database_path: Option<PathBuf>,
    /// IANA name of the exchange time zone.
    pub timezone: String,
    pub workers: usize,
    pub span_limits: SpanLimits,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    /// Default backfill depth when no start date is given.
    pub lookback_days: u32,
    /// Directory searched for contract JSON files.
    pub catalog_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api: ApiCredentials::default(),
            database_path: None,
            timezone: "Asia/Kolkata".to_string(),
            workers: 4,
            span_limits: SpanLimits::default(),
            retry: RetrySettings::default(),
            rate_limit: RateLimitSettings::default(),
            lookback_days: 365 * 5 + 30,
            catalog_dir: None,
        }
    }
}

impl IngestConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> CkResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Overlay settings from the process environment.
    pub fn apply_process_env(&mut self) -> CkResult<()> {
        self.apply_env(|name| std::env::var(name).ok())
    }

    /// Overlay settings from an arbitrary variable lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> CkResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SMARTAPI_KEY") {
            self.api.api_key = v;
        }
        if let Some(v) = get("SMARTAPI_CLIENT_CODE") {
            self.api.client_code = v;
        }
        if let Some(v) = get("SMARTAPI_PASSWORD") {
            self.api.password = v;
        }
        if let Some(v) = get("SMARTAPI_TOTP") {
            self.api.totp = v;
        }
        if let Some(v) = get("SMARTAPI_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = get("CANDLEKEEP_DB") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CANDLEKEEP_TZ") {
            self.timezone = v;
        }
        if let Some(v) = get("CANDLEKEEP_WORKERS") {
            self.workers = v.trim().parse().map_err(|_| {
                config_error!("CANDLEKEEP_WORKERS must be a positive integer, got '{}'", v)
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> CkResult<()> {
        if self.workers == 0 {
            return Err(config_error!("workers must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_error!("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(config_error!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.per_seconds == 0 {
            return Err(config_error!("rate_limit must allow at least one request per period"));
        }
        for granularity in Granularity::ALL {
            if self.span_limits.days(granularity) == Some(0) {
                return Err(config_error!(
                    "span limit for {} must be at least one day",
                    granularity
                ));
            }
        }
        self.tz()?;
        Ok(())
    }

    pub fn tz(&self) -> CkResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| config_error!("unknown time zone '{}'", self.timezone))
    }

    /// Configured database file, or `<data dir>/candlekeep/market_data.duckdb`.
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("candlekeep")
                .join("market_data.duckdb")
        })
    }
}
