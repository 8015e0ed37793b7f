use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ck_types::{CkResult, FetchWindow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Authenticated session with the market-data source
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub jwt_token: String,
    pub refresh_token: String,
    pub feed_token: String,
    pub issued_at: DateTime<Utc>,
}

impl Session {
    pub fn new(jwt_token: &str, refresh_token: &str, feed_token: &str) -> Self {
        Self {
            jwt_token: jwt_token.to_string(),
            refresh_token: refresh_token.to_string(),
            feed_token: feed_token.to_string(),
            issued_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// One upstream candle record, fields kept as text so nothing is lost before normalization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandle {
    pub timestamp: Option<String>,
    pub open: Option<String>,
    pub high: Option<String>,
    pub low: Option<String>,
    pub close: Option<String>,
    pub volume: Option<String>,
}

impl RawCandle {
    /// Build from a `[timestamp, open, high, low, close, volume]` row.
    /// Missing trailing elements and JSON nulls become `None`.
    pub fn from_json_row(row: &serde_json::Value) -> Self {
        let cell = |index: usize| -> Option<String> {
            match row.get(index)? {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        };
        Self {
            timestamp: cell(0),
            open: cell(1),
            high: cell(2),
            low: cell(3),
            close: cell(4),
            volume: cell(5),
        }
    }
}

/// Collaborator that serves historical candles
#[async_trait]
pub trait MarketDataSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Open a session. Bad credentials fail with `SourceError::Auth`.
    async fn authenticate(&self) -> CkResult<Session>;

    /// Candles for one window. Transient conditions surface as
    /// `SourceError::RateLimited` or `SourceError::Network`.
    async fn get_candles(
        &self,
        session: &Session,
        window: &FetchWindow,
    ) -> CkResult<Vec<RawCandle>>;

    async fn logout(&self, _session: &Session) -> CkResult<()> {
        Ok(())
    }
}

/// Session shared by all workers of one run
#[derive(Debug)]
pub struct SessionHandle {
    session: RwLock<Arc<Session>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            session: RwLock::new(Arc::new(session)),
        }
    }

    pub async fn current(&self) -> Arc<Session> {
        self.session.read().await.clone()
    }

    /// Re-authenticate unless another worker already replaced `stale`.
    ///
    /// Login replays the configured credentials, one-time code included. Once
    /// that code has rolled over the re-login is rejected as an auth failure,
    /// so long runs need a fresh code in the credentials to recover.
    pub async fn refresh(
        &self,
        source: &dyn MarketDataSource,
        stale: &Session,
    ) -> CkResult<Arc<Session>> {
        let mut guard = self.session.write().await;
        if guard.jwt_token != stale.jwt_token {
            return Ok(guard.clone());
        }
        tracing::info!("Session expired, re-authenticating with {}", source.name());
        let fresh = Arc::new(source.authenticate().await?);
        *guard = fresh.clone();
        Ok(fresh)
    }
}
