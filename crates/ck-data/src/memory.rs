use crate::storage::{CandleStore, CANDLES_TABLE, DAILY_SUMMARY_TABLE};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ck_types::{
    Candle, CandleKey, CoverageExtent, DailySummary, SeriesKey, StorageError, StorageResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};

type SummaryKey = (String, String, NaiveDate);

/// In-memory store used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    candles: RwLock<BTreeMap<CandleKey, Candle>>,
    summaries: RwLock<BTreeMap<SummaryKey, DailySummary>>,
    schema_created: RwLock<bool>,
    stats: RwLock<StoreStats>,
    injected_failures: Mutex<VecDeque<StorageError>>,
}

/// Counters for store activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub batches_written: u64,
    pub candles_written: u64,
    pub summaries_written: u64,
    pub failed_writes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next write consumes and returns this error instead of applying anything.
    pub fn fail_next_write(&self, error: StorageError) {
        self.injected_failures.lock().push_back(error);
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    pub fn candle_count(&self) -> usize {
        self.candles.read().len()
    }

    pub fn all_candles(&self) -> Vec<Candle> {
        self.candles.read().values().cloned().collect()
    }

    pub fn all_summaries(&self) -> Vec<DailySummary> {
        self.summaries.read().values().cloned().collect()
    }

    fn take_failure(&self) -> StorageResult<()> {
        match self.injected_failures.lock().pop_front() {
            Some(error) => {
                self.stats.write().failed_writes += 1;
                Err(error)
            }
            None => Ok(()),
        }
    }
}

fn summary_key(summary: &DailySummary) -> SummaryKey {
    (
        summary.exchange.clone(),
        summary.symbol_token.clone(),
        summary.date,
    )
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn query_coverage(&self, key: &SeriesKey) -> StorageResult<Option<CoverageExtent>> {
        let candles = self.candles.read();
        let mut series = candles.values().filter(|c| {
            c.exchange == key.exchange
                && c.symbol_token == key.symbol_token
                && c.granularity == key.granularity
        });

        let first = match series.next() {
            Some(c) => c,
            None => return Ok(None),
        };
        let (mut min, mut max, mut count) = (first.timestamp, first.timestamp, 1u64);
        for candle in series {
            min = min.min(candle.timestamp);
            max = max.max(candle.timestamp);
            count += 1;
        }

        Ok(Some(CoverageExtent {
            exchange: key.exchange.clone(),
            symbol_token: key.symbol_token.clone(),
            granularity: key.granularity,
            min_timestamp: min,
            max_timestamp: max,
            row_count: count,
        }))
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> StorageResult<usize> {
        self.write_batch(candles, &[]).await?;
        Ok(candles.len())
    }

    async fn upsert_daily_summary(&self, summaries: &[DailySummary]) -> StorageResult<usize> {
        self.write_batch(&[], summaries).await?;
        Ok(summaries.len())
    }

    async fn write_batch(
        &self,
        candles: &[Candle],
        summaries: &[DailySummary],
    ) -> StorageResult<()> {
        self.take_failure()?;

        // Both locks held together so readers never see half a batch
        let mut stored_candles = self.candles.write();
        let mut stored_summaries = self.summaries.write();
        for candle in candles {
            stored_candles.insert(candle.key(), candle.clone());
        }
        for summary in summaries {
            stored_summaries.insert(summary_key(summary), summary.clone());
        }

        let mut stats = self.stats.write();
        stats.batches_written += 1;
        stats.candles_written += candles.len() as u64;
        stats.summaries_written += summaries.len() as u64;
        Ok(())
    }

    async fn load_candles(
        &self,
        key: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Candle>> {
        let mut candles: Vec<Candle> = self
            .candles
            .read()
            .values()
            .filter(|c| {
                c.exchange == key.exchange
                    && c.symbol_token == key.symbol_token
                    && c.granularity == key.granularity
                    && c.timestamp >= from
                    && c.timestamp <= to
            })
            .cloned()
            .collect();
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn load_daily_summary(
        &self,
        exchange: &str,
        symbol_token: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<DailySummary>> {
        let start = (exchange.to_string(), symbol_token.to_string(), from);
        let end = (exchange.to_string(), symbol_token.to_string(), to);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .summaries
            .read()
            .range(start..=end)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn table_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(*self.schema_created.read() && (name == CANDLES_TABLE || name == DAILY_SUMMARY_TABLE))
    }

    async fn create_schema(&self) -> StorageResult<()> {
        *self.schema_created.write() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_types::Granularity;
    use rust_decimal_macros::dec;

    fn candle(day: u32, close: rust_decimal::Decimal) -> Candle {
        Candle {
            exchange: "MCX".to_string(),
            symbol_token: "446265".to_string(),
            granularity: Granularity::OneDay,
            timestamp: NaiveDate::from_ymd_opt(2024, 5, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc(),
            open: dec!(250),
            high: dec!(260),
            low: dec!(240),
            close,
            volume: 100,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_coverage() {
        let store = MemoryStore::new();
        store.upsert_candles(&[candle(2, dec!(251)), candle(3, dec!(252))]).await.unwrap();
        store.upsert_candles(&[candle(2, dec!(255))]).await.unwrap();

        let key = SeriesKey::new("MCX", "446265", Granularity::OneDay);
        let extent = store.query_coverage(&key).await.unwrap().unwrap();
        assert_eq!(extent.row_count, 2);
        assert_eq!(extent.min_timestamp, candle(2, dec!(0)).timestamp);

        let loaded = store
            .load_candles(&key, extent.min_timestamp, extent.min_timestamp)
            .await
            .unwrap();
        assert_eq!(loaded[0].close, dec!(255));

        let other = SeriesKey::new("MCX", "446265", Granularity::OneHour);
        assert!(store.query_coverage(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.fail_next_write(StorageError::Transient {
            message: "locked".to_string(),
        });

        let err = store.write_batch(&[candle(2, dec!(251))], &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::Transient { .. }));
        assert_eq!(store.candle_count(), 0);
        assert_eq!(store.stats().failed_writes, 1);

        store.write_batch(&[candle(2, dec!(251))], &[]).await.unwrap();
        assert_eq!(store.candle_count(), 1);
    }

    #[tokio::test]
    async fn test_schema_flags_tables() {
        let store = MemoryStore::new();
        assert!(!store.table_exists(CANDLES_TABLE).await.unwrap());
        store.create_schema().await.unwrap();
        assert!(store.table_exists(CANDLES_TABLE).await.unwrap());
        assert!(!store.table_exists("positions").await.unwrap());
    }
}
