use crate::retry::RetryPolicy;
use crate::storage::CandleStore;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use ck_types::{Candle, CandleKey, CkError, CkResult, DailySummary, SeriesKey};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of one writer call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows_written: usize,
    pub duplicates_collapsed: usize,
    pub summaries_written: usize,
}

/// Idempotent sink for candle batches; keeps `daily_summary` in step with `candles`
#[derive(Debug, Clone)]
pub struct MarketDataWriter {
    store: Arc<dyn CandleStore>,
    retry: RetryPolicy,
    tz: Tz,
}

impl MarketDataWriter {
    pub fn new(store: Arc<dyn CandleStore>, retry: RetryPolicy, tz: Tz) -> Self {
        Self { store, retry, tz }
    }

    /// Upsert a batch. Later duplicates of a key replace earlier ones, both
    /// within the batch and against what is already stored.
    pub async fn write(
        &self,
        candles: Vec<Candle>,
        cancel: &CancellationToken,
    ) -> CkResult<WriteSummary> {
        if candles.is_empty() {
            return Ok(WriteSummary::default());
        }

        let received = candles.len();
        let batch = dedupe_last_wins(candles);
        let duplicates_collapsed = received - batch.len();
        if duplicates_collapsed > 0 {
            tracing::debug!("Collapsed {} duplicate candles in batch", duplicates_collapsed);
        }

        let summaries = self.affected_summaries(&batch, cancel).await?;

        let store = &self.store;
        let (rows, sums) = (&batch, &summaries);
        self.retry
            .run("write_batch", cancel, |_| async move {
                store.write_batch(rows, sums).await.map_err(CkError::from)
            })
            .await?;

        Ok(WriteSummary {
            rows_written: batch.len(),
            duplicates_collapsed,
            summaries_written: summaries.len(),
        })
    }

    /// Daily summaries for every (exchange, token, date) the batch touches,
    /// rebuilt from stored daily candles with the batch laid over them.
    async fn affected_summaries(
        &self,
        batch: &[Candle],
        cancel: &CancellationToken,
    ) -> CkResult<Vec<DailySummary>> {
        let mut by_series: BTreeMap<SeriesKey, Vec<&Candle>> = BTreeMap::new();
        for candle in batch.iter().filter(|c| c.granularity.is_daily()) {
            by_series.entry(candle.series_key()).or_default().push(candle);
        }

        let mut summaries = Vec::new();
        for (key, incoming) in by_series {
            let dates: BTreeSet<NaiveDate> =
                incoming.iter().map(|c| c.trade_date(&self.tz)).collect();
            let (first, last) = match (dates.first(), dates.last()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => continue,
            };
            let from = local_day_start(&self.tz, first);
            let to = local_day_start(&self.tz, last + Duration::days(1)) - Duration::seconds(1);

            let store = &self.store;
            let series = &key;
            let stored = self
                .retry
                .run("load_candles", cancel, |_| async move {
                    store.load_candles(series, from, to).await.map_err(CkError::from)
                })
                .await?;

            let mut merged: BTreeMap<CandleKey, Candle> =
                stored.into_iter().map(|c| (c.key(), c)).collect();
            for candle in incoming {
                merged.insert(candle.key(), candle.clone());
            }

            let day_candles: Vec<Candle> = merged
                .into_values()
                .filter(|c| dates.contains(&c.trade_date(&self.tz)))
                .collect();
            summaries.extend(DailySummary::summarize(&day_candles, &self.tz));
        }
        Ok(summaries)
    }
}

/// Keeps the last occurrence of each primary key, ordered by key.
pub fn dedupe_last_wins(candles: Vec<Candle>) -> Vec<Candle> {
    let mut unique: BTreeMap<CandleKey, Candle> = BTreeMap::new();
    for candle in candles {
        unique.insert(candle.key(), candle);
    }
    unique.into_values().collect()
}

fn local_day_start(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}
