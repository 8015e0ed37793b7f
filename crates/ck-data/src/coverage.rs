use crate::chunker::time_unit;
use crate::storage::CandleStore;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use chrono_tz::Tz;
use ck_types::{CkResult, CoverageExtent, SeriesKey, TimeRange};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// Works out which part of a requested range is not yet stored
#[derive(Debug, Clone)]
pub struct CoverageTracker {
    store: Arc<dyn CandleStore>,
    tz: Tz,
}

/// Stored extent of one series plus, for daily data, weekdays with no candle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    pub key: SeriesKey,
    pub extent: Option<CoverageExtent>,
    pub first_local: Option<NaiveDateTime>,
    pub last_local: Option<NaiveDateTime>,
    pub missing_weekdays: Vec<NaiveDate>,
}

impl CoverageReport {
    pub fn summary(&self) -> String {
        let mut out = String::new();
        match (&self.extent, self.first_local, self.last_local) {
            (Some(extent), Some(first), Some(last)) => {
                let _ = write!(
                    out,
                    "{}: {} rows from {} to {}",
                    self.key,
                    extent.row_count,
                    first.format("%Y-%m-%d %H:%M"),
                    last.format("%Y-%m-%d %H:%M")
                );
                if self.key.granularity.is_daily() {
                    let _ = write!(out, ", {} weekdays without data", self.missing_weekdays.len());
                }
            }
            _ => {
                let _ = write!(out, "{}: no data stored", self.key);
            }
        }
        out
    }
}

impl CoverageTracker {
    pub fn new(store: Arc<dyn CandleStore>, tz: Tz) -> Self {
        Self { store, tz }
    }

    pub async fn extent(&self, key: &SeriesKey) -> CkResult<Option<CoverageExtent>> {
        Ok(self.store.query_coverage(key).await?)
    }

    /// Sub-ranges of `requested` outside the stored extent. Interior holes are
    /// not detected; a forced run covers those.
    pub async fn missing_ranges(
        &self,
        key: &SeriesKey,
        requested: &TimeRange,
    ) -> CkResult<Vec<TimeRange>> {
        let gaps = match self.extent(key).await? {
            None => {
                if requested.is_empty() {
                    Vec::new()
                } else {
                    vec![*requested]
                }
            }
            Some(extent) => boundary_gaps(
                requested,
                self.local(extent.min_timestamp),
                self.local(extent.max_timestamp),
            ),
        };
        tracing::debug!("{} missing {} range(s) of {}", key, gaps.len(), requested);
        Ok(gaps)
    }

    pub async fn report(&self, key: &SeriesKey) -> CkResult<CoverageReport> {
        let extent = self.extent(key).await?;
        let mut report = CoverageReport {
            key: key.clone(),
            extent: extent.clone(),
            first_local: None,
            last_local: None,
            missing_weekdays: Vec::new(),
        };

        if let Some(extent) = extent {
            report.first_local = Some(self.local(extent.min_timestamp));
            report.last_local = Some(self.local(extent.max_timestamp));

            if key.granularity.is_daily() {
                let candles = self
                    .store
                    .load_candles(key, extent.min_timestamp, extent.max_timestamp)
                    .await?;
                let present: BTreeSet<NaiveDate> =
                    candles.iter().map(|c| c.trade_date(&self.tz)).collect();
                if let (Some(first), Some(last)) = (present.first(), present.last()) {
                    report.missing_weekdays = missing_weekdays(*first, *last, &present);
                }
            }
        }
        Ok(report)
    }

    fn local(&self, ts: DateTime<Utc>) -> NaiveDateTime {
        ts.with_timezone(&self.tz).naive_local()
    }
}

/// Gaps `[S, A)` and `(B, E]` of `requested = [S, E]` around stored data
/// spanning `[A, B]`, as inclusive minute ranges. A one-minute gap comes back
/// as `[t, t]`; only gaps with no minute in them are dropped.
pub fn boundary_gaps(
    requested: &TimeRange,
    stored_min: NaiveDateTime,
    stored_max: NaiveDateTime,
) -> Vec<TimeRange> {
    let mut gaps = Vec::new();

    if requested.start < stored_min {
        let end = (stored_min - time_unit()).min(requested.end);
        if requested.start <= end {
            gaps.push(TimeRange {
                start: requested.start,
                end,
            });
        }
    }

    if stored_max < requested.end {
        let start = (stored_max + time_unit()).max(requested.start);
        if start <= requested.end {
            gaps.push(TimeRange {
                start,
                end: requested.end,
            });
        }
    }

    gaps
}

fn missing_weekdays(
    first: NaiveDate,
    last: NaiveDate,
    present: &BTreeSet<NaiveDate>,
) -> Vec<NaiveDate> {
    let mut missing = Vec::new();
    let mut day = first;
    while day <= last {
        let weekend = matches!(day.weekday(), Weekday::Sat | Weekday::Sun);
        if !weekend && !present.contains(&day) {
            missing.push(day);
        }
        day += Duration::days(1);
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;
    use ck_types::{Candle, Granularity};
    use rust_decimal_macros::dec;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    fn daily(y: i32, m: u32, d: u32) -> Candle {
        Candle {
            exchange: "MCX".to_string(),
            symbol_token: "440939".to_string(),
            granularity: Granularity::OneDay,
            timestamp: Kolkata
                .from_local_datetime(&at(y, m, d, 0, 0))
                .unwrap()
                .with_timezone(&Utc),
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: 1,
        }
    }

    #[test]
    fn test_gaps_around_interior_extent() {
        let requested = TimeRange::new(at(2023, 1, 1, 0, 0), at(2023, 12, 31, 23, 59)).unwrap();
        let gaps = boundary_gaps(&requested, at(2023, 3, 1, 0, 0), at(2023, 9, 30, 0, 0));
        assert_eq!(
            gaps,
            vec![
                TimeRange::new(at(2023, 1, 1, 0, 0), at(2023, 2, 28, 23, 59)).unwrap(),
                TimeRange::new(at(2023, 9, 30, 0, 1), at(2023, 12, 31, 23, 59)).unwrap(),
            ]
        );
    }

    #[test]
    fn test_no_gaps_when_fully_covered() {
        let requested = TimeRange::new(at(2023, 3, 1, 0, 0), at(2023, 6, 1, 0, 0)).unwrap();
        assert!(boundary_gaps(&requested, at(2023, 1, 1, 0, 0), at(2023, 12, 1, 0, 0)).is_empty());
    }

    #[test]
    fn test_one_minute_head_gap_is_kept() {
        let requested = TimeRange::new(at(2024, 1, 2, 9, 0), at(2024, 1, 2, 15, 0)).unwrap();
        let gaps = boundary_gaps(&requested, at(2024, 1, 2, 9, 1), at(2024, 1, 2, 14, 0));
        assert_eq!(
            gaps,
            vec![
                TimeRange::new(at(2024, 1, 2, 9, 0), at(2024, 1, 2, 9, 0)).unwrap(),
                TimeRange::new(at(2024, 1, 2, 14, 1), at(2024, 1, 2, 15, 0)).unwrap(),
            ]
        );
    }

    #[test]
    fn test_one_minute_tail_gap_is_kept() {
        let requested = TimeRange::new(at(2024, 1, 2, 9, 0), at(2024, 1, 2, 15, 0)).unwrap();
        let gaps = boundary_gaps(&requested, at(2024, 1, 2, 9, 0), at(2024, 1, 2, 14, 59));
        assert_eq!(
            gaps,
            vec![TimeRange::new(at(2024, 1, 2, 15, 0), at(2024, 1, 2, 15, 0)).unwrap()]
        );
    }

    #[test]
    fn test_extent_matching_request_leaves_no_gap() {
        let requested = TimeRange::new(at(2024, 1, 2, 9, 0), at(2024, 1, 2, 15, 0)).unwrap();
        assert!(boundary_gaps(&requested, requested.start, requested.end).is_empty());
    }

    #[test]
    fn test_extent_outside_request_yields_whole_request() {
        let requested = TimeRange::new(at(2023, 3, 1, 0, 0), at(2023, 6, 1, 0, 0)).unwrap();
        assert_eq!(
            boundary_gaps(&requested, at(2024, 1, 1, 0, 0), at(2024, 2, 1, 0, 0)),
            vec![requested]
        );
        assert_eq!(
            boundary_gaps(&requested, at(2022, 1, 1, 0, 0), at(2022, 2, 1, 0, 0)),
            vec![requested]
        );
    }

    #[tokio::test]
    async fn test_empty_store_reports_full_range() {
        let tracker = CoverageTracker::new(Arc::new(MemoryStore::new()), Kolkata);
        let key = SeriesKey::new("MCX", "440939", Granularity::OneDay);
        let requested = TimeRange::new(at(2018, 1, 1, 0, 0), at(2023, 12, 31, 23, 59)).unwrap();

        assert_eq!(tracker.missing_ranges(&key, &requested).await.unwrap(), vec![requested]);
    }

    #[tokio::test]
    async fn test_stored_extent_read_in_exchange_zone() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_candles(&[daily(2023, 3, 1), daily(2023, 3, 31)]).await.unwrap();
        let tracker = CoverageTracker::new(store, Kolkata);
        let key = SeriesKey::new("MCX", "440939", Granularity::OneDay);
        let requested = TimeRange::new(at(2023, 1, 1, 0, 0), at(2023, 3, 31, 23, 59)).unwrap();

        let gaps = tracker.missing_ranges(&key, &requested).await.unwrap();
        assert_eq!(
            gaps,
            vec![
                TimeRange::new(at(2023, 1, 1, 0, 0), at(2023, 2, 28, 23, 59)).unwrap(),
                TimeRange::new(at(2023, 3, 31, 0, 1), at(2023, 3, 31, 23, 59)).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_report_lists_interior_weekdays() {
        let store = Arc::new(MemoryStore::new());
        // Mon 4th .. Fri 8th March 2024, Wednesday missing
        store
            .upsert_candles(&[
                daily(2024, 3, 4),
                daily(2024, 3, 5),
                daily(2024, 3, 7),
                daily(2024, 3, 8),
            ])
            .await
            .unwrap();
        let tracker = CoverageTracker::new(store, Kolkata);
        let key = SeriesKey::new("MCX", "440939", Granularity::OneDay);

        let report = tracker.report(&key).await.unwrap();
        assert_eq!(report.extent.as_ref().unwrap().row_count, 4);
        assert_eq!(report.first_local, Some(at(2024, 3, 4, 0, 0)));
        assert_eq!(report.missing_weekdays, vec![NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()]);
        assert!(report.summary().contains("1 weekdays without data"));

        let empty = tracker
            .report(&SeriesKey::new("MCX", "1", Granularity::OneDay))
            .await
            .unwrap();
        assert!(empty.summary().contains("no data stored"));
    }
}
