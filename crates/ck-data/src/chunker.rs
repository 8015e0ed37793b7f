use crate::config::SpanLimits;
use chrono::{Duration, NaiveDateTime};
use ck_types::{validation_error, CkError, CkResult, FetchWindow, SeriesKey, TimeRange};

/// Resolution of the upstream API's date parameters.
pub fn time_unit() -> Duration {
    Duration::minutes(1)
}

/// Longest range a single run may request: ten years of 365 days.
pub const MAX_REQUEST_DAYS: i64 = 365 * 10;

/// Splits requested ranges into request windows that respect per-interval span caps
#[derive(Debug, Clone, Default)]
pub struct IntervalChunker {
    limits: SpanLimits,
}

impl IntervalChunker {
    pub fn new(limits: SpanLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SpanLimits {
        &self.limits
    }

    /// Windows for an already validated request. They are ordered, disjoint at
    /// minute resolution and together cover `range` exactly. A zero-length
    /// request yields no windows.
    pub fn split(&self, key: &SeriesKey, range: &TimeRange) -> Vec<FetchWindow> {
        if range.is_empty() {
            return Vec::new();
        }
        self.split_gap(key, range)
    }

    /// Windows for a coverage gap. Gaps are inclusive minute ranges, so
    /// `[t, t]` still needs the single minute `t` fetched.
    pub fn split_gap(&self, key: &SeriesKey, range: &TimeRange) -> Vec<FetchWindow> {
        let mut windows = Vec::new();
        let max_span = self.limits.max_span(key.granularity);
        let mut cursor = range.start;
        while cursor <= range.end {
            let window_end = match max_span {
                Some(span) => (cursor + span).min(range.end),
                None => range.end,
            };
            windows.push(FetchWindow::new(key, cursor, window_end));
            cursor = window_end + time_unit();
        }
        windows
    }

    /// Same as [`split`](Self::split) but takes raw bounds and rejects `start > end`.
    pub fn chunk(
        &self,
        key: &SeriesKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> CkResult<Vec<FetchWindow>> {
        let range = TimeRange::new(start, end)?;
        Ok(self.split(key, &range))
    }
}

/// Checks a user request against the reference time `as_of`.
pub fn validate_request(range: &TimeRange, as_of: NaiveDateTime) -> CkResult<()> {
    if range.start >= range.end {
        return Err(CkError::InvalidRange {
            start: range.start.to_string(),
            end: range.end.to_string(),
        });
    }
    if range.end > as_of {
        return Err(validation_error!(
            "end {} lies after the reference time {}",
            range.end.format("%Y-%m-%d %H:%M"),
            as_of.format("%Y-%m-%d %H:%M")
        ));
    }
    if range.span() > Duration::days(MAX_REQUEST_DAYS) {
        return Err(validation_error!(
            "range {} spans more than ten years",
            range
        ));
    }
    Ok(())
}
