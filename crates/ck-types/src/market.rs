use crate::errors::{CkError, CkResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A tradable contract as listed in the commodity catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub exchange: String,
    pub symbol_token: String,
}

impl Instrument {
    pub fn new(name: &str, exchange: &str, symbol_token: &str) -> Self {
        Self {
            name: name.to_string(),
            exchange: exchange.to_string(),
            symbol_token: symbol_token.to_string(),
        }
    }

    pub fn full_symbol(&self) -> String {
        format!("{}:{}", self.exchange, self.name)
    }

    pub fn series_key(&self, granularity: Granularity) -> SeriesKey {
        SeriesKey::new(&self.exchange, &self.symbol_token, granularity)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.full_symbol(), self.symbol_token)
    }
}

/// Candle interval supported by the upstream historical API
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Granularity {
    OneMinute,
    FiveMinute,
    FifteenMinute,
    ThirtyMinute,
    OneHour,
    OneDay,
}

impl Granularity {
    pub const ALL: [Granularity; 6] = [
        Granularity::OneMinute,
        Granularity::FiveMinute,
        Granularity::FifteenMinute,
        Granularity::ThirtyMinute,
        Granularity::OneHour,
        Granularity::OneDay,
    ];

    /// Interval name used on the wire and in storage.
    pub fn api_name(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "ONE_MINUTE",
            Granularity::FiveMinute => "FIVE_MINUTE",
            Granularity::FifteenMinute => "FIFTEEN_MINUTE",
            Granularity::ThirtyMinute => "THIRTY_MINUTE",
            Granularity::OneHour => "ONE_HOUR",
            Granularity::OneDay => "ONE_DAY",
        }
    }

    /// Name accepted on the command line.
    pub fn short_name(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "1min",
            Granularity::FiveMinute => "5min",
            Granularity::FifteenMinute => "15min",
            Granularity::ThirtyMinute => "30min",
            Granularity::OneHour => "1hour",
            Granularity::OneDay => "1day",
        }
    }

    /// Distance between consecutive candle timestamps.
    pub fn step(&self) -> Duration {
        match self {
            Granularity::OneMinute => Duration::minutes(1),
            Granularity::FiveMinute => Duration::minutes(5),
            Granularity::FifteenMinute => Duration::minutes(15),
            Granularity::ThirtyMinute => Duration::minutes(30),
            Granularity::OneHour => Duration::hours(1),
            Granularity::OneDay => Duration::days(1),
        }
    }

    pub fn is_daily(&self) -> bool {
        matches!(self, Granularity::OneDay)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_name())
    }
}

impl FromStr for Granularity {
    type Err = CkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::ALL
            .into_iter()
            .find(|g| {
                g.short_name().eq_ignore_ascii_case(s) || g.api_name().eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| {
                CkError::Validation(format!(
                    "unknown interval '{}', expected one of {}",
                    s,
                    Granularity::ALL.map(|g| g.short_name()).join(", ")
                ))
            })
    }
}

/// Identity of one stored series: exchange, symbol token and interval
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub exchange: String,
    pub symbol_token: String,
    pub granularity: Granularity,
}

impl SeriesKey {
    pub fn new(exchange: &str, symbol_token: &str, granularity: Granularity) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol_token: symbol_token.to_string(),
            granularity,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.exchange, self.symbol_token, self.granularity)
    }
}

/// Inclusive range of exchange-local wall-clock times
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> CkResult<Self> {
        if start > end {
            return Err(CkError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Whole calendar days, from 00:00 on `start` to 23:59 on `end`.
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> CkResult<Self> {
        let last_minute = NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN);
        Self::new(start.and_time(NaiveTime::MIN), end.and_time(last_minute))
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} .. {}]",
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%Y-%m-%d %H:%M")
        )
    }
}

/// One request unit against the historical candle API
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchWindow {
    pub exchange: String,
    pub symbol_token: String,
    pub granularity: Granularity,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl FetchWindow {
    pub fn new(key: &SeriesKey, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            exchange: key.exchange.clone(),
            symbol_token: key.symbol_token.clone(),
            granularity: key.granularity,
            start,
            end,
        }
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.exchange, &self.symbol_token, self.granularity)
    }

    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key(), self.range())
    }
}

/// Primary key of a stored candle
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandleKey {
    pub exchange: String,
    pub symbol_token: String,
    pub granularity: Granularity,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV candle as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol_token: String,
    pub granularity: Granularity,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            exchange: self.exchange.clone(),
            symbol_token: self.symbol_token.clone(),
            granularity: self.granularity,
            timestamp: self.timestamp,
        }
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.exchange, &self.symbol_token, self.granularity)
    }

    /// Calendar date of the candle in the exchange time zone.
    pub fn trade_date<Tz: TimeZone>(&self, tz: &Tz) -> NaiveDate {
        self.timestamp.with_timezone(tz).date_naive()
    }
}

/// Per-day aggregate derived from daily candles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub exchange: String,
    pub symbol_token: String,
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub year: i32,
    pub month: u32,
}

impl DailySummary {
    /// Aggregates candles that all belong to the same exchange, token and date.
    /// Returns `None` for an empty slice.
    pub fn from_candles(date: NaiveDate, candles: &[Candle]) -> Option<Self> {
        let mut ordered: Vec<&Candle> = candles.iter().collect();
        ordered.sort_by_key(|c| c.timestamp);
        let first = *ordered.first()?;
        let last = *ordered.last()?;

        let mut high = first.high;
        let mut low = first.low;
        let mut volume: i64 = 0;
        for candle in &ordered {
            high = high.max(candle.high);
            low = low.min(candle.low);
            volume = volume.saturating_add(candle.volume);
        }

        Some(Self {
            exchange: first.exchange.clone(),
            symbol_token: first.symbol_token.clone(),
            date,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
            year: date.year(),
            month: date.month(),
        })
    }

    /// Groups candles by (exchange, token, trade date) and aggregates each group.
    pub fn summarize<Tz: TimeZone>(candles: &[Candle], tz: &Tz) -> Vec<DailySummary> {
        let mut groups: BTreeMap<(String, String, NaiveDate), Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            groups
                .entry((
                    candle.exchange.clone(),
                    candle.symbol_token.clone(),
                    candle.trade_date(tz),
                ))
                .or_default()
                .push(candle.clone());
        }

        groups
            .into_iter()
            .filter_map(|((_, _, date), group)| DailySummary::from_candles(date, &group))
            .collect()
    }
}

/// Stored extent of one series, recomputed on every query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageExtent {
    pub exchange: String,
    pub symbol_token: String,
    pub granularity: Granularity,
    pub min_timestamp: DateTime<Utc>,
    pub max_timestamp: DateTime<Utc>,
    pub row_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Kolkata;
    use rust_decimal_macros::dec;

    fn candle(
        ts: &str,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: i64,
    ) -> Candle {
        Candle {
            exchange: "MCX".to_string(),
            symbol_token: "440939".to_string(),
            granularity: Granularity::OneHour,
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn test_granularity_parsing() {
        assert_eq!("1day".parse::<Granularity>().unwrap(), Granularity::OneDay);
        assert_eq!("ONE_HOUR".parse::<Granularity>().unwrap(), Granularity::OneHour);
        assert_eq!("15min".parse::<Granularity>().unwrap(), Granularity::FifteenMinute);
        assert!("2hour".parse::<Granularity>().is_err());
    }

    #[test]
    fn test_series_key_display() {
        let key = SeriesKey::new("MCX", "440939", Granularity::OneDay);
        assert_eq!(key.to_string(), "MCX:440939@ONE_DAY");
    }

    #[test]
    fn test_time_range_rejects_inverted_bounds() {
        let a = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let b = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(matches!(TimeRange::new(a, b), Err(CkError::InvalidRange { .. })));
        assert!(TimeRange::new(a, a).unwrap().is_empty());
    }

    #[test]
    fn test_from_dates_covers_whole_days() {
        let range = TimeRange::from_dates(
            NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
        )
        .unwrap();
        assert_eq!(range.start.to_string(), "2018-01-01 00:00:00");
        assert_eq!(range.end.to_string(), "2023-12-31 23:59:00");
    }

    #[test]
    fn test_trade_date_uses_exchange_zone() {
        // 20:00 UTC is already the next day in India
        let c = candle("2023-03-01T20:00:00Z", dec!(1), dec!(1), dec!(1), dec!(1), 1);
        assert_eq!(c.trade_date(&Kolkata), NaiveDate::from_ymd_opt(2023, 3, 2).unwrap());
        assert_eq!(c.trade_date(&Utc), NaiveDate::from_ymd_opt(2023, 3, 1).unwrap());
    }

    #[test]
    fn test_daily_summary_aggregation() {
        let candles = vec![
            candle("2023-03-01T11:00:00+05:30", dec!(101), dec!(104), dec!(100), dec!(103), 20),
            candle("2023-03-01T10:00:00+05:30", dec!(100), dec!(102), dec!(99), dec!(101), 10),
            candle("2023-03-01T12:00:00+05:30", dec!(103), dec!(103.5), dec!(97.25), dec!(98), 5),
        ];

        let summaries = DailySummary::summarize(&candles, &Kolkata);
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.date, NaiveDate::from_ymd_opt(2023, 3, 1).unwrap());
        assert_eq!(s.open, dec!(100));
        assert_eq!(s.close, dec!(98));
        assert_eq!(s.high, dec!(104));
        assert_eq!(s.low, dec!(97.25));
        assert_eq!(s.volume, 35);
        assert_eq!((s.year, s.month), (2023, 3));
    }

    #[test]
    fn test_summarize_splits_days() {
        let candles = vec![
            candle("2023-03-01T10:00:00+05:30", dec!(1), dec!(2), dec!(1), dec!(2), 1),
            candle("2023-03-02T10:00:00+05:30", dec!(2), dec!(3), dec!(2), dec!(3), 1),
        ];
        assert_eq!(DailySummary::summarize(&candles, &Kolkata).len(), 2);
        let day = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
        assert!(DailySummary::from_candles(day, &[]).is_none());
    }
}
