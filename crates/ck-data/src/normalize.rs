use crate::providers::RawCandle;
use crate::storage::PRICE_SCALE;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use ck_types::{Candle, FetchWindow, ValidationError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Naive layouts accepted when the source omits an offset; read in the exchange zone.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Candles that passed normalization plus the records that did not.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub candles: Vec<Candle>,
    /// Index into the raw batch and the reason it was skipped.
    pub rejected: Vec<(usize, ValidationError)>,
}

/// Coerces raw source records into UTC candles tagged with the window's series
#[derive(Debug, Clone)]
pub struct Normalizer {
    tz: Tz,
}

impl Normalizer {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn normalize(&self, window: &FetchWindow, raw: &[RawCandle]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (index, record) in raw.iter().enumerate() {
            match self.normalize_one(window, record) {
                Ok(candle) => batch.candles.push(candle),
                Err(reason) => batch.rejected.push((index, reason)),
            }
        }
        batch
    }

    pub fn normalize_one(
        &self,
        window: &FetchWindow,
        raw: &RawCandle,
    ) -> Result<Candle, ValidationError> {
        let timestamp = self.parse_timestamp(required("timestamp", &raw.timestamp)?)?;
        Ok(Candle {
            exchange: window.exchange.clone(),
            symbol_token: window.symbol_token.clone(),
            granularity: window.granularity,
            timestamp,
            open: parse_price("open", required("open", &raw.open)?)?,
            high: parse_price("high", required("high", &raw.high)?)?,
            low: parse_price("low", required("low", &raw.low)?)?,
            close: parse_price("close", required("close", &raw.close)?)?,
            volume: parse_volume(required("volume", &raw.volume)?)?,
        })
    }

    pub fn parse_timestamp(&self, text: &str) -> Result<DateTime<Utc>, ValidationError> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z") {
            return Ok(dt.with_timezone(&Utc));
        }

        let naive = NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .ok_or_else(|| ValidationError::InvalidTimestamp {
                value: text.to_string(),
            })?;

        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| ValidationError::InvalidTimestamp {
                value: text.to_string(),
            })
    }
}

fn required<'a>(
    field: &'static str,
    value: &'a Option<String>,
) -> Result<&'a str, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField { field }),
    }
}

fn is_non_finite(text: &str) -> bool {
    let lower = text.trim_start_matches(['+', '-']).to_ascii_lowercase();
    lower == "nan" || lower == "inf" || lower == "infinity"
}

fn parse_price(field: &'static str, text: &str) -> Result<Decimal, ValidationError> {
    if is_non_finite(text) {
        return Err(ValidationError::NonFinite {
            field,
            value: text.to_string(),
        });
    }
    let price = Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| ValidationError::InvalidNumber {
            field,
            value: text.to_string(),
        })?;
    // Stored columns would round anything finer.
    if price.normalize().scale() > PRICE_SCALE {
        return Err(ValidationError::ExcessPrecision {
            field,
            value: text.to_string(),
            max_scale: PRICE_SCALE,
        });
    }
    Ok(price)
}

fn parse_volume(text: &str) -> Result<i64, ValidationError> {
    let invalid = || ValidationError::InvalidNumber {
        field: "volume",
        value: text.to_string(),
    };
    if is_non_finite(text) {
        return Err(ValidationError::NonFinite {
            field: "volume",
            value: text.to_string(),
        });
    }
    if let Ok(v) = text.parse::<i64>() {
        return if v < 0 { Err(invalid()) } else { Ok(v) };
    }
    // Some feeds send volume as a float such as "1520.0"
    let decimal = parse_price("volume", text)?;
    if decimal.is_sign_negative() || !decimal.fract().is_zero() {
        return Err(invalid());
    }
    decimal.to_i64().ok_or_else(invalid)
}
