use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use ck_types::{Candle, CoverageExtent, DailySummary, SeriesKey, StorageError, StorageResult};
use duckdb::{params, Connection};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

pub const CANDLES_TABLE: &str = "candles";
pub const DAILY_SUMMARY_TABLE: &str = "daily_summary";

/// Fractional digits kept by the price columns.
pub const PRICE_SCALE: u32 = 10;

/// Storage engine behind the ingestion pipeline
#[async_trait]
pub trait CandleStore: Send + Sync + std::fmt::Debug {
    /// Stored extent of a series, `None` when it has no rows.
    async fn query_coverage(&self, key: &SeriesKey) -> StorageResult<Option<CoverageExtent>>;

    /// Insert-or-replace raw candles by primary key.
    async fn upsert_candles(&self, candles: &[Candle]) -> StorageResult<usize>;

    /// Insert-or-replace daily summaries by (exchange, token, date).
    async fn upsert_daily_summary(&self, summaries: &[DailySummary]) -> StorageResult<usize>;

    /// Apply candles and summaries as one unit: either both land or neither does.
    async fn write_batch(
        &self,
        candles: &[Candle],
        summaries: &[DailySummary],
    ) -> StorageResult<()>;

    /// Candles of a series with `from <= timestamp <= to`, oldest first.
    async fn load_candles(
        &self,
        key: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Candle>>;

    async fn load_daily_summary(
        &self,
        exchange: &str,
        symbol_token: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<DailySummary>>;

    async fn table_exists(&self, name: &str) -> StorageResult<bool>;

    /// Create both tables if missing. Safe to call repeatedly.
    async fn create_schema(&self) -> StorageResult<()>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS candles (
        exchange TEXT NOT NULL,
        symbol_token TEXT NOT NULL,
        granularity TEXT NOT NULL,
        ts BIGINT NOT NULL,
        trade_date DATE NOT NULL,
        open DECIMAL(38,10) NOT NULL,
        high DECIMAL(38,10) NOT NULL,
        low DECIMAL(38,10) NOT NULL,
        close DECIMAL(38,10) NOT NULL,
        volume BIGINT NOT NULL,
        PRIMARY KEY (exchange, symbol_token, granularity, ts)
    );

    CREATE TABLE IF NOT EXISTS daily_summary (
        exchange TEXT NOT NULL,
        symbol_token TEXT NOT NULL,
        trade_date DATE NOT NULL,
        open DECIMAL(38,10) NOT NULL,
        high DECIMAL(38,10) NOT NULL,
        low DECIMAL(38,10) NOT NULL,
        close DECIMAL(38,10) NOT NULL,
        volume BIGINT NOT NULL,
        \"year\" INTEGER NOT NULL,
        \"month\" INTEGER NOT NULL,
        PRIMARY KEY (exchange, symbol_token, trade_date)
    );
";

const UPSERT_CANDLE: &str = "
    INSERT OR REPLACE INTO candles
        (exchange, symbol_token, granularity, ts, trade_date, open, high, low, close, volume)
    VALUES (?, ?, ?, ?, CAST(? AS DATE),
        CAST(? AS DECIMAL(38,10)), CAST(? AS DECIMAL(38,10)),
        CAST(? AS DECIMAL(38,10)), CAST(? AS DECIMAL(38,10)), ?)";

const UPSERT_SUMMARY: &str = "
    INSERT OR REPLACE INTO daily_summary
        (exchange, symbol_token, trade_date, open, high, low, close, volume, \"year\", \"month\")
    VALUES (?, ?, CAST(? AS DATE),
        CAST(? AS DECIMAL(38,10)), CAST(? AS DECIMAL(38,10)),
        CAST(? AS DECIMAL(38,10)), CAST(? AS DECIMAL(38,10)), ?, ?, ?)";

/// Embedded DuckDB store
#[derive(Debug)]
pub struct DuckDbStore {
    connection: Mutex<Connection>,
    tz: Tz,
}

impl DuckDbStore {
    /// Open (or create) a database file. Parent directories are created.
    pub fn open<P: AsRef<Path>>(path: P, tz: Tz) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Database {
                    message: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }
        let connection = Connection::open(path.as_ref()).map_err(classify)?;
        tracing::debug!("Opened DuckDB store at {}", path.as_ref().display());
        Ok(Self {
            connection: Mutex::new(connection),
            tz,
        })
    }

    pub fn open_in_memory(tz: Tz) -> StorageResult<Self> {
        let connection = Connection::open_in_memory().map_err(classify)?;
        Ok(Self {
            connection: Mutex::new(connection),
            tz,
        })
    }
}

#[async_trait]
impl CandleStore for DuckDbStore {
    async fn query_coverage(&self, key: &SeriesKey) -> StorageResult<Option<CoverageExtent>> {
        let conn = self.connection.lock();
        let (min_ts, max_ts, count): (Option<i64>, Option<i64>, i64) = conn
            .query_row(
                "SELECT MIN(ts), MAX(ts), COUNT(*) FROM candles
                 WHERE exchange = ? AND symbol_token = ? AND granularity = ?",
                params![key.exchange, key.symbol_token, key.granularity.api_name()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(classify)?;

        match (min_ts, max_ts) {
            (Some(min_ts), Some(max_ts)) if count > 0 => Ok(Some(CoverageExtent {
                exchange: key.exchange.clone(),
                symbol_token: key.symbol_token.clone(),
                granularity: key.granularity,
                min_timestamp: epoch_to_utc(min_ts)?,
                max_timestamp: epoch_to_utc(max_ts)?,
                row_count: count as u64,
            })),
            _ => Ok(None),
        }
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> StorageResult<usize> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(classify)?;
        let written = insert_candles(&tx, candles, &self.tz).map_err(classify)?;
        tx.commit().map_err(classify)?;
        Ok(written)
    }

    async fn upsert_daily_summary(&self, summaries: &[DailySummary]) -> StorageResult<usize> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(classify)?;
        let written = insert_summaries(&tx, summaries).map_err(classify)?;
        tx.commit().map_err(classify)?;
        Ok(written)
    }

    async fn write_batch(
        &self,
        candles: &[Candle],
        summaries: &[DailySummary],
    ) -> StorageResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(classify)?;
        insert_candles(&tx, candles, &self.tz).map_err(classify)?;
        insert_summaries(&tx, summaries).map_err(classify)?;
        // Dropping an uncommitted transaction rolls it back
        tx.commit().map_err(classify)?;
        Ok(())
    }

    async fn load_candles(
        &self,
        key: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Candle>> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare(
                "SELECT ts, CAST(open AS VARCHAR), CAST(high AS VARCHAR),
                        CAST(low AS VARCHAR), CAST(close AS VARCHAR), volume
                 FROM candles
                 WHERE exchange = ? AND symbol_token = ? AND granularity = ?
                   AND ts BETWEEN ? AND ?
                 ORDER BY ts",
            )
            .map_err(classify)?;

        let rows = stmt
            .query_map(
                params![
                    key.exchange,
                    key.symbol_token,
                    key.granularity.api_name(),
                    from.timestamp(),
                    to.timestamp()
                ],
                |row| {
                    Ok(RawRow {
                        ts: row.get(0)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                    })
                },
            )
            .map_err(classify)?;

        let mut candles = Vec::new();
        for row in rows {
            let row = row.map_err(classify)?;
            candles.push(Candle {
                exchange: key.exchange.clone(),
                symbol_token: key.symbol_token.clone(),
                granularity: key.granularity,
                timestamp: epoch_to_utc(row.ts)?,
                open: parse_decimal(&row.open)?,
                high: parse_decimal(&row.high)?,
                low: parse_decimal(&row.low)?,
                close: parse_decimal(&row.close)?,
                volume: row.volume,
            });
        }
        Ok(candles)
    }

    async fn load_daily_summary(
        &self,
        exchange: &str,
        symbol_token: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<DailySummary>> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare(
                "SELECT CAST(trade_date AS VARCHAR), CAST(open AS VARCHAR), CAST(high AS VARCHAR),
                        CAST(low AS VARCHAR), CAST(close AS VARCHAR), volume
                 FROM daily_summary
                 WHERE exchange = ? AND symbol_token = ?
                   AND trade_date BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
                 ORDER BY trade_date",
            )
            .map_err(classify)?;

        let rows = stmt
            .query_map(
                params![exchange, symbol_token, from.to_string(), to.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .map_err(classify)?;

        let mut summaries = Vec::new();
        for row in rows {
            let (date, open, high, low, close, volume) = row.map_err(classify)?;
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
                StorageError::Corruption {
                    message: format!("bad trade_date '{}': {}", date, e),
                }
            })?;
            summaries.push(DailySummary {
                exchange: exchange.to_string(),
                symbol_token: symbol_token.to_string(),
                date,
                open: parse_decimal(&open)?,
                high: parse_decimal(&high)?,
                low: parse_decimal(&low)?,
                close: parse_decimal(&close)?,
                volume,
                year: chrono::Datelike::year(&date),
                month: chrono::Datelike::month(&date),
            });
        }
        Ok(summaries)
    }

    async fn table_exists(&self, name: &str) -> StorageResult<bool> {
        let conn = self.connection.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
                params![name],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(count > 0)
    }

    async fn create_schema(&self) -> StorageResult<()> {
        let conn = self.connection.lock();
        conn.execute_batch(SCHEMA).map_err(classify)?;
        tracing::info!("Storage schema ready ({}, {})", CANDLES_TABLE, DAILY_SUMMARY_TABLE);
        Ok(())
    }
}

struct RawRow {
    ts: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: i64,
}

fn insert_candles(conn: &Connection, candles: &[Candle], tz: &Tz) -> duckdb::Result<usize> {
    if candles.is_empty() {
        return Ok(0);
    }
    let mut stmt = conn.prepare(UPSERT_CANDLE)?;
    for candle in candles {
        stmt.execute(params![
            candle.exchange,
            candle.symbol_token,
            candle.granularity.api_name(),
            candle.timestamp.timestamp(),
            candle.trade_date(tz).to_string(),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume
        ])?;
    }
    Ok(candles.len())
}

fn insert_summaries(conn: &Connection, summaries: &[DailySummary]) -> duckdb::Result<usize> {
    if summaries.is_empty() {
        return Ok(0);
    }
    let mut stmt = conn.prepare(UPSERT_SUMMARY)?;
    for summary in summaries {
        stmt.execute(params![
            summary.exchange,
            summary.symbol_token,
            summary.date.to_string(),
            summary.open.to_string(),
            summary.high.to_string(),
            summary.low.to_string(),
            summary.close.to_string(),
            summary.volume,
            summary.year,
            i64::from(summary.month)
        ])?;
    }
    Ok(summaries.len())
}

/// Maps engine errors onto the storage taxonomy.
fn classify(error: duckdb::Error) -> StorageError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("constraint") {
        StorageError::Constraint { message }
    } else if lower.contains("lock") || lower.contains("conflict") || lower.contains("busy") {
        StorageError::Transient { message }
    } else {
        StorageError::Database { message }
    }
}

fn epoch_to_utc(seconds: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| StorageError::Corruption {
        message: format!("timestamp {} out of range", seconds),
    })
}

fn parse_decimal(text: &str) -> StorageResult<Decimal> {
    Decimal::from_str(text).map_err(|e| StorageError::Corruption {
        message: format!("bad decimal '{}': {}", text, e),
    })
}
