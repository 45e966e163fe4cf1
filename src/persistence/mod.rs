//! SQLite cache for one-minute candles.
//!
//! Candles are keyed by `(symbol, exchange, timestamp)`. The cached span for
//! a pair is simply its min/max timestamp; the fetcher uses it to work out
//! which periods still need to be downloaded.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::exchange::{Candle, Exchange};

/// Cached span for one `(symbol, exchange)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCoverage {
    pub first_ms: i64,
    pub last_ms: i64,
    pub candle_count: usize,
}

impl CacheCoverage {
    /// Whether the cached span contains `[start_ms, end_ms]`.
    pub fn covers(&self, start_ms: i64, end_ms: i64) -> bool {
        self.first_ms <= start_ms && self.last_ms >= end_ms
    }
}

/// SQLite-backed candle cache.
pub struct CandleCache {
    conn: Connection,
}

impl CandleCache {
    /// Open (or create) the cache database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && path != Path::new(":memory:") {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open candle cache at {:?}", path))?;

        let cache = Self { conn };
        cache.init_schema()?;

        info!("Candle cache initialized at {:?}", path);
        Ok(cache)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, exchange, timestamp)
            );
            "#,
        )?;

        debug!("Candle cache schema initialized");
        Ok(())
    }

    /// Insert candles, keeping any row already cached for the same timestamp.
    ///
    /// Returns the number of newly stored candles.
    pub fn insert_candles(
        &self,
        symbol: &str,
        exchange: Exchange,
        candles: &[Candle],
    ) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO candles
                    (symbol, exchange, timestamp, open, high, low, close, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;

            for c in candles {
                inserted += stmt.execute(params![
                    symbol,
                    exchange.as_str(),
                    c.timestamp,
                    c.open.to_string(),
                    c.high.to_string(),
                    c.low.to_string(),
                    c.close.to_string(),
                    c.volume.to_string(),
                ])?;
            }
        }

        tx.commit()?;

        debug!(
            symbol,
            exchange = %exchange,
            received = candles.len(),
            inserted,
            "Candles cached"
        );
        Ok(inserted)
    }

    /// Cached span for a pair, or `None` when nothing is cached.
    pub fn coverage(&self, symbol: &str, exchange: Exchange) -> Result<Option<CacheCoverage>> {
        let (first, last, count): (Option<i64>, Option<i64>, i64) = self.conn.query_row(
            r#"
            SELECT MIN(timestamp), MAX(timestamp), COUNT(*)
            FROM candles WHERE symbol = ?1 AND exchange = ?2
            "#,
            params![symbol, exchange.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(match (first, last) {
            (Some(first_ms), Some(last_ms)) => Some(CacheCoverage {
                first_ms,
                last_ms,
                candle_count: count.max(0) as usize,
            }),
            _ => None,
        })
    }

    /// Load cached candles with timestamps in `[start_ms, end_ms]`, ascending.
    pub fn load_range(
        &self,
        symbol: &str,
        exchange: Exchange,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, open, high, low, close, volume
            FROM candles
            WHERE symbol = ?1 AND exchange = ?2 AND timestamp >= ?3 AND timestamp <= ?4
            ORDER BY timestamp ASC
            "#,
        )?;

        let rows = stmt.query_map(
            params![symbol, exchange.as_str(), start_ms, end_ms],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut candles = Vec::new();
        for row in rows {
            let (timestamp, open, high, low, close, volume) = row?;
            candles.push(Candle {
                timestamp,
                open: parse_decimal(&open)?,
                high: parse_decimal(&high)?,
                low: parse_decimal(&low)?,
                close: parse_decimal(&close)?,
                volume: parse_decimal(&volume)?,
            });
        }

        Ok(candles)
    }

    /// All `(symbol, exchange)` pairs present in the cache.
    pub fn cached_pairs(&self) -> Result<Vec<(String, Exchange)>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT symbol, exchange FROM candles ORDER BY symbol, exchange",
        )?;

        let pairs = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(symbol, exchange)| {
                exchange.parse::<Exchange>().ok().map(|e| (symbol, e))
            })
            .collect();

        Ok(pairs)
    }

    /// Drop all cached candles for a pair.
    pub fn clear(&self, symbol: &str, exchange: Exchange) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM candles WHERE symbol = ?1 AND exchange = ?2",
            params![symbol, exchange.as_str()],
        )?;
        Ok(deleted)
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Corrupt decimal in candle cache: {}", s))
}
