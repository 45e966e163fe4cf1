//! Funding-rate timeline loading.
//!
//! Reads precomputed `funding_rate_timeline_<SYMBOL>.csv` files and turns
//! their tradable rows into [`Opportunity`] records with capital split
//! evenly across all opportunities sharing a timestamp.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::opportunity::{Opportunity, OpportunityError};
use crate::config::Config;

const FILE_PREFIX: &str = "funding_rate_timeline_";

/// One parsed timeline row.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineRow {
    pub timestamp: i64,
    pub symbol: String,
    pub binance_rate: Decimal,
    pub bybit_rate: Decimal,
    pub binance_pays: bool,
    pub bybit_pays: bool,
    pub tradable: bool,
    pub duration_hours: Decimal,
    pub mismatch_type: Option<String>,
    pub binance_interval: Option<String>,
    pub bybit_interval: Option<String>,
}

/// Filters applied when turning rows into opportunities.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderOptions {
    /// Inclusive range in epoch milliseconds
    pub start_ms: i64,
    pub end_ms: i64,
    pub initial_capital: Decimal,
    /// When set, only these symbols are kept
    pub whitelist: Option<BTreeSet<String>>,
    pub exclude: BTreeSet<String>,
}

impl LoaderOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let (start_ms, end_ms) = config.time_range_ms()?;
        let whitelist = if config.symbols.include_all {
            None
        } else {
            Some(config.symbols.whitelist.iter().cloned().collect())
        };

        Ok(Self {
            start_ms,
            end_ms,
            initial_capital: config.trading.initial_capital,
            whitelist,
            exclude: config.symbols.exclude.iter().cloned().collect(),
        })
    }

    fn symbol_allowed(&self, symbol: &str) -> bool {
        if self.exclude.contains(symbol) {
            return false;
        }
        match &self.whitelist {
            Some(list) => list.contains(symbol),
            None => true,
        }
    }
}

/// What happened to the rows during loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoaderSummary {
    pub rows_read: usize,
    pub malformed_rows: usize,
    pub non_tradable: usize,
    pub out_of_range: usize,
    pub filtered_by_symbol: usize,
    /// Dropped: unusable records (empty symbol, bad timestamp or duration)
    pub invalid: usize,
    /// Kept but failing a trade rule (pay flags, capital); skipped by the engine
    pub rule_violations: usize,
    pub opportunities: usize,
    pub unique_timestamps: usize,
    pub symbols: Vec<String>,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub min_capital: Option<Decimal>,
    pub max_capital: Option<Decimal>,
    pub total_duration_hours: Decimal,
}

impl LoaderSummary {
    pub fn avg_duration_hours(&self) -> Decimal {
        if self.opportunities == 0 {
            Decimal::ZERO
        } else {
            self.total_duration_hours / Decimal::from(self.opportunities)
        }
    }
}

/// Opportunities plus loading statistics.
#[derive(Debug, Clone)]
pub struct LoadedOpportunities {
    pub opportunities: Vec<Opportunity>,
    pub summary: LoaderSummary,
}

/// Trait for loading opportunity timelines.
pub trait OpportunitySource: Send + Sync {
    /// Build chronologically ordered opportunities.
    fn load_opportunities(&self, options: &LoaderOptions) -> Result<LoadedOpportunities>;

    /// Get the available timestamp range in the data.
    fn available_range(&self) -> Option<(i64, i64)>;

    /// Get all available symbols.
    fn available_symbols(&self) -> Vec<String>;
}

/// CSV timeline loader.
///
/// Expected CSV format (column order is free):
/// ```csv
/// timestamp,binance_rate,bybit_rate,binance_pay,bybit_pay,tradable,mismatch_type,duration_hours
/// 2025-08-07 08:00:00,-0.0012,0.0001,True,False,True,8h_vs_1h,1
/// ```
#[derive(Debug, Clone, Default)]
pub struct TimelineLoader {
    rows: Vec<TimelineRow>,
    malformed_rows: usize,
}

impl TimelineLoader {
    /// Load a single timeline file or every timeline file in a directory.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let files = timeline_files(path)?;
        info!("Found {} timeline file(s) under {}", files.len(), path.display());

        let mut loader = Self::default();
        for file in &files {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read timeline file: {}", file.display()))?;
            let symbol = symbol_from_file_name(file);

            match Self::from_csv_content(&content, symbol.as_deref()) {
                Ok(part) => {
                    debug!(file = %file.display(), rows = part.rows.len(), "Timeline loaded");
                    loader.rows.extend(part.rows);
                    loader.malformed_rows += part.malformed_rows;
                }
                Err(e) => warn!(file = %file.display(), error = %e, "Skipping timeline file"),
            }
        }

        if loader.rows.is_empty() {
            bail!("No timeline rows could be read from {}", path.display());
        }

        Ok(loader)
    }

    /// Parse CSV content. `default_symbol` is used when there is no
    /// `symbol` column.
    pub fn from_csv_content(content: &str, default_symbol: Option<&str>) -> Result<Self> {
        let mut lines = content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let Some((_, header)) = lines.next() else {
            bail!("CSV file is empty");
        };
        let columns = Columns::from_header(header)?;

        if columns.symbol.is_none() && default_symbol.is_none() {
            bail!("CSV has no symbol column and no symbol could be derived from the file name");
        }

        let mut rows = Vec::new();
        let mut malformed_rows = 0;

        for (line_num, line) in lines {
            match columns.parse_row(line, default_symbol) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    malformed_rows += 1;
                    debug!("Malformed line {}: {:#}", line_num + 1, e);
                }
            }
        }

        if rows.is_empty() {
            bail!("CSV file contains no data rows");
        }
        if malformed_rows > 0 {
            warn!("{} malformed timeline row(s) skipped", malformed_rows);
        }

        Ok(Self {
            rows,
            malformed_rows,
        })
    }

    /// Create a loader from in-memory rows.
    pub fn from_rows(rows: Vec<TimelineRow>) -> Self {
        Self {
            rows,
            malformed_rows: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[TimelineRow] {
        &self.rows
    }
}

impl OpportunitySource for TimelineLoader {
    fn load_opportunities(&self, options: &LoaderOptions) -> Result<LoadedOpportunities> {
        let mut summary = LoaderSummary {
            rows_read: self.rows.len() + self.malformed_rows,
            malformed_rows: self.malformed_rows,
            ..Default::default()
        };

        let mut kept: Vec<&TimelineRow> = Vec::new();
        for row in &self.rows {
            if !row.tradable {
                summary.non_tradable += 1;
            } else if row.timestamp < options.start_ms || row.timestamp > options.end_ms {
                summary.out_of_range += 1;
            } else if !options.symbol_allowed(&row.symbol) {
                summary.filtered_by_symbol += 1;
            } else {
                kept.push(row);
            }
        }

        // Capital is split across everything tradable at the same instant
        let mut per_timestamp: HashMap<i64, usize> = HashMap::new();
        for row in &kept {
            *per_timestamp.entry(row.timestamp).or_default() += 1;
        }

        let mut opportunities = Vec::with_capacity(kept.len());
        for row in kept {
            let n = per_timestamp.get(&row.timestamp).copied().unwrap_or(1);
            let capital = options.initial_capital / Decimal::from(n);

            let mut opp = Opportunity::new(
                row.timestamp,
                row.symbol.clone(),
                capital,
                row.binance_rate,
                row.bybit_rate,
                row.binance_pays,
                row.bybit_pays,
            )
            .with_duration_hours(row.duration_hours);
            if let Some(mismatch) = &row.mismatch_type {
                opp = opp.with_mismatch_type(mismatch.clone());
            }

            match opp.validate() {
                Ok(()) => opportunities.push(opp),
                Err(
                    e @ (OpportunityError::InvalidPayFlags { .. }
                    | OpportunityError::NonPositiveCapital(_)),
                ) => {
                    summary.rule_violations += 1;
                    warn!(symbol = %row.symbol, timestamp = row.timestamp, error = %e, "Invalid opportunity, will be skipped");
                    opportunities.push(opp);
                }
                Err(e) => {
                    summary.invalid += 1;
                    warn!(symbol = %row.symbol, timestamp = row.timestamp, error = %e, "Unusable record dropped");
                }
            }
        }

        opportunities.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        summary.opportunities = opportunities.len();
        summary.unique_timestamps = opportunities
            .iter()
            .map(|o| o.timestamp)
            .collect::<BTreeSet<_>>()
            .len();
        summary.symbols = opportunities
            .iter()
            .map(|o| o.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        summary.first_timestamp = opportunities.first().map(|o| o.timestamp);
        summary.last_timestamp = opportunities.last().map(|o| o.timestamp);
        summary.min_capital = opportunities.iter().map(|o| o.capital_allocated).min();
        summary.max_capital = opportunities.iter().map(|o| o.capital_allocated).max();
        summary.total_duration_hours = opportunities.iter().map(|o| o.duration_hours).sum();

        info!(
            opportunities = summary.opportunities,
            symbols = summary.symbols.len(),
            timestamps = summary.unique_timestamps,
            non_tradable = summary.non_tradable,
            out_of_range = summary.out_of_range,
            invalid = summary.invalid,
            rule_violations = summary.rule_violations,
            "Opportunities loaded"
        );

        Ok(LoadedOpportunities {
            opportunities,
            summary,
        })
    }

    fn available_range(&self) -> Option<(i64, i64)> {
        let start = self.rows.iter().map(|r| r.timestamp).min()?;
        let end = self.rows.iter().map(|r| r.timestamp).max()?;
        Some((start, end))
    }

    fn available_symbols(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Timeline files under `path`, sorted by name.
fn timeline_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("Timeline path does not exist: {}", path.display());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to list {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "csv")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(FILE_PREFIX))
        })
        .collect();
    files.sort();

    if files.is_empty() {
        bail!("No {}*.csv files found in {}", FILE_PREFIX, path.display());
    }
    Ok(files)
}

/// `funding_rate_timeline_BTCUSDT.csv` -> `BTCUSDT`
fn symbol_from_file_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(FILE_PREFIX))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Column positions resolved from the header.
#[derive(Debug)]
struct Columns {
    timestamp: usize,
    symbol: Option<usize>,
    binance_rate: usize,
    bybit_rate: usize,
    binance_pay: usize,
    bybit_pay: usize,
    tradable: usize,
    duration_hours: Option<usize>,
    mismatch_type: Option<usize>,
    binance_interval: Option<usize>,
    bybit_interval: Option<usize>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self> {
        let index: BTreeMap<String, usize> = header
            .split(',')
            .enumerate()
            .map(|(i, name)| (name.trim().trim_matches('"').to_ascii_lowercase(), i))
            .collect();

        let find = |names: &[&str]| names.iter().find_map(|n| index.get(*n).copied());
        let require = |names: &[&str]| {
            find(names).with_context(|| format!("Missing required column: {}", names[0]))
        };

        Ok(Self {
            timestamp: require(&["timestamp", "datetime"])?,
            symbol: find(&["symbol"]),
            binance_rate: require(&["binance_rate", "binance_funding_rate"])?,
            bybit_rate: require(&["bybit_rate", "bybit_funding_rate"])?,
            binance_pay: require(&["binance_pay", "binance_pays"])?,
            bybit_pay: require(&["bybit_pay", "bybit_pays"])?,
            tradable: require(&["tradable"])?,
            duration_hours: find(&["duration_hours"]),
            mismatch_type: find(&["mismatch_type"]),
            binance_interval: find(&["binance_interval"]),
            bybit_interval: find(&["bybit_interval"]),
        })
    }

    fn parse_row(&self, line: &str, default_symbol: Option<&str>) -> Result<TimelineRow> {
        let parts: Vec<&str> = line.split(',').map(|p| p.trim().trim_matches('"')).collect();
        let get = |i: usize| {
            parts
                .get(i)
                .copied()
                .with_context(|| format!("Expected at least {} columns, got {}", i + 1, parts.len()))
        };
        let optional = |i: Option<usize>| {
            i.and_then(|i| parts.get(i).copied())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let symbol = match self.symbol.map(get).transpose()? {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => default_symbol.unwrap_or_default().to_string(),
        };

        let duration_hours = match optional(self.duration_hours) {
            Some(v) => parse_decimal(&v).with_context(|| format!("Invalid duration_hours: {}", v))?,
            None => Decimal::ONE,
        };

        Ok(TimelineRow {
            timestamp: parse_timestamp(get(self.timestamp)?)?,
            symbol,
            binance_rate: parse_decimal(get(self.binance_rate)?)
                .with_context(|| format!("Invalid binance_rate: {}", line))?,
            bybit_rate: parse_decimal(get(self.bybit_rate)?)
                .with_context(|| format!("Invalid bybit_rate: {}", line))?,
            binance_pays: parse_bool(get(self.binance_pay)?)?,
            bybit_pays: parse_bool(get(self.bybit_pay)?)?,
            tradable: parse_bool(get(self.tradable)?)?,
            duration_hours,
            mismatch_type: optional(self.mismatch_type),
            binance_interval: optional(self.binance_interval),
            bybit_interval: optional(self.bybit_interval),
        })
    }
}

/// Epoch milliseconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS[.fff]` in UTC.
pub fn parse_timestamp(value: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    bail!("Invalid timestamp: {}", value)
}

/// `true/false/1/0/yes/no`, case-insensitive.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => bail!("Invalid boolean: {}", other),
    }
}

/// Plain or scientific notation (`1.5e-05`).
fn parse_decimal(value: &str) -> Result<Decimal> {
    let value = value.trim();
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .with_context(|| format!("Invalid number: {}", value))
}
