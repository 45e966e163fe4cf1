//! Funding Interval Arb - backtest CLI.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use funding_interval_arb::backtest::{BacktestRunner, OpportunitySource, RunReport};
use funding_interval_arb::config::Config;
use funding_interval_arb::exchange::validate_klines;
use funding_interval_arb::persistence::CandleCache;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Funding Interval Arb CLI
#[derive(Parser)]
#[command(name = "funding-interval-arb")]
#[command(version, about = "Backtest Binance/Bybit funding-interval mismatch trades")]
struct Cli {
    /// Path to a config file (default: ./config.{toml,yaml,json} if present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full backtest pipeline
    Backtest {
        /// Timeline CSV file or directory (overrides data.timeline_path)
        #[arg(short, long)]
        timeline: Option<String>,

        /// Output directory for reports (overrides output.output_dir)
        #[arg(short, long)]
        output: Option<String>,

        /// Only use candles already in the cache
        #[arg(long)]
        offline: bool,
    },

    /// Download candles for every symbol in the timeline
    Fetch {
        /// Timeline CSV file or directory (overrides data.timeline_path)
        #[arg(short, long)]
        timeline: Option<String>,
    },

    /// Validate the configuration and print effective settings
    CheckConfig,

    /// Report kline coverage for everything in the candle cache
    ValidateData {
        /// Print every anomaly, not just the counts
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.json)?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Backtest {
            timeline,
            output,
            offline,
        } => run_backtest(config, timeline, output, offline).await,
        Commands::Fetch { timeline } => run_fetch(config, timeline).await,
        Commands::CheckConfig => check_config(&config),
        Commands::ValidateData { verbose } => validate_data(&config, verbose),
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "funding-interval-arb.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Flushes on drop; must outlive main
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("funding_interval_arb=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Period: {} to {}",
        config.analysis.start_date, config.analysis.end_date
    );
    info!("   Initial Capital: ${}", config.trading.initial_capital);
    info!(
        "   VWAP Window: ±{} min (min {} candles)",
        config.trading.vwap_window_minutes, config.trading.min_candles
    );
    info!(
        "   Fees: maker {}, taker {}",
        config.fees.maker_fee, config.fees.taker_fee
    );
    if config.symbols.include_all {
        info!("   Symbols: all (excluding {})", config.symbols.exclude.len());
    } else {
        info!("   Symbols: {:?}", config.symbols.whitelist);
    }
    info!("   Timeline: {}", config.data.timeline_path);
    info!("   Cache: {}", config.data.cache_path);
}

fn prepare(mut config: Config, timeline: Option<String>) -> Result<Config> {
    if let Some(path) = timeline {
        config.data.timeline_path = path;
    }
    config.validate()?;
    for warning in config.consistency_warnings() {
        warn!("⚠️  {}", warning);
    }
    Ok(config)
}

/// Run the full pipeline and write reports.
async fn run_backtest(
    config: Config,
    timeline: Option<String>,
    output: Option<String>,
    offline: bool,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let mut config = prepare(config, timeline)?;
    if let Some(dir) = output {
        config.output.output_dir = dir;
    }
    log_config(&config);

    let runner = BacktestRunner::new(config).offline(offline);
    let source = runner.timeline()?;

    if let Some((first, last)) = source.available_range() {
        info!("📊 Timeline range: {} to {}", fmt_ms(first), fmt_ms(last));
    }
    info!("   Symbols: {}", source.available_symbols().len());
    info!("   Rows: {}", source.len());

    let fetcher = runner.build_fetcher()?;
    let report = runner.run_with(&source, &fetcher).await?;

    print_report(&report);

    let written = runner.save_reports(&report)?;
    info!("📁 {} report file(s) written", written.len());

    Ok(())
}

fn print_report(report: &RunReport) {
    let loader = &report.loader;
    info!(
        "Loaded {} opportunities across {} symbols ({} rows read, {} malformed, {} dropped, {} rule violations)",
        loader.opportunities,
        loader.symbols.len(),
        loader.rows_read,
        loader.malformed_rows,
        loader.invalid,
        loader.rule_violations
    );
    info!(
        "Average mismatch duration: {:.2}h",
        loader.avg_duration_hours()
    );
    info!(
        "VWAP priced {}/{} ({:.1}%)",
        report.vwap.priced,
        report.vwap.total,
        report.vwap.priced_pct()
    );
    for (reason, count) in &report.vwap.reasons {
        info!("   unpriced [{}]: {}", reason, count);
    }
    if !report.unpriceable_symbols.is_empty() {
        warn!(
            "No candle data for: {}",
            report.unpriceable_symbols.join(", ")
        );
    }

    println!("\n{}", report.result.summary());

    if report.result.has_trades() {
        println!("Top symbols by net P&L:");
        for (symbol, stats) in report.result.metrics.top_symbols(10) {
            println!(
                "  {:<14} {:>5} trades  ${:>12.2}  win {:.1}%",
                symbol,
                stats.trades,
                stats.net_pnl,
                stats.win_rate()
            );
        }
    }
}

/// Warm the candle cache without simulating.
async fn run_fetch(config: Config, timeline: Option<String>) -> Result<()> {
    let config = prepare(config, timeline)?;
    log_config(&config);

    let runner = BacktestRunner::new(config);
    let source = runner.timeline()?;
    let fetcher = runner.build_fetcher()?;

    let market = runner.warm_cache(&source, &fetcher).await?;

    info!("✅ {} symbol/exchange series available", market.available_count());
    for (symbol, exchange, reason) in market.insufficient() {
        warn!("   {} {}: {}", symbol, exchange, reason);
    }

    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    config.validate()?;
    log_config(config);

    let (start, end) = config.time_range_ms()?;
    info!("   Range (ms): {} - {}", start, end);

    let warnings = config.consistency_warnings();
    if warnings.is_empty() {
        info!("✅ Configuration is valid");
    } else {
        for warning in &warnings {
            warn!("⚠️  {}", warning);
        }
        info!("✅ Configuration is valid ({} warning(s))", warnings.len());
    }

    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Coverage report for every cached symbol/exchange pair.
fn validate_data(config: &Config, verbose: bool) -> Result<()> {
    let cache = CandleCache::new(&config.data.cache_path)
        .with_context(|| format!("Failed to open cache {}", config.data.cache_path))?;
    let (start, end) = config.time_range_ms()?;

    let pairs = cache.cached_pairs()?;
    if pairs.is_empty() {
        warn!("Cache is empty: {}", config.data.cache_path);
        return Ok(());
    }

    let mut invalid = 0usize;
    for (symbol, exchange) in &pairs {
        let Some(coverage) = cache.coverage(symbol, *exchange)? else {
            continue;
        };
        let range_start = start.max(coverage.first_ms);
        let range_end = end.min(coverage.last_ms);
        if range_start > range_end {
            info!("{:<14} {:<8} outside analysis range", symbol, exchange.as_str());
            continue;
        }

        let candles = cache.load_range(symbol, *exchange, range_start, range_end)?;
        let validation = validate_klines(&candles, range_start, range_end);
        if !validation.is_valid {
            invalid += 1;
        }

        info!(
            "{:<14} {:<8} {:>7}/{:<7} {:>6.2}%  gaps={} anomalies={} {}",
            symbol,
            exchange.as_str(),
            validation.actual_candles,
            validation.expected_candles,
            validation.coverage_pct,
            validation.gaps,
            validation.anomalies.len(),
            if validation.is_valid { "✅" } else { "❌" }
        );

        if verbose {
            for anomaly in &validation.anomalies {
                info!("    {:?}", anomaly);
            }
        }
    }

    info!(
        "Checked {} series: {} valid, {} invalid",
        pairs.len(),
        pairs.len() - invalid,
        invalid
    );
    Ok(())
}

fn fmt_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}
