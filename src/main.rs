//! Leveraged EMA-crossover trading engine
//!
//! Holds a leveraged long position in one instrument while the fast EMA of
//! the daily close is above the slow one, sizes it from a volatility-keyed
//! leverage table, and enforces an intraday equity stop.

mod api;
mod bot;
mod db;
mod error;
mod events;
mod models;
mod retry;
mod scheduler;
mod trading;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{MarketData, YahooMarketData};
use crate::bot::{Runner, RunnerConfig};
use crate::db::Database;
use crate::trading::{LeverageSelector, LeverageTable, RunMode, SignalEngine, TradingConfig};

/// EMA-crossover engine CLI.
#[derive(Parser)]
#[command(name = "emalev")]
#[command(about = "Leveraged EMA-crossover trading engine", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./emalev.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session loop
    Run {
        /// Checkpoint gating (test enters immediately)
        #[arg(short, long, value_enum)]
        mode: Option<RunMode>,

        /// Trade on the simulated broker
        #[arg(long)]
        paper: bool,

        /// Starting cash for the simulated broker
        #[arg(long, default_value = "100000")]
        capital: f64,

        /// Polling interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Bootstrap the averages and show the current regime
    Signal,

    /// Show the effective configuration
    Config,

    /// Show the persisted EMA snapshot and recent events
    Status {
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => TradingConfig::load(path)?,
        None => TradingConfig::default(),
    };

    match cli.command {
        Commands::Run {
            mode,
            paper,
            capital,
            interval,
        } => {
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(interval) = interval {
                config.poll_interval_seconds = interval;
            }
            config.validate().context("Invalid configuration")?;

            info!(
                symbol = %config.symbol,
                mode = %config.mode,
                paper = paper,
                "Starting trading engine"
            );

            let runner_config = RunnerConfig {
                trading: config.clone(),
                paper,
                paper_capital: Decimal::try_from(capital)?,
                database_url: cli.database.clone(),
            };

            let mut runner = Runner::new(runner_config).await?;
            runner.initialize().await?;

            println!("\n=== EMA Crossover Engine ===");
            println!("Symbol:           {}", config.symbol);
            println!("EMAs:             {}/{}", config.fast_period, config.slow_period);
            println!("Stop loss:        {}%", config.stop_loss_fraction * Decimal::ONE_HUNDRED);
            println!("Polling interval: {}s", config.poll_interval_seconds);
            println!("Mode:             {}", config.mode);
            println!(
                "Broker:           {}",
                if runner.is_paper() {
                    "PAPER (simulated fills)"
                } else {
                    "LIVE"
                }
            );
            println!("\nPress Ctrl+C to stop. The open position is kept on shutdown.\n");

            // Run the engine
            let outcome = runner.run().await;
            if let Err(e) = &outcome {
                tracing::error!(error = %e, "Engine error");
            }

            // Show final stats
            println!("\n{}", runner.get_stats());
            outcome?;
        }

        Commands::Signal => {
            let tz = config.timezone()?;
            let market = YahooMarketData::new(&config.volatility_symbol, tz)?;
            let today = Utc::now().with_timezone(&tz).date_naive();
            let start = today - Duration::days(i64::from(config.bootstrap_lookback_days));

            let bars = config
                .retry_policy()
                .run("get_daily_closes", || {
                    market.get_daily_closes(&config.symbol, start, today)
                })
                .await
                .context("Failed to fetch daily closes")?;

            let mut engine = SignalEngine::new(config.fast_period, config.slow_period);
            let applied = engine.bootstrap(&bars);
            let state = engine.state();

            let volatility = match market.get_volatility_indicator().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Volatility indicator unavailable");
                    None
                }
            };
            let table = LeverageTable::new(config.leverage_table.clone(), config.baseline_leverage)?;
            let leverage = LeverageSelector::new(table).select(volatility);

            println!("\n=== {} Regime ===\n", config.symbol);
            println!("Closes applied:   {}", applied);
            match state.last_date {
                Some(date) => println!("Last close:       {}", date),
                None => println!("Last close:       n/a"),
            }
            println!("EMA {:<4}          {:.4}", config.fast_period, state.fast_value);
            println!("EMA {:<4}          {:.4}", config.slow_period, state.slow_value);
            println!(
                "Signal:           {}",
                engine.signal().map_or("n/a", |s| s.as_str())
            );
            match volatility {
                Some(v) => println!("{:<17} {:.2}", format!("{}:", config.volatility_symbol), v),
                None => println!("{:<17} n/a", format!("{}:", config.volatility_symbol)),
            }
            println!("Leverage:         {}x", leverage);
        }

        Commands::Config => {
            println!("\n=== Trading Configuration ===\n");
            println!("Signal:");
            println!("  Symbol:               {}", config.symbol);
            println!("  Fast EMA:             {}", config.fast_period);
            println!("  Slow EMA:             {}", config.slow_period);
            println!("  Bootstrap Lookback:   {} days", config.bootstrap_lookback_days);

            println!("\nLeverage ({}):", config.volatility_symbol);
            for rule in &config.leverage_table {
                println!("  Below {:<6}          {}x", rule.below, rule.multiplier);
            }
            println!("  Otherwise             {}x", config.baseline_leverage);

            println!("\nRisk Management:");
            println!("  Stop Loss:            {}%", config.stop_loss_fraction * Decimal::ONE_HUNDRED);
            println!("  Re-entry After Stop:  {}", config.allow_reentry_after_stop);

            println!("\nSchedule ({}):", config.timezone);
            println!("  Session Open:         {}", config.open_checkpoint_time);
            println!("  Entry:                {}", config.entry_checkpoint_time);
            println!("  Close:                {}", config.close_checkpoint_time);
            println!("  Poll Interval:        {}s", config.poll_interval_seconds);
            println!("  Mode:                 {}", config.mode);

            println!("\nRetry:");
            println!("  Max Attempts:         {}", config.retry_max_attempts);
            println!("  Initial Backoff:      {}ms", config.retry_initial_backoff_ms);
            println!("  Max Backoff:          {}ms", config.retry_max_backoff_ms);

            println!("\n--- TOML ---\n");
            println!("{}", toml::to_string_pretty(&config)?);
        }

        Commands::Status { limit } => {
            let db = Database::new(&cli.database).await?;

            match db.load_ema_state().await? {
                Some(state) => {
                    println!("\n=== EMA Snapshot ===");
                    println!("Periods:    {}/{}", state.period_fast, state.period_slow);
                    println!("Fast EMA:   {:.4}", state.fast_value);
                    println!("Slow EMA:   {:.4}", state.slow_value);
                    println!(
                        "Signal:     {}",
                        state.signal().map_or("n/a", |s| s.as_str())
                    );
                    match state.last_date {
                        Some(date) => println!("Last Close: {}", date),
                        None => println!("Last Close: n/a"),
                    }
                }
                None => {
                    println!("No engine session found. Run 'emalev run' to start the engine.");
                    return Ok(());
                }
            }

            println!("\n=== Journal ===");
            for (label, kind) in [
                ("Entries:", "entry_executed"),
                ("Exits:", "exit_executed"),
                ("Stops:", "stop_triggered"),
                ("Rejections:", "order_rejected"),
                ("Halts:", "halted"),
            ] {
                println!("{:<12}{}", label, db.count_events(kind).await?);
            }

            let events = db.recent_events(limit).await?;
            println!("\n=== Recent Events ({}) ===", events.len());
            for event in events.iter().rev() {
                println!(
                    "{:>6} {:<32} {:<20} {}",
                    event.id,
                    event.timestamp,
                    event.kind,
                    truncate(&event.payload, 96)
                );
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
