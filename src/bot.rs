//! Engine runner: main loop around the session scheduler.
//!
//! Handles:
//! - Wiring the broker, market data, and clock
//! - Bootstrapping the averages (history, then persisted snapshot)
//! - Ticking the scheduler on the poll interval
//! - Journaling events and saving the EMA snapshot after each tick
//! - Graceful shutdown without flattening the position

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{AlpacaBroker, Broker, MarketData, PaperBroker, YahooMarketData};
use crate::db::Database;
use crate::scheduler::{BootstrapSource, Phase, SessionScheduler, SystemClock};
use crate::trading::TradingConfig;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Strategy, schedule, and retry settings
    pub trading: TradingConfig,

    /// Use the simulated broker instead of Alpaca
    pub paper: bool,

    /// Starting cash for the simulated broker
    pub paper_capital: Decimal,

    /// Database URL
    pub database_url: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            paper: true,
            paper_capital: dec!(100000),
            database_url: "sqlite:emalev.db?mode=rwc".to_string(),
        }
    }
}

/// Main engine runner.
pub struct Runner {
    config: RunnerConfig,
    db: Database,
    scheduler: SessionScheduler,

    // Simulated broker actually wired, even if live was requested
    paper: bool,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Runner {
    /// Create a new runner with live collaborators.
    pub async fn new(config: RunnerConfig) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let tz = config.trading.timezone()?;

        let market: Arc<dyn MarketData> = Arc::new(YahooMarketData::new(
            &config.trading.volatility_symbol,
            tz,
        )?);

        let paper = || -> Arc<dyn Broker> {
            Arc::new(
                PaperBroker::new(&config.trading.symbol, config.paper_capital)
                    .with_quotes(market.clone()),
            )
        };

        // Fall back to the simulated broker when credentials are missing
        let broker: Arc<dyn Broker> = if config.paper {
            paper()
        } else {
            match AlpacaBroker::from_env() {
                Ok(client) => {
                    info!("Alpaca client initialized");
                    Arc::new(client)
                }
                Err(e) => {
                    warn!("Alpaca client not configured: {}. Running on the paper broker.", e);
                    paper()
                }
            }
        };

        let paper = broker.name() == "paper";
        info!(broker = broker.name(), market = market.name(), "Collaborators wired");

        let scheduler = SessionScheduler::new(
            config.trading.clone(),
            broker,
            market,
            Arc::new(SystemClock),
        )
        .context("Invalid trading configuration")?;

        Ok(Self {
            config,
            db,
            scheduler,
            paper,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether orders go to the simulated broker.
    pub fn is_paper(&self) -> bool {
        self.paper
    }

    /// Connect, reconcile, and bootstrap the averages.
    pub async fn initialize(&mut self) -> Result<BootstrapSource> {
        info!("Initializing engine...");

        let snapshot = self.db.load_ema_state().await?;
        if let Some(state) = &snapshot {
            debug!(last_date = ?state.last_date, "Found persisted EMA snapshot");
        }

        let started = self.scheduler.start().await;
        self.persist_events().await;
        started.context("Failed to connect to broker")?;

        let source = self.scheduler.bootstrap(snapshot).await;
        if self.scheduler.ema_state().initialized {
            self.db.save_ema_state(self.scheduler.ema_state()).await?;
        }

        info!(
            symbol = %self.config.trading.symbol,
            mode = %self.config.trading.mode,
            bootstrap = ?source,
            signal = ?self.scheduler.signal(),
            position = ?self.scheduler.position().map(|p| p.shares),
            "Engine initialized"
        );

        Ok(source)
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        let poll_every = self.config.trading.poll_interval();
        info!(
            mode = %self.config.trading.mode,
            poll_interval = poll_every.as_secs(),
            "Starting session loop"
        );

        let mut poll_interval = interval(poll_every);

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut halted = None;
        while !self.shutdown.load(Ordering::SeqCst) {
            poll_interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let last_close = self.scheduler.ema_state().last_date;
            let result = self.scheduler.tick().await;
            self.persist(last_close).await;

            if let Err(e) = result {
                error!(error = %e, "Halting session loop");
                halted = Some(e);
                break;
            }
        }

        // Graceful shutdown
        self.shutdown().await;

        match halted {
            Some(e) => Err(e).context("Session loop halted"),
            None => Ok(()),
        }
    }

    /// Save whatever the last tick changed. Persistence failures are logged
    /// and never stop the loop.
    async fn persist(&mut self, last_close: Option<chrono::NaiveDate>) {
        self.persist_events().await;

        let state = self.scheduler.ema_state();
        if state.initialized && state.last_date != last_close {
            if let Err(e) = self.db.save_ema_state(state).await {
                warn!(error = %e, "Failed to save EMA snapshot");
            }
        }
    }

    async fn persist_events(&mut self) {
        let events = self.scheduler.drain_events();
        if let Err(e) = self.db.record_events(&events).await {
            warn!(error = %e, count = events.len(), "Failed to journal events");
        }
    }

    /// Graceful shutdown. The open position is left in place.
    async fn shutdown(&mut self) {
        info!("Shutting down engine...");

        self.scheduler.shutdown().await;
        self.persist_events().await;

        info!("Engine shutdown complete");
    }

    /// Current engine summary.
    pub fn get_stats(&self) -> RunnerStats {
        let state = self.scheduler.ema_state();
        RunnerStats {
            symbol: self.config.trading.symbol.clone(),
            phase: self.scheduler.phase(),
            signal: self.scheduler.signal().map(|s| s.to_string()),
            fast_ema: state.fast_value,
            slow_ema: state.slow_value,
            last_close_date: state.last_date,
            shares: self.scheduler.position().map_or(0, |p| p.shares),
            entry_price: self.scheduler.position().map(|p| p.entry_price),
            notional: self.scheduler.position().map(|p| p.notional()),
            day_start_equity: self.scheduler.session().and_then(|s| s.day_start_equity),
            stopped_today: self
                .scheduler
                .session()
                .is_some_and(|s| s.stop_triggered_today),
            halted: self.scheduler.is_halted(),
            paper: self.paper,
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct RunnerStats {
    pub symbol: String,
    pub phase: Phase,
    pub signal: Option<String>,
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub last_close_date: Option<chrono::NaiveDate>,
    pub shares: u64,
    pub entry_price: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub day_start_equity: Option<Decimal>,
    pub stopped_today: bool,
    pub halted: bool,
    pub paper: bool,
}

impl std::fmt::Display for RunnerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Engine Statistics ===")?;
        writeln!(f, "Symbol:          {}", self.symbol)?;
        writeln!(f, "Phase:           {:?}", self.phase)?;
        writeln!(f, "Signal:          {}", self.signal.as_deref().unwrap_or("n/a"))?;
        writeln!(f, "Fast EMA:        {:.4}", self.fast_ema)?;
        writeln!(f, "Slow EMA:        {:.4}", self.slow_ema)?;
        match self.last_close_date {
            Some(date) => writeln!(f, "Last Close:      {}", date)?,
            None => writeln!(f, "Last Close:      n/a")?,
        }
        match self.entry_price {
            Some(price) => writeln!(f, "Position:        {} shares @ ${:.2}", self.shares, price)?,
            None => writeln!(f, "Position:        flat")?,
        }
        if let Some(notional) = self.notional {
            writeln!(f, "Cost Basis:      ${:.2}", notional)?;
        }
        if let Some(equity) = self.day_start_equity {
            writeln!(f, "Day Start:       ${:.2}", equity)?;
        }
        writeln!(f, "Stopped Today:   {}", if self.stopped_today { "Yes" } else { "No" })?;
        let status = if self.halted { "Halted" } else { "Stopped" };
        let broker = if self.paper { "(Paper)" } else { "(Live)" };
        writeln!(f, "Status:          {} {}", status, broker)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_display() {
        let stats = RunnerStats {
            symbol: "SMH".into(),
            phase: Phase::PositionOpen,
            signal: Some("BULL".into()),
            fast_ema: 281.25,
            slow_ema: 265.5,
            last_close_date: chrono::NaiveDate::from_ymd_opt(2025, 3, 10),
            shares: 3197,
            entry_price: Some(dec!(281.5)),
            notional: Some(dec!(899955.5)),
            day_start_equity: Some(dec!(300000)),
            stopped_today: false,
            halted: false,
            paper: true,
        };
        let text = stats.to_string();
        assert!(text.contains("3197 shares @ $281.50"));
        assert!(text.contains("Signal:          BULL"));
        assert!(text.contains("Cost Basis:      $899955.50"));
        assert!(text.contains("Status:          Stopped (Paper)"));
    }

    #[test]
    fn test_runner_wires_paper_broker() {
        let config = RunnerConfig {
            database_url: "sqlite::memory:".into(),
            ..Default::default()
        };
        tokio_test::block_on(async {
            let runner = Runner::new(config).await.unwrap();
            let stats = runner.get_stats();
            assert!(runner.is_paper());
            assert!(stats.paper);
            assert_eq!(stats.shares, 0);
            assert_eq!(stats.notional, None);
            assert!(!stats.halted);
            assert!(!runner.shutdown.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn test_live_request_without_credentials_reports_paper() {
        std::env::remove_var("ALPACA_API_KEY_ID");
        let config = RunnerConfig {
            paper: false,
            database_url: "sqlite::memory:".into(),
            ..Default::default()
        };
        tokio_test::block_on(async {
            let runner = Runner::new(config).await.unwrap();
            assert!(runner.is_paper());
            assert!(runner.get_stats().to_string().contains("(Paper)"));
        });
    }
}
