//! Trading configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use clap::ValueEnum;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::retry::RetryPolicy;

use super::leverage::{LeverageRule, LeverageTable};

/// How the scheduler gates its checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Bypass the open and pre-close time gates for immediate verification
    Test,
    /// Enforce the wall-clock checkpoints
    Scheduled,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Test => write!(f, "test"),
            RunMode::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Configuration for the signal, sizing, risk, and schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Instrument traded
    pub symbol: String,

    /// Symbol of the volatility index driving leverage
    pub volatility_symbol: String,

    /// Fast EMA period (sessions)
    pub fast_period: u32,

    /// Slow EMA period (sessions)
    pub slow_period: u32,

    /// Intraday equity drawdown that triggers the stop (0.0 to 1.0)
    pub stop_loss_fraction: Decimal,

    /// Exchange timezone name (IANA)
    pub timezone: String,

    /// Session-open checkpoint, exchange-local
    pub open_checkpoint_time: NaiveTime,

    /// Pre-close entry checkpoint, exchange-local
    pub entry_checkpoint_time: NaiveTime,

    /// Close checkpoint, exchange-local
    pub close_checkpoint_time: NaiveTime,

    /// Leverage when no rule matches or volatility is unavailable
    pub baseline_leverage: Decimal,

    /// Equity/price polling cadence
    pub poll_interval_seconds: u64,

    /// Checkpoint gating mode
    pub mode: RunMode,

    /// Days of daily closes used to bootstrap the EMAs
    pub bootstrap_lookback_days: u32,

    /// Whether a stop-loss exit leaves the same session's entry window open
    pub allow_reentry_after_stop: bool,

    /// Attempts per external call before giving up
    pub retry_max_attempts: u32,

    /// First retry delay in milliseconds
    pub retry_initial_backoff_ms: u64,

    /// Retry delay cap in milliseconds
    pub retry_max_backoff_ms: u64,

    /// Volatility-keyed leverage rules (kept last so TOML output stays valid)
    pub leverage_table: Vec<LeverageRule>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: "SMH".to_string(),
            volatility_symbol: "^VIX".to_string(),
            fast_period: 25,
            slow_period: 125,
            stop_loss_fraction: dec!(0.02), // -2% intraday equity stop
            timezone: "America/New_York".to_string(),
            open_checkpoint_time: hms(9, 30),
            entry_checkpoint_time: hms(15, 55), // 5 min before close
            close_checkpoint_time: hms(16, 0),
            baseline_leverage: dec!(3.0),
            poll_interval_seconds: 5,
            mode: RunMode::Scheduled,
            bootstrap_lookback_days: 365,
            allow_reentry_after_stop: true,
            retry_max_attempts: 5,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 30_000,
            leverage_table: vec![
                LeverageRule::new(12.0, dec!(3.75)),
                LeverageRule::new(13.0, dec!(3.5)),
                LeverageRule::new(14.0, dec!(3.25)),
            ],
        }
    }
}

fn hms(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

impl TradingConfig {
    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.fast_period == 0 || self.slow_period == 0 {
            return Err(EngineError::Config("EMA periods must be positive".into()));
        }
        if self.fast_period >= self.slow_period {
            return Err(EngineError::Config(format!(
                "fast_period ({}) must be shorter than slow_period ({})",
                self.fast_period, self.slow_period
            )));
        }
        if self.stop_loss_fraction <= Decimal::ZERO || self.stop_loss_fraction >= Decimal::ONE {
            return Err(EngineError::Config(format!(
                "stop_loss_fraction must be in (0, 1), got {}",
                self.stop_loss_fraction
            )));
        }
        if self.open_checkpoint_time >= self.entry_checkpoint_time
            || self.entry_checkpoint_time >= self.close_checkpoint_time
        {
            return Err(EngineError::Config(
                "checkpoints must be ordered open < entry < close".into(),
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err(EngineError::Config("poll_interval_seconds must be positive".into()));
        }
        if self.baseline_leverage <= Decimal::ZERO {
            return Err(EngineError::Config("baseline_leverage must be positive".into()));
        }
        self.timezone()?;
        LeverageTable::new(self.leverage_table.clone(), self.baseline_leverage)?;
        Ok(())
    }

    /// Parsed exchange timezone.
    pub fn timezone(&self) -> Result<Tz, EngineError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| EngineError::Config(format!("unknown timezone {}: {}", self.timezone, e)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        TradingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_inverted_periods() {
        let config = TradingConfig {
            fast_period: 125,
            slow_period: 25,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_entry_after_close() {
        let config = TradingConfig {
            entry_checkpoint_time: hms(16, 5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TradingConfig = toml::from_str(
            r#"
            symbol = "SOXX"
            stop_loss_fraction = 0.018
            mode = "test"
            entry_checkpoint_time = "15:50:00"

            [[leverage_table]]
            below = 15.0
            multiplier = 2.5
            "#,
        )
        .unwrap();

        assert_eq!(config.symbol, "SOXX");
        assert_eq!(config.mode, RunMode::Test);
        assert_eq!(config.stop_loss_fraction, dec!(0.018));
        assert_eq!(config.entry_checkpoint_time, hms(15, 50));
        assert_eq!(config.leverage_table.len(), 1);
        assert_eq!(config.fast_period, 25);
        config.validate().unwrap();
    }
}
