//! Trading logic: signal, leverage, sizing, risk, configuration.

mod config;
mod leverage;
mod position_sizer;
mod risk;
mod signal;

pub use config::{RunMode, TradingConfig};
pub use leverage::{LeverageSelector, LeverageTable};
pub use position_sizer::PositionSizer;
pub use risk::{RiskCheck, RiskMonitor};
pub use signal::{EmaState, Signal, SignalEngine};
