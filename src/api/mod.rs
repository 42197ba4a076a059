//! Broker and market-data collaborators.
//!
//! The scheduler only sees the [`Broker`] and [`MarketData`] traits. Every
//! call is fallible and is driven through the shared retry policy.

mod alpaca;
mod paper;
mod types;
mod yahoo;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::EngineError;
use crate::models::PriceBar;

pub use alpaca::AlpacaBroker;
pub use paper::PaperBroker;
#[cfg(test)]
pub use paper::StaticMarketData;
pub use types::{BrokerPosition, OrderAck, OrderRequest, OrderSide};
pub use yahoo::YahooMarketData;

/// Execution and account collaborator.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), EngineError>;

    async fn disconnect(&self) -> Result<(), EngineError>;

    /// Current holding in `symbol`, `None` when flat.
    async fn get_current_position(
        &self,
        symbol: &str,
    ) -> Result<Option<BrokerPosition>, EngineError>;

    /// Latest tradable price; `DataUnavailable` when there is none.
    async fn get_mark_price(&self, symbol: &str) -> Result<f64, EngineError>;

    /// Net liquidation value of the account.
    async fn get_account_equity(&self) -> Result<f64, EngineError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, EngineError>;
}

/// Closing prices and the volatility indicator.
#[async_trait]
pub trait MarketData: Send + Sync {
    fn name(&self) -> &str;

    /// Official close for one session.
    async fn get_closing_price(&self, symbol: &str, date: NaiveDate) -> Result<f64, EngineError>;

    /// Current reading of the volatility index; `None` when the feed lacks it.
    async fn get_volatility_indicator(&self) -> Result<Option<f64>, EngineError>;

    /// Daily closes in `[start, end]`, used to bootstrap the averages.
    async fn get_daily_closes(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, EngineError>;

    /// Latest traded price, used by the paper broker for fills.
    async fn get_latest_price(&self, symbol: &str) -> Result<f64, EngineError>;
}
