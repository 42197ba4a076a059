//! In-memory simulated broker for dry runs and failure-injection tests.
//!
//! Fills are immediate at the current mark. Orders are idempotent on
//! `client_order_id`: resubmitting the same id returns the first ack
//! without touching the account.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::EngineError;

use super::types::{BrokerPosition, OrderAck, OrderRequest, OrderSide};
use super::{Broker, MarketData};

#[derive(Debug)]
struct PaperAccount {
    cash: Decimal,
    shares: i64,
    avg_price: Decimal,
    mark: Option<f64>,
    equity_override: Option<f64>,
    connected: bool,
    refuse_connects: u32,
    reject_orders: u32,
    acks: HashMap<String, OrderAck>,
    orders: Vec<OrderRequest>,
}

/// Simulated margin account holding a single instrument.
pub struct PaperBroker {
    symbol: String,
    account: Mutex<PaperAccount>,
    quotes: Option<Arc<dyn MarketData>>,
}

impl PaperBroker {
    /// Create a flat account with `capital` in cash.
    pub fn new(symbol: &str, capital: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            account: Mutex::new(PaperAccount {
                cash: capital,
                shares: 0,
                avg_price: Decimal::ZERO,
                mark: None,
                equity_override: None,
                connected: false,
                refuse_connects: 0,
                reject_orders: 0,
                acks: HashMap::new(),
                orders: Vec::new(),
            }),
            quotes: None,
        }
    }

    /// Mark positions with live quotes from a market-data feed.
    pub fn with_quotes(mut self, quotes: Arc<dyn MarketData>) -> Self {
        self.quotes = Some(quotes);
        self
    }

    fn account(&self) -> MutexGuard<'_, PaperAccount> {
        // A poisoned lock only means a test panicked mid-update
        self.account.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(account: &PaperAccount) -> Result<(), EngineError> {
        if account.connected {
            Ok(())
        } else {
            Err(EngineError::ConnectionLost("paper broker disconnected".into()))
        }
    }

    fn equity_of(account: &PaperAccount) -> Decimal {
        let mark = account
            .mark
            .and_then(|m| Decimal::try_from(m).ok())
            .unwrap_or(account.avg_price);
        account.cash + Decimal::from(account.shares) * mark
    }

    async fn refresh_mark(&self) {
        let Some(quotes) = &self.quotes else {
            return;
        };
        match quotes.get_latest_price(&self.symbol).await {
            Ok(price) => self.account().mark = Some(price),
            Err(e) => debug!(error = %e, "Paper quote refresh failed, keeping last mark"),
        }
    }
}

#[cfg(test)]
impl PaperBroker {
    /// Set the mark price; `None` makes quotes unavailable.
    pub fn set_mark(&self, mark: Option<f64>) {
        self.account().mark = mark;
    }

    /// Drop the link; calls fail with `ConnectionLost` until `connect`.
    pub fn drop_connection(&self) {
        self.account().connected = false;
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.account().refuse_connects = n;
    }

    /// Reject the next `n` orders.
    pub fn reject_orders(&self, n: u32) {
        self.account().reject_orders = n;
    }

    /// Overwrite the holding as if traded outside the engine.
    pub fn set_position(&self, shares: i64, avg_price: Decimal) {
        let mut account = self.account();
        account.shares = shares;
        account.avg_price = avg_price;
    }

    /// Every accepted order, in submission order.
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.account().orders.clone()
    }

    pub fn shares(&self) -> i64 {
        self.account().shares
    }

    /// Report `equity` instead of the marked-to-market value.
    pub fn set_equity_override(&self, equity: Option<f64>) {
        self.account().equity_override = equity;
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn connect(&self) -> Result<(), EngineError> {
        let mut account = self.account();
        if account.refuse_connects > 0 {
            account.refuse_connects -= 1;
            return Err(EngineError::ConnectionLost("paper broker refused connection".into()));
        }
        account.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.account().connected = false;
        Ok(())
    }

    async fn get_current_position(
        &self,
        symbol: &str,
    ) -> Result<Option<BrokerPosition>, EngineError> {
        let account = self.account();
        Self::ensure_connected(&account)?;

        if symbol != self.symbol || account.shares == 0 {
            return Ok(None);
        }
        Ok(Some(BrokerPosition {
            symbol: symbol.to_string(),
            shares: account.shares,
            avg_price: account.avg_price.to_f64().unwrap_or(0.0),
        }))
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, EngineError> {
        Self::ensure_connected(&self.account())?;
        self.refresh_mark().await;

        let account = self.account();
        match account.mark {
            Some(mark) if symbol == self.symbol => Ok(mark),
            _ => Err(EngineError::DataUnavailable(format!("no mark price for {}", symbol))),
        }
    }

    async fn get_account_equity(&self) -> Result<f64, EngineError> {
        Self::ensure_connected(&self.account())?;
        self.refresh_mark().await;

        let account = self.account();
        if let Some(equity) = account.equity_override {
            return Ok(equity);
        }
        Ok(Self::equity_of(&account).to_f64().unwrap_or(0.0))
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, EngineError> {
        let mut account = self.account();
        Self::ensure_connected(&account)?;

        if let Some(ack) = account.acks.get(&order.client_order_id) {
            return Ok(ack.clone());
        }
        if account.reject_orders > 0 {
            account.reject_orders -= 1;
            return Err(EngineError::OrderRejected("paper broker rejected order".into()));
        }
        if order.symbol != self.symbol || order.shares == 0 {
            return Err(EngineError::OrderRejected(format!(
                "cannot trade {} shares of {}",
                order.shares, order.symbol
            )));
        }
        let fill = account
            .mark
            .and_then(|m| Decimal::try_from(m).ok())
            .ok_or_else(|| EngineError::OrderRejected("no mark price to fill at".into()))?;

        let qty = order.shares as i64;
        let cost = Decimal::from(qty) * fill;
        match order.side {
            OrderSide::Buy => {
                let held = Decimal::from(account.shares) * account.avg_price;
                account.shares += qty;
                account.avg_price = (held + cost) / Decimal::from(account.shares);
                account.cash -= cost;
            }
            OrderSide::Sell => {
                if qty > account.shares {
                    return Err(EngineError::OrderRejected(format!(
                        "cannot sell {} shares, holding {}",
                        qty, account.shares
                    )));
                }
                account.shares -= qty;
                account.cash += cost;
                if account.shares == 0 {
                    account.avg_price = Decimal::ZERO;
                }
            }
        }

        let ack = OrderAck {
            order_id: format!("paper-{}", account.orders.len() + 1),
            status: "filled".to_string(),
            filled_avg_price: fill.to_f64(),
        };
        account.acks.insert(order.client_order_id.clone(), ack.clone());
        account.orders.push(order.clone());

        info!(
            side = order.side.as_str(),
            shares = order.shares,
            price = %fill,
            cash = %account.cash,
            "[PAPER] Order filled"
        );

        Ok(ack)
    }
}

/// Fixed market-data feed for tests.
#[cfg(test)]
pub struct StaticMarketData {
    closes: Mutex<HashMap<chrono::NaiveDate, f64>>,
    volatility: Mutex<Option<f64>>,
    history: Vec<crate::models::PriceBar>,
}

#[cfg(test)]
impl StaticMarketData {
    pub fn new(history: Vec<crate::models::PriceBar>) -> Self {
        Self {
            closes: Mutex::new(HashMap::new()),
            volatility: Mutex::new(None),
            history,
        }
    }

    pub fn set_close(&self, date: chrono::NaiveDate, close: f64) {
        self.closes.lock().unwrap().insert(date, close);
    }

    pub fn set_volatility(&self, vol: Option<f64>) {
        *self.volatility.lock().unwrap() = vol;
    }
}

#[cfg(test)]
#[async_trait]
impl MarketData for StaticMarketData {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_closing_price(
        &self,
        symbol: &str,
        date: chrono::NaiveDate,
    ) -> Result<f64, EngineError> {
        self.closes
            .lock()
            .unwrap()
            .get(&date)
            .copied()
            .ok_or_else(|| EngineError::DataUnavailable(format!("no close for {} on {}", symbol, date)))
    }

    async fn get_volatility_indicator(&self) -> Result<Option<f64>, EngineError> {
        Ok(*self.volatility.lock().unwrap())
    }

    async fn get_daily_closes(
        &self,
        _symbol: &str,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> Result<Vec<crate::models::PriceBar>, EngineError> {
        Ok(self
            .history
            .iter()
            .filter(|b| b.date >= start && b.date <= end)
            .copied()
            .collect())
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, EngineError> {
        Err(EngineError::DataUnavailable(format!("no live quotes for {}", symbol)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fill_and_equity() {
        let broker = PaperBroker::new("SMH", dec!(100000));
        broker.connect().await.unwrap();
        broker.set_mark(Some(400.0));

        let order = OrderRequest::market("SMH-20250310-entry-0".into(), "SMH", OrderSide::Buy, 750);
        broker.submit_order(&order).await.unwrap();
        // Resubmitting the same id does not double the position
        broker.submit_order(&order).await.unwrap();

        assert_eq!(broker.shares(), 750);
        assert_eq!(broker.get_account_equity().await.unwrap(), 100000.0);

        broker.set_mark(Some(390.0));
        assert_eq!(broker.get_account_equity().await.unwrap(), 92500.0);

        let pos = broker.get_current_position("SMH").await.unwrap().unwrap();
        assert_eq!(pos.shares, 750);
        assert_eq!(pos.avg_price, 400.0);
    }

    #[tokio::test]
    async fn test_disconnected_calls_fail() {
        let broker = PaperBroker::new("SMH", dec!(100000));
        assert!(matches!(
            broker.get_account_equity().await,
            Err(EngineError::ConnectionLost(_))
        ));

        broker.refuse_connects(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert!(broker.get_account_equity().await.is_ok());
    }

    #[tokio::test]
    async fn test_rejection_leaves_account_unchanged() {
        let broker = PaperBroker::new("SMH", dec!(100000));
        broker.connect().await.unwrap();
        broker.set_mark(Some(400.0));
        broker.reject_orders(1);

        let result = broker
            .submit_order(&OrderRequest::market(
                "SMH-20250310-entry-0".into(),
                "SMH",
                OrderSide::Buy,
                10,
            ))
            .await;
        assert!(matches!(result, Err(EngineError::OrderRejected(_))));
        assert_eq!(broker.shares(), 0);
        assert!(broker.orders().is_empty());
    }
}
