//! Request and response types shared by the broker and market-data adapters.

use serde::{Deserialize, Serialize};

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// A market order for whole shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Idempotency key for the broker
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub shares: u64,
}

impl OrderRequest {
    /// Market order under a caller-chosen id. Resubmitting an attempt whose
    /// outcome is unknown must reuse the id so the broker can dedupe it.
    pub fn market(client_order_id: String, symbol: &str, side: OrderSide, shares: u64) -> Self {
        Self {
            client_order_id,
            symbol: symbol.to_string(),
            side,
            shares,
        }
    }
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    /// Average fill price if the broker reported one
    pub filled_avg_price: Option<f64>,
}

/// Position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed quantity; negative means short
    pub shares: i64,
    pub avg_price: f64,
}

// ==================== Alpaca wire types ====================

/// Response from `GET /v2/account`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub equity: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub trading_blocked: bool,
}

/// Response from `GET /v2/positions/{symbol}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionResponse {
    pub symbol: String,
    pub qty: String,
    pub avg_entry_price: String,
}

/// Body for `POST /v2/orders`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub time_in_force: &'static str,
    pub client_order_id: String,
}

/// Response from `POST /v2/orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub filled_avg_price: Option<String>,
}

/// Response from `GET /v2/stocks/{symbol}/trades/latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct LatestTradeResponse {
    pub trade: LatestTrade,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatestTrade {
    #[serde(rename = "p")]
    pub price: f64,
}

/// Error body returned by Alpaca on 4xx.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub message: String,
}

// ==================== Yahoo chart wire types ====================

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    pub chart: ChartResult,
}

#[derive(Debug, Deserialize)]
pub struct ChartResult {
    pub result: Option<Vec<ChartData>>,
    pub error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
pub struct ChartError {
    pub code: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct ChartData {
    pub meta: ChartMeta,
    pub timestamp: Option<Vec<i64>>,
    pub indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    #[serde(default)]
    pub regular_market_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct Indicators {
    pub quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteData {
    #[serde(default)]
    pub close: Vec<Option<f64>>,
}
