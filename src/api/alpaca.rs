//! Alpaca REST v2 broker adapter.
//!
//! Account and orders go to the trading API (paper or live base URL),
//! marks come from the market-data API's latest trade.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::EngineError;

use super::types::*;
use super::Broker;

pub const PAPER_URL: &str = "https://paper-api.alpaca.markets";
pub const DATA_URL: &str = "https://data.alpaca.markets";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the Alpaca trading and market-data APIs.
pub struct AlpacaBroker {
    http: Client,
    base_url: String,
    data_url: String,
    key_id: String,
    secret_key: String,
}

impl AlpacaBroker {
    pub fn new(key_id: String, secret_key: String, base_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: DATA_URL.to_string(),
            key_id,
            secret_key,
        })
    }

    /// Create from `ALPACA_API_KEY_ID`, `ALPACA_API_SECRET_KEY` and the
    /// optional `ALPACA_BASE_URL` (defaults to the paper endpoint).
    pub fn from_env() -> Result<Self> {
        let key_id =
            std::env::var("ALPACA_API_KEY_ID").context("ALPACA_API_KEY_ID not set")?;
        let secret_key =
            std::env::var("ALPACA_API_SECRET_KEY").context("ALPACA_API_SECRET_KEY not set")?;
        let base_url = std::env::var("ALPACA_BASE_URL").unwrap_or_else(|_| PAPER_URL.to_string());

        Self::new(key_id, secret_key, base_url)
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, EngineError> {
        request.send().await.map_err(transport_error)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, EngineError> {
        debug!(url = %url, "Alpaca GET");
        let response = self.send(self.get(url)).await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| EngineError::DataUnavailable(format!("malformed response: {}", e)))
    }
}

/// Timeouts and refused connections are link failures.
fn transport_error(e: reqwest::Error) -> EngineError {
    EngineError::ConnectionLost(e.to_string())
}

async fn check_status(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);

    Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        EngineError::ConnectionLost(format!("{}: {}", status, message))
    } else if status == StatusCode::UNAUTHORIZED {
        EngineError::Config(format!("Alpaca credentials rejected: {}", message))
    } else {
        EngineError::DataUnavailable(format!("{}: {}", status, message))
    })
}

/// Alpaca refuses a reused `client_order_id` with a 422.
fn is_duplicate_client_id(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("client_order_id") && message.contains("unique")
}

fn to_ack(order: OrderResponse) -> OrderAck {
    OrderAck {
        order_id: order.id,
        status: order.status,
        filled_avg_price: order.filled_avg_price.and_then(|p| p.parse().ok()),
    }
}

fn parse_number(field: &'static str, raw: &str) -> Result<f64, EngineError> {
    raw.parse::<f64>()
        .map_err(|_| EngineError::DataUnavailable(format!("unparseable {}: {}", field, raw)))
}

#[async_trait]
impl Broker for AlpacaBroker {
    fn name(&self) -> &str {
        "alpaca"
    }

    async fn connect(&self) -> Result<(), EngineError> {
        let account: AccountResponse = self
            .get_json(format!("{}/v2/account", self.base_url))
            .await?;

        if account.trading_blocked {
            return Err(EngineError::Config("Alpaca account is blocked from trading".into()));
        }
        info!(status = %account.status, equity = %account.equity, "Connected to Alpaca");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        // Stateless REST session
        Ok(())
    }

    async fn get_current_position(
        &self,
        symbol: &str,
    ) -> Result<Option<BrokerPosition>, EngineError> {
        let url = format!("{}/v2/positions/{}", self.base_url, symbol);
        debug!(url = %url, "Alpaca GET");

        let response = self.send(self.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let position: PositionResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::DataUnavailable(format!("malformed position: {}", e)))?;

        let shares = parse_number("qty", &position.qty)? as i64;
        if shares == 0 {
            return Ok(None);
        }
        Ok(Some(BrokerPosition {
            symbol: position.symbol,
            shares,
            avg_price: parse_number("avg_entry_price", &position.avg_entry_price)?,
        }))
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, EngineError> {
        let latest: LatestTradeResponse = self
            .get_json(format!("{}/v2/stocks/{}/trades/latest", self.data_url, symbol))
            .await?;
        Ok(latest.trade.price)
    }

    async fn get_account_equity(&self) -> Result<f64, EngineError> {
        let account: AccountResponse = self
            .get_json(format!("{}/v2/account", self.base_url))
            .await?;
        parse_number("equity", &account.equity)
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, EngineError> {
        let body = CreateOrderRequest {
            symbol: order.symbol.clone(),
            qty: order.shares.to_string(),
            side: order.side,
            order_type: "market",
            time_in_force: "day",
            client_order_id: order.client_order_id.clone(),
        };

        let request = self
            .http
            .post(format!("{}/v2/orders", self.base_url))
            .header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
            .json(&body);
        let response = self.send(request).await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            if is_duplicate_client_id(&message) {
                // Earlier attempt went through; its ack was lost
                info!(client_order_id = %order.client_order_id, "Order already submitted, fetching it");
                let existing: OrderResponse = self
                    .get_json(format!(
                        "{}/v2/orders:by_client_order_id?client_order_id={}",
                        self.base_url, order.client_order_id
                    ))
                    .await?;
                return Ok(to_ack(existing));
            }
            return Err(EngineError::OrderRejected(format!("{}: {}", status, message)));
        }

        let ack: OrderResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::DataUnavailable(format!("malformed order ack: {}", e)))?;

        Ok(to_ack(ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("equity", "300000.55").unwrap(), 300000.55);
        assert!(matches!(
            parse_number("equity", "n/a"),
            Err(EngineError::DataUnavailable(_))
        ));
    }

    #[test]
    fn test_order_body_shape() {
        let body = CreateOrderRequest {
            symbol: "SMH".into(),
            qty: "3197".into(),
            side: OrderSide::Buy,
            order_type: "market",
            time_in_force: "day",
            client_order_id: "abc".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["side"], "buy");
        assert_eq!(json["type"], "market");
        assert_eq!(json["qty"], "3197");
    }

    #[test]
    fn test_duplicate_client_id_detection() {
        assert!(is_duplicate_client_id("client_order_id must be unique"));
        assert!(!is_duplicate_client_id("insufficient buying power"));

        let ack = to_ack(OrderResponse {
            id: "61e69015".into(),
            status: "filled".into(),
            filled_avg_price: Some("281.5".into()),
        });
        assert_eq!(ack.filled_avg_price, Some(281.5));
    }

    #[test]
    fn test_new_trims_base_url() {
        let broker = AlpacaBroker::new("k".into(), "s".into(), format!("{}/", PAPER_URL)).unwrap();
        assert_eq!(broker.base_url, PAPER_URL);
        assert_eq!(broker.name(), "alpaca");
    }
}
