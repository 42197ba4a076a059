//! Yahoo Finance market data: daily closes and the volatility index.
//!
//! Uses the v8 chart API. Yahoo has no official API and changes its format
//! without notice, so malformed responses surface as `DataUnavailable` and
//! never advance engine state.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::EngineError;
use crate::models::PriceBar;

use super::types::*;
use super::MarketData;

const CHART_BASE: &str = "https://query2.finance.yahoo.com/v8/finance/chart";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for Yahoo's chart API.
pub struct YahooMarketData {
    client: Client,
    base_url: String,
    volatility_symbol: String,
    timezone: Tz,
}

impl YahooMarketData {
    pub fn new(volatility_symbol: &str, timezone: Tz) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: CHART_BASE.to_string(),
            volatility_symbol: volatility_symbol.to_string(),
            timezone,
        })
    }

    /// Build the chart URL for a symbol; index symbols like `^VIX` are escaped.
    fn chart_url(&self, symbol: &str) -> String {
        format!("{}/{}", self.base_url, symbol.replace('^', "%5E"))
    }

    async fn fetch_chart(&self, symbol: &str, query: &[(&str, String)]) -> Result<ChartData, EngineError> {
        let url = self.chart_url(symbol);
        debug!(url = %url, ?query, "Fetching chart");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| EngineError::ConnectionLost(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::ConnectionLost(format!("{} for {}", status, symbol)));
        }
        if !status.is_success() {
            return Err(EngineError::DataUnavailable(format!("{} for {}", status, symbol)));
        }

        let chart: ChartResponse = response
            .json()
            .await
            .map_err(|e| EngineError::DataUnavailable(format!("failed to parse chart for {}: {}", symbol, e)))?;

        first_result(symbol, chart)
    }

    /// Daily closes between two dates (inclusive).
    async fn daily_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>, EngineError> {
        let start_ts = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();

        let data = self
            .fetch_chart(
                symbol,
                &[
                    ("period1", start_ts.to_string()),
                    ("period2", end_ts.to_string()),
                    ("interval", "1d".to_string()),
                ],
            )
            .await?;

        parse_daily_bars(&data, self.timezone)
    }

    async fn regular_market_price(&self, symbol: &str) -> Result<Option<f64>, EngineError> {
        let data = self
            .fetch_chart(
                symbol,
                &[("range", "1d".to_string()), ("interval", "1d".to_string())],
            )
            .await?;
        Ok(data.meta.regular_market_price.filter(|p| p.is_finite()))
    }
}

fn first_result(symbol: &str, chart: ChartResponse) -> Result<ChartData, EngineError> {
    let Some(results) = chart.chart.result else {
        let reason = chart
            .chart
            .error
            .map(|e| format!("{}: {}", e.code, e.description))
            .unwrap_or_else(|| "empty result with no error".to_string());
        return Err(EngineError::DataUnavailable(format!("{} chart: {}", symbol, reason)));
    };

    results
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::DataUnavailable(format!("{} chart: result array is empty", symbol)))
}

/// Turn chart data into session-dated bars, skipping holidays and gaps.
fn parse_daily_bars(data: &ChartData, timezone: Tz) -> Result<Vec<PriceBar>, EngineError> {
    let Some(timestamps) = &data.timestamp else {
        return Ok(Vec::new());
    };
    let closes = data
        .indicators
        .quote
        .first()
        .map(|q| q.close.as_slice())
        .ok_or_else(|| EngineError::DataUnavailable("chart has no quote data".into()))?;

    let bars = timestamps
        .iter()
        .zip(closes.iter())
        .filter_map(|(&ts, close)| {
            let close = (*close)?;
            let date = DateTime::from_timestamp(ts, 0)?
                .with_timezone(&timezone)
                .date_naive();
            Some(PriceBar::new(date, close))
        })
        .collect();

    Ok(bars)
}

#[async_trait]
impl MarketData for YahooMarketData {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    async fn get_closing_price(&self, symbol: &str, date: NaiveDate) -> Result<f64, EngineError> {
        let bars = self.daily_bars(symbol, date, date).await?;
        bars.iter()
            .find(|b| b.date == date)
            .map(|b| b.close)
            .ok_or_else(|| EngineError::DataUnavailable(format!("no {} close for {}", symbol, date)))
    }

    async fn get_volatility_indicator(&self) -> Result<Option<f64>, EngineError> {
        match self.regular_market_price(&self.volatility_symbol).await {
            Ok(value) => Ok(value),
            // A missing indicator means baseline leverage, not a retry loop
            Err(EngineError::DataUnavailable(reason)) => {
                debug!(reason = %reason, "Volatility indicator unavailable");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_daily_closes(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, EngineError> {
        self.daily_bars(symbol, start, end).await
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, EngineError> {
        self.regular_market_price(symbol)
            .await?
            .ok_or_else(|| EngineError::DataUnavailable(format!("no market price for {}", symbol)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHART_JSON: &str = r#"{
        "chart": {
            "result": [{
                "meta": {"regularMarketPrice": 281.5},
                "timestamp": [1741613400, 1741699800, 1741786200],
                "indicators": {"quote": [{"close": [270.25, null, 275.0]}]}
            }],
            "error": null
        }
    }"#;

    #[test]
    fn test_parse_daily_bars_skips_gaps() {
        let chart: ChartResponse = serde_json::from_str(CHART_JSON).unwrap();
        let data = first_result("SMH", chart).unwrap();
        assert_eq!(data.meta.regular_market_price, Some(281.5));

        let bars = parse_daily_bars(&data, chrono_tz::America::New_York).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(bars[0].close, 270.25);
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2025, 3, 12).unwrap());
    }

    #[test]
    fn test_chart_error_is_data_unavailable() {
        let chart: ChartResponse = serde_json::from_str(
            r#"{"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found"}}}"#,
        )
        .unwrap();
        let err = first_result("NOPE", chart).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable(ref m) if m.contains("Not Found")));
    }

    #[test]
    fn test_index_symbol_is_escaped() {
        let yahoo = YahooMarketData::new("^VIX", chrono_tz::America::New_York).unwrap();
        assert!(yahoo.chart_url("^VIX").ends_with("/%5EVIX"));
    }
}
