//! Daily closing-price bar feeding the moving averages.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One session's official close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Exchange-local session date
    pub date: NaiveDate,

    /// Closing price
    pub close: f64,
}

impl PriceBar {
    pub fn new(date: NaiveDate, close: f64) -> Self {
        Self { date, close }
    }
}
