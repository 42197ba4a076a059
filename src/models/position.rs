//! Position model for the single leveraged holding.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The one open long position the engine may hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument symbol (e.g., "SMH")
    pub symbol: String,

    /// Number of shares held
    pub shares: u64,

    /// Price paid per share (mark at entry, or broker average when adopted)
    pub entry_price: Decimal,

    /// Leverage multiplier used to size the entry; unknown for positions
    /// adopted from the broker during reconciliation
    pub leverage_used: Option<Decimal>,

    /// When the position was opened (or adopted)
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Create a position from an executed entry.
    pub fn new(
        symbol: String,
        shares: u64,
        entry_price: Decimal,
        leverage_used: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            shares,
            entry_price,
            leverage_used: Some(leverage_used),
            opened_at,
        }
    }

    /// Build a position from what the broker reports holding.
    pub fn adopted(symbol: String, shares: u64, avg_price: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            symbol,
            shares,
            entry_price: avg_price,
            leverage_used: None,
            opened_at: at,
        }
    }

    /// Cost basis in dollars.
    pub fn notional(&self) -> Decimal {
        Decimal::from(self.shares) * self.entry_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_notional() {
        let pos = Position::new("SMH".to_string(), 3197, dec!(281.50), dec!(3.0), Utc::now());
        assert_eq!(pos.notional(), dec!(899955.50));
        assert_eq!(pos.leverage_used, Some(dec!(3.0)));
    }

    #[test]
    fn test_adopted_position_has_unknown_leverage() {
        let pos = Position::adopted("SMH".to_string(), 100, dec!(250), Utc::now());
        assert_eq!(pos.leverage_used, None);
        assert_eq!(pos.notional(), dec!(25000));
    }
}
