//! Position sizing: leveraged equity notional converted to whole shares.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Calculator for the target share count.
///
/// Stateless: identical inputs always give identical output, so the target
/// can be recomputed freely after a reconnect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionSizer;

impl PositionSizer {
    pub fn new() -> Self {
        Self
    }

    /// Target shares = floor(equity * leverage / price).
    ///
    /// # Arguments
    /// * `equity` - Current account equity in dollars
    /// * `leverage` - Multiplier applied to equity
    /// * `price` - Mark price per share
    ///
    /// # Returns
    /// Share count, or zero when any input makes sizing meaningless
    pub fn size(&self, equity: Decimal, leverage: Decimal, price: Decimal) -> u64 {
        if price <= Decimal::ZERO || equity <= Decimal::ZERO || leverage <= Decimal::ZERO {
            return 0;
        }

        let Some(target_notional) = equity.checked_mul(leverage) else {
            return 0;
        };
        target_notional
            .checked_div(price)
            .and_then(|shares| shares.floor().to_u64())
            .unwrap_or(0)
    }

    /// Sizing from raw feed values; non-finite prices are rejected.
    pub fn size_from_mark(&self, equity: Decimal, leverage: Decimal, price: f64) -> u64 {
        match Decimal::try_from(price) {
            Ok(p) if price.is_finite() => self.size(equity, leverage, p),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sizing() {
        let sizer = PositionSizer::new();
        assert_eq!(sizer.size(dec!(100000), dec!(3.0), dec!(400.0)), 750);
        assert_eq!(sizer.size(dec!(300000), dec!(3.0), dec!(281.50)), 3197);
    }

    #[test]
    fn test_rejects_degenerate_inputs() {
        let sizer = PositionSizer::new();
        assert_eq!(sizer.size(dec!(100000), dec!(0), dec!(400.0)), 0);
        assert_eq!(sizer.size(dec!(100000), dec!(3.0), dec!(0)), 0);
        assert_eq!(sizer.size(dec!(100000), dec!(3.0), dec!(-5)), 0);
        assert_eq!(sizer.size(dec!(0), dec!(3.0), dec!(400.0)), 0);
        assert_eq!(sizer.size(dec!(-10), dec!(3.0), dec!(400.0)), 0);
        assert_eq!(sizer.size_from_mark(dec!(100000), dec!(3.0), f64::NAN), 0);
        assert_eq!(sizer.size_from_mark(dec!(100000), dec!(3.0), f64::INFINITY), 0);
    }

    #[test]
    fn test_tiny_price_does_not_overflow() {
        let sizer = PositionSizer::new();
        assert_eq!(sizer.size(dec!(300000), dec!(3.0), Decimal::new(1, 25)), 0);
        assert_eq!(sizer.size_from_mark(dec!(300000), dec!(3.0), 1e-25), 0);
        assert_eq!(sizer.size(Decimal::MAX, dec!(3.0), dec!(400.0)), 0);
    }

    #[test]
    fn test_idempotent() {
        let sizer = PositionSizer::new();
        let a = sizer.size_from_mark(dec!(123456.78), dec!(3.25), 271.13);
        let b = sizer.size_from_mark(dec!(123456.78), dec!(3.25), 271.13);
        assert_eq!(a, b);
        assert!(a > 0);
    }
}
