//! Volatility-keyed leverage selection.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Use `multiplier` when volatility is strictly below `below`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeverageRule {
    pub below: f64,
    pub multiplier: Decimal,
}

impl LeverageRule {
    pub fn new(below: f64, multiplier: Decimal) -> Self {
        Self { below, multiplier }
    }
}

/// Ordered leverage rules plus the conservative baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct LeverageTable {
    rules: Vec<LeverageRule>,
    baseline: Decimal,
}

impl LeverageTable {
    /// Build a table, ordering rules from the most restrictive threshold
    /// (lowest volatility bound) to the least restrictive.
    pub fn new(mut rules: Vec<LeverageRule>, baseline: Decimal) -> Result<Self, EngineError> {
        if let Some(bad) = rules.iter().find(|r| !r.below.is_finite()) {
            return Err(EngineError::Config(format!(
                "leverage threshold must be finite, got {}",
                bad.below
            )));
        }
        if let Some(bad) = rules.iter().find(|r| r.multiplier <= Decimal::ZERO) {
            return Err(EngineError::Config(format!(
                "leverage multiplier must be positive, got {}",
                bad.multiplier
            )));
        }

        rules.sort_by(|a, b| a.below.total_cmp(&b.below));
        if rules.windows(2).any(|w| w[0].below == w[1].below) {
            return Err(EngineError::Config("duplicate leverage thresholds".into()));
        }

        Ok(Self { rules, baseline })
    }
}

/// Maps the volatility indicator to a leverage multiplier.
#[derive(Debug, Clone)]
pub struct LeverageSelector {
    table: LeverageTable,
}

impl LeverageSelector {
    pub fn new(table: LeverageTable) -> Self {
        Self { table }
    }

    /// First rule whose threshold the volatility is below wins; a missing
    /// or non-finite reading gets the baseline.
    pub fn select(&self, volatility: Option<f64>) -> Decimal {
        let Some(vol) = volatility.filter(|v| v.is_finite()) else {
            return self.table.baseline;
        };

        self.table
            .rules
            .iter()
            .find(|rule| vol < rule.below)
            .map(|rule| rule.multiplier)
            .unwrap_or(self.table.baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn selector() -> LeverageSelector {
        // Deliberately unsorted: the table orders itself
        let rules = vec![
            LeverageRule::new(14.0, dec!(3.25)),
            LeverageRule::new(12.0, dec!(3.75)),
            LeverageRule::new(13.0, dec!(3.5)),
        ];
        LeverageSelector::new(LeverageTable::new(rules, dec!(3.0)).unwrap())
    }

    #[test]
    fn test_select_by_threshold() {
        let s = selector();
        assert_eq!(s.select(Some(11.2)), dec!(3.75));
        assert_eq!(s.select(Some(12.0)), dec!(3.5));
        assert_eq!(s.select(Some(13.9)), dec!(3.25));
        assert_eq!(s.select(Some(14.0)), dec!(3.0));
        assert_eq!(s.select(Some(32.5)), dec!(3.0));
    }

    #[test]
    fn test_unavailable_volatility_gets_baseline() {
        let s = selector();
        assert_eq!(s.select(None), dec!(3.0));
        assert_eq!(s.select(Some(f64::NAN)), dec!(3.0));
        // Same answer every time
        assert_eq!(s.select(None), s.select(None));
    }

    #[test]
    fn test_rejects_bad_rules() {
        assert!(LeverageTable::new(vec![LeverageRule::new(12.0, dec!(0))], dec!(3.0)).is_err());
        assert!(LeverageTable::new(
            vec![LeverageRule::new(12.0, dec!(3)), LeverageRule::new(12.0, dec!(4))],
            dec!(3.0)
        )
        .is_err());
    }
}
