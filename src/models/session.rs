//! Day-scoped session state.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// State for one trading session, created at day rollover.
///
/// The equity baseline is written once, at the session-open checkpoint,
/// before any stop-loss evaluation for that date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Exchange-local session date
    pub date: NaiveDate,

    /// Equity at the session-open checkpoint
    pub day_start_equity: Option<Decimal>,

    /// Whether a position was held when last observed
    pub position_open: bool,

    /// Set by the risk monitor when the stop fired this session
    pub stop_triggered_today: bool,

    /// Session-open checkpoint completed
    pub open_done: bool,

    /// Pre-close entry checkpoint completed
    pub entry_done: bool,

    /// Close checkpoint completed
    pub close_done: bool,
}

impl SessionState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            day_start_equity: None,
            position_open: false,
            stop_triggered_today: false,
            open_done: false,
            entry_done: false,
            close_done: false,
        }
    }

    /// Record the equity baseline. Returns `false` if it was already set.
    pub fn set_baseline(&mut self, equity: Decimal) -> bool {
        if self.day_start_equity.is_some() {
            return false;
        }
        self.day_start_equity = Some(equity);
        self.stop_triggered_today = false;
        self.open_done = true;
        true
    }

    /// Intraday return relative to the baseline.
    pub fn drawdown(&self, equity: Decimal) -> Option<Decimal> {
        let start = self.day_start_equity?;
        if start <= Decimal::ZERO {
            return None;
        }
        Some((equity - start) / start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    #[test]
    fn test_baseline_set_once() {
        let mut session = SessionState::new(date());
        assert!(session.set_baseline(dec!(300000)));
        assert!(!session.set_baseline(dec!(250000)));
        assert_eq!(session.day_start_equity, Some(dec!(300000)));
        assert!(session.open_done);
    }

    #[test]
    fn test_drawdown() {
        let mut session = SessionState::new(date());
        assert_eq!(session.drawdown(dec!(99000)), None);

        session.set_baseline(dec!(100000));
        assert_eq!(session.drawdown(dec!(98000)), Some(dec!(-0.02)));
    }
}
