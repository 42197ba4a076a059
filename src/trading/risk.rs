//! Intraday stop-loss detection against the session's starting equity.

use rust_decimal::Decimal;
use tracing::warn;

use crate::models::SessionState;

/// Outcome of a stop-loss check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskCheck {
    /// Within limits
    Ok,
    /// Drawdown reached the stop
    Breach { drawdown: Decimal },
    /// No baseline recorded yet this session
    NoBaseline,
}

/// Detects stop-loss breaches. Exiting is the scheduler's job.
#[derive(Debug, Clone)]
pub struct RiskMonitor {
    stop_loss_fraction: Decimal,
}

impl RiskMonitor {
    pub fn new(stop_loss_fraction: Decimal) -> Self {
        Self { stop_loss_fraction }
    }

    /// Breach when (equity - start) / start <= -stop_loss_fraction.
    ///
    /// The boundary is inclusive. A breach marks the session so re-entry
    /// policy can consult it without replaying the equity curve.
    pub fn check(&self, current_equity: Decimal, session: &mut SessionState) -> RiskCheck {
        let Some(drawdown) = session.drawdown(current_equity) else {
            return RiskCheck::NoBaseline;
        };

        if drawdown <= -self.stop_loss_fraction {
            if !session.stop_triggered_today {
                warn!(
                    date = %session.date,
                    equity = %current_equity,
                    drawdown_pct = %(drawdown * Decimal::ONE_HUNDRED).round_dp(2),
                    "Stop-loss breached"
                );
            }
            session.stop_triggered_today = true;
            return RiskCheck::Breach { drawdown };
        }

        RiskCheck::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn session(start: Decimal) -> SessionState {
        let mut s = SessionState::new(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        s.set_baseline(start);
        s
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let monitor = RiskMonitor::new(dec!(0.02));

        let mut s = session(dec!(100000));
        assert_eq!(monitor.check(dec!(98001), &mut s), RiskCheck::Ok);
        assert!(!s.stop_triggered_today);

        assert!(matches!(
            monitor.check(dec!(98000), &mut s),
            RiskCheck::Breach { .. }
        ));
        assert!(s.stop_triggered_today);

        let mut s = session(dec!(100000));
        assert!(matches!(
            monitor.check(dec!(97999), &mut s),
            RiskCheck::Breach { .. }
        ));
    }

    #[test]
    fn test_no_baseline_never_breaches() {
        let monitor = RiskMonitor::new(dec!(0.02));
        let mut s = SessionState::new(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(monitor.check(dec!(1), &mut s), RiskCheck::NoBaseline);
        assert!(!s.stop_triggered_today);
    }

    #[test]
    fn test_scenario_drawdown() {
        let monitor = RiskMonitor::new(dec!(0.02));
        let mut s = session(dec!(300000));
        match monitor.check(dec!(293500), &mut s) {
            RiskCheck::Breach { drawdown } => {
                assert!(drawdown < dec!(-0.0216) && drawdown > dec!(-0.0217));
            }
            other => panic!("expected breach, got {:?}", other),
        }
    }
}
