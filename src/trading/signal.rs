//! EMA crossover regime signal.
//!
//! Two exponential moving averages of the daily close, updated together
//! once per session:
//!
//!   ema_today = alpha * close + (1 - alpha) * ema_yesterday,  alpha = 2 / (N + 1)
//!
//! The regime is BULL only while the fast average is strictly above the
//! slow one. Equality is BEAR.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ensure_finite, EngineError};
use crate::models::PriceBar;

/// Binary market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Bull,
    Bear,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Bull => "BULL",
            Signal::Bear => "BEAR",
        }
    }

    pub fn from_emas(fast: f64, slow: f64) -> Self {
        if fast > slow {
            Signal::Bull
        } else {
            Signal::Bear
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Moving-average state owned by the signal engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub fast_value: f64,
    pub slow_value: f64,
    pub period_fast: u32,
    pub period_slow: u32,
    pub initialized: bool,
    /// Session date of the last close applied
    pub last_date: Option<NaiveDate>,
}

impl EmaState {
    pub fn new(period_fast: u32, period_slow: u32) -> Self {
        Self {
            fast_value: 0.0,
            slow_value: 0.0,
            period_fast,
            period_slow,
            initialized: false,
            last_date: None,
        }
    }

    /// Regime derived from the current averages; `None` before the first close.
    pub fn signal(&self) -> Option<Signal> {
        self.initialized
            .then(|| Signal::from_emas(self.fast_value, self.slow_value))
    }
}

fn alpha(period: u32) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Maintains the fast/slow EMAs and derives the regime.
#[derive(Debug, Clone)]
pub struct SignalEngine {
    state: EmaState,
}

impl SignalEngine {
    pub fn new(period_fast: u32, period_slow: u32) -> Self {
        Self {
            state: EmaState::new(period_fast, period_slow),
        }
    }

    /// Resume from a persisted snapshot. Rejected if the periods differ or
    /// the values are not finite.
    pub fn restore(state: EmaState, period_fast: u32, period_slow: u32) -> Option<Self> {
        let usable = state.period_fast == period_fast
            && state.period_slow == period_slow
            && state.initialized
            && state.fast_value.is_finite()
            && state.slow_value.is_finite();
        usable.then_some(Self { state })
    }

    /// Apply historical closes in chronological order.
    ///
    /// Bars with non-finite closes and bars already covered are skipped.
    /// Returns the number of bars applied.
    pub fn bootstrap(&mut self, bars: &[PriceBar]) -> usize {
        let mut ordered: Vec<&PriceBar> = bars.iter().collect();
        ordered.sort_by_key(|b| b.date);

        let mut applied = 0;
        for bar in ordered {
            if self.is_replay(bar.date) {
                continue;
            }
            match self.update(bar) {
                Ok(_) => applied += 1,
                Err(e) => debug!(date = %bar.date, error = %e, "Skipping bootstrap bar"),
            }
        }
        applied
    }

    /// Feed one session close.
    ///
    /// A non-finite close is rejected and leaves the state unchanged. A bar
    /// dated on or before the last applied close is a replay: the state is
    /// left unchanged and the current signal is returned.
    pub fn update(&mut self, bar: &PriceBar) -> Result<Signal, EngineError> {
        let close = ensure_finite("close", bar.close)?;
        if close <= 0.0 {
            return Err(EngineError::InvalidNumeric {
                field: "close",
                value: close,
            });
        }

        if self.is_replay(bar.date) {
            debug!(date = %bar.date, "Close already applied, ignoring replay");
            return Ok(self.signal().unwrap_or(Signal::Bear));
        }

        let (fast, slow) = if self.state.initialized {
            let a_fast = alpha(self.state.period_fast);
            let a_slow = alpha(self.state.period_slow);
            (
                a_fast * close + (1.0 - a_fast) * self.state.fast_value,
                a_slow * close + (1.0 - a_slow) * self.state.slow_value,
            )
        } else {
            (close, close)
        };

        // Both averages move together or not at all
        ensure_finite("fast_ema", fast)?;
        ensure_finite("slow_ema", slow)?;
        self.state.fast_value = fast;
        self.state.slow_value = slow;
        self.state.initialized = true;
        self.state.last_date = Some(bar.date);

        Ok(Signal::from_emas(fast, slow))
    }

    /// Whether a close for `date` would be a replay.
    pub fn is_replay(&self, date: NaiveDate) -> bool {
        self.state.last_date.is_some_and(|last| date <= last)
    }

    pub fn signal(&self) -> Option<Signal> {
        self.state.signal()
    }

    /// Read-only snapshot.
    pub fn state(&self) -> &EmaState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Days::new(n as u64)
    }

    fn bars(closes: &[f64]) -> Vec<PriceBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar::new(day(i as u32), c))
            .collect()
    }

    #[test]
    fn test_cold_start_seeds_both_and_ties_bear() {
        let mut engine = SignalEngine::new(25, 125);
        assert_eq!(engine.signal(), None);

        let signal = engine.update(&PriceBar::new(day(0), 250.0)).unwrap();
        assert_eq!(engine.state().fast_value, 250.0);
        assert_eq!(engine.state().slow_value, 250.0);
        // Equal averages are BEAR
        assert_eq!(signal, Signal::Bear);
    }

    #[test]
    fn test_recurrence() {
        let mut engine = SignalEngine::new(3, 7);
        engine.update(&PriceBar::new(day(0), 100.0)).unwrap();
        let signal = engine.update(&PriceBar::new(day(1), 110.0)).unwrap();

        // alpha_fast = 0.5, alpha_slow = 0.25
        assert!((engine.state().fast_value - 105.0).abs() < 1e-12);
        assert!((engine.state().slow_value - 102.5).abs() < 1e-12);
        assert_eq!(signal, Signal::Bull);
    }

    #[test]
    fn test_signal_tracks_strict_comparison() {
        let mut engine = SignalEngine::new(5, 20);
        let closes = [
            100.0, 102.0, 101.0, 99.0, 95.0, 94.0, 97.0, 103.0, 108.0, 104.0, 98.0, 92.0, 90.0,
        ];
        for bar in bars(&closes) {
            let signal = engine.update(&bar).unwrap();
            let s = engine.state();
            assert_eq!(signal == Signal::Bull, s.fast_value > s.slow_value);
        }
    }

    #[test]
    fn test_replay_does_not_change_state() {
        let mut engine = SignalEngine::new(25, 125);
        engine.bootstrap(&bars(&[100.0, 101.0, 102.0]));
        let before = engine.state().clone();

        let replay = PriceBar::new(day(2), 150.0);
        engine.update(&replay).unwrap();
        engine.update(&replay).unwrap();
        assert_eq!(engine.state(), &before);
    }

    #[test]
    fn test_invalid_close_keeps_state() {
        let mut engine = SignalEngine::new(25, 125);
        engine.update(&PriceBar::new(day(0), 100.0)).unwrap();
        let before = engine.state().clone();

        let err = engine.update(&PriceBar::new(day(1), f64::NAN)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidNumeric { .. }));
        assert!(engine.update(&PriceBar::new(day(1), -1.0)).is_err());
        assert_eq!(engine.state(), &before);

        // The same date can still be applied once a valid price arrives
        engine.update(&PriceBar::new(day(1), 101.0)).unwrap();
        assert_eq!(engine.state().last_date, Some(day(1)));
    }

    #[test]
    fn test_bootstrap_orders_chronologically() {
        let mut sorted = SignalEngine::new(3, 7);
        sorted.bootstrap(&bars(&[100.0, 105.0, 98.0, 120.0]));

        let mut shuffled = SignalEngine::new(3, 7);
        let mut input = bars(&[100.0, 105.0, 98.0, 120.0]);
        input.reverse();
        input.push(PriceBar::new(day(9), f64::NAN));
        let applied = shuffled.bootstrap(&input);

        assert_eq!(applied, 4);
        assert_eq!(sorted.state(), shuffled.state());
    }

    #[test]
    fn test_restore_checks_periods() {
        let mut engine = SignalEngine::new(25, 125);
        engine.update(&PriceBar::new(day(0), 100.0)).unwrap();
        let snapshot = engine.state().clone();

        assert!(SignalEngine::restore(snapshot.clone(), 25, 125).is_some());
        assert!(SignalEngine::restore(snapshot, 20, 100).is_none());
    }
}
