//! Structured engine events.
//!
//! Every state transition emits one event. Events are logged through
//! `tracing` when emitted and buffered until the runner appends them to the
//! audit journal.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::api::OrderSide;
use crate::trading::Signal;

/// Checkpoints that can be deferred and retried on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checkpoint {
    Open,
    Entry,
    Close,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkpoint::Open => write!(f, "open"),
            Checkpoint::Entry => write!(f, "entry"),
            Checkpoint::Close => write!(f, "close"),
        }
    }
}

/// Why a position was flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    BearSignal,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Connected {
        broker: String,
    },
    Disconnected {
        reason: String,
    },
    Reconnected {
        broker: String,
    },
    SessionOpened {
        date: NaiveDate,
        equity: Decimal,
    },
    SignalComputed {
        date: NaiveDate,
        close: f64,
        fast: f64,
        slow: f64,
        signal: Signal,
        previous: Option<Signal>,
        flipped: bool,
    },
    EntryExecuted {
        order_id: String,
        price: f64,
        shares: u64,
        leverage: Decimal,
        equity: Decimal,
        volatility: Option<f64>,
    },
    StopTriggered {
        equity: Decimal,
        day_start: Decimal,
        drawdown: Decimal,
    },
    ExitExecuted {
        reason: ExitReason,
        order_id: String,
        shares: u64,
        price: Option<f64>,
    },
    PositionReconciled {
        local: i64,
        broker: i64,
    },
    OrderRejected {
        side: OrderSide,
        shares: u64,
        reason: String,
    },
    CheckpointDeferred {
        checkpoint: Checkpoint,
        reason: String,
    },
    Halted {
        reason: String,
    },
    Shutdown {
        shares: u64,
        entry_price: Option<Decimal>,
    },
}

impl EventKind {
    /// Journal label.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Connected { .. } => "connected",
            EventKind::Disconnected { .. } => "disconnected",
            EventKind::Reconnected { .. } => "reconnected",
            EventKind::SessionOpened { .. } => "session_opened",
            EventKind::SignalComputed { .. } => "signal_computed",
            EventKind::EntryExecuted { .. } => "entry_executed",
            EventKind::StopTriggered { .. } => "stop_triggered",
            EventKind::ExitExecuted { .. } => "exit_executed",
            EventKind::PositionReconciled { .. } => "position_reconciled",
            EventKind::OrderRejected { .. } => "order_rejected",
            EventKind::CheckpointDeferred { .. } => "checkpoint_deferred",
            EventKind::Halted { .. } => "halted",
            EventKind::Shutdown { .. } => "shutdown",
        }
    }
}

/// A timestamped engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EngineEvent {
    pub fn new(timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self { timestamp, kind }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Write the event to the log at a level matching its severity.
    pub fn log(&self) {
        match &self.kind {
            EventKind::Connected { broker } => info!(broker = %broker, "Connected to broker"),
            EventKind::Disconnected { reason } => warn!(reason = %reason, "Broker connection lost"),
            EventKind::Reconnected { broker } => info!(broker = %broker, "Reconnected to broker"),
            EventKind::SessionOpened { date, equity } => {
                info!(date = %date, equity = %equity, "Session opened")
            }
            EventKind::SignalComputed {
                date,
                close,
                fast,
                slow,
                signal,
                previous,
                flipped,
            } => {
                if *flipped {
                    info!(
                        date = %date,
                        from = ?previous,
                        to = %signal,
                        "Signal change"
                    );
                }
                info!(
                    date = %date,
                    close = close,
                    fast_ema = format!("{:.4}", fast),
                    slow_ema = format!("{:.4}", slow),
                    signal = %signal,
                    "Signal computed"
                );
            }
            EventKind::EntryExecuted {
                order_id,
                price,
                shares,
                leverage,
                equity,
                volatility,
            } => info!(
                order_id = %order_id,
                shares = shares,
                price = price,
                leverage = %leverage,
                equity = %equity,
                volatility = ?volatility,
                "Entered position"
            ),
            EventKind::StopTriggered {
                equity,
                day_start,
                drawdown,
            } => warn!(
                equity = %equity,
                day_start = %day_start,
                drawdown_pct = %(drawdown * Decimal::ONE_HUNDRED).round_dp(2),
                "Stop triggered"
            ),
            EventKind::ExitExecuted {
                reason,
                order_id,
                shares,
                price,
            } => info!(
                reason = ?reason,
                order_id = %order_id,
                shares = shares,
                price = ?price,
                "Exited position"
            ),
            EventKind::PositionReconciled { local, broker } => {
                if local == broker {
                    info!(shares = broker, "Position verified against broker");
                } else {
                    warn!(local = local, broker = broker, "Position reconciled to broker");
                }
            }
            EventKind::OrderRejected {
                side,
                shares,
                reason,
            } => warn!(side = side.as_str(), shares = shares, reason = %reason, "Order rejected"),
            EventKind::CheckpointDeferred { checkpoint, reason } => {
                warn!(checkpoint = %checkpoint, reason = %reason, "Checkpoint deferred")
            }
            EventKind::Halted { reason } => error!(reason = %reason, "Session loop halted"),
            EventKind::Shutdown {
                shares,
                entry_price,
            } => info!(
                shares = shares,
                entry_price = ?entry_price,
                "Shutting down; open position left in place"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_json_is_tagged() {
        let event = EngineEvent::new(
            Utc::now(),
            EventKind::StopTriggered {
                equity: dec!(293500),
                day_start: dec!(300000),
                drawdown: dec!(-0.021666),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "stop_triggered");
        assert_eq!(json["equity"], "293500");
        assert_eq!(event.name(), "stop_triggered");
    }

    #[test]
    fn test_signal_event_round_trips() {
        let event = EngineEvent::new(
            Utc::now(),
            EventKind::SignalComputed {
                date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
                close: 281.5,
                fast: 280.0,
                slow: 270.0,
                signal: Signal::Bull,
                previous: Some(Signal::Bear),
                flipped: true,
            },
        );
        let raw = serde_json::to_string(&event).unwrap();
        let back: EngineEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, event);
    }
}
