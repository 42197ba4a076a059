//! Daily session state machine.
//!
//! One `tick` runs per poll interval. A tick rolls the session over at
//! midnight exchange time, reconciles with the broker after a reconnect,
//! then walks the checkpoints in order: session open, risk poll, pre-close
//! entry, close. Each checkpoint fires at most once per session. A
//! checkpoint that fails is left pending and retried on the next tick.

mod clock;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{Broker, BrokerPosition, MarketData, OrderAck, OrderRequest, OrderSide};
use crate::error::{ensure_finite, EngineError};
use crate::events::{Checkpoint, EngineEvent, EventKind, ExitReason};
use crate::models::{Position, PriceBar, SessionState};
use crate::retry::RetryPolicy;
use crate::trading::{
    EmaState, LeverageSelector, LeverageTable, PositionSizer, RiskCheck, RiskMonitor, RunMode,
    Signal, SignalEngine, TradingConfig,
};

#[cfg(test)]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};

/// Where the scheduler is within the trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingOpen,
    OpenNoPosition,
    PositionOpen,
    StoppedOut,
    ClosedForDay,
}

/// How the averages were initialized at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapSource {
    /// Replayed this many historical closes
    History(usize),
    /// Restored the persisted snapshot
    Snapshot,
    /// No history; seeded by the first session close
    Cold,
}

/// Connection state observed while a broker call was retried.
#[derive(Default)]
struct LinkWatch {
    lost: AtomicBool,
    reconnected: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl LinkWatch {
    fn note_loss(&self, reason: &str) {
        self.lost.store(true, Ordering::SeqCst);
        self.reconnected.store(false, Ordering::SeqCst);
        let mut first = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        first.get_or_insert_with(|| reason.to_string());
    }
}

/// Sequences signal, sizing and risk decisions over the trading day.
pub struct SessionScheduler {
    config: TradingConfig,
    tz: Tz,
    broker: Arc<dyn Broker>,
    market: Arc<dyn MarketData>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,

    signal: SignalEngine,
    leverage: LeverageSelector,
    sizer: PositionSizer,
    risk: RiskMonitor,

    session: Option<SessionState>,
    phase: Phase,
    position: Option<Position>,

    /// A stop fired and its exit is not yet confirmed. Survives rollover.
    stop_exit_pending: bool,
    /// Per-process tag in client order ids
    run_id: String,
    /// Attempt number per order intent; bumped once an outcome is known
    order_seq: HashMap<&'static str, u32>,

    needs_reconcile: bool,
    halted: bool,
    deferred: HashSet<Checkpoint>,
    events: Vec<EngineEvent>,
}

impl SessionScheduler {
    pub fn new(
        config: TradingConfig,
        broker: Arc<dyn Broker>,
        market: Arc<dyn MarketData>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let tz = config.timezone()?;
        let table = LeverageTable::new(config.leverage_table.clone(), config.baseline_leverage)?;

        Ok(Self {
            tz,
            broker,
            market,
            clock,
            retry: config.retry_policy(),
            signal: SignalEngine::new(config.fast_period, config.slow_period),
            leverage: LeverageSelector::new(table),
            sizer: PositionSizer::new(),
            risk: RiskMonitor::new(config.stop_loss_fraction),
            session: None,
            phase: Phase::AwaitingOpen,
            position: None,
            stop_exit_pending: false,
            run_id: Uuid::new_v4().simple().to_string().chars().take(8).collect(),
            order_seq: HashMap::new(),
            needs_reconcile: true,
            halted: false,
            deferred: HashSet::new(),
            events: Vec::new(),
            config,
        })
    }

    /// Replace the retry policy built from the configuration.
    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn ema_state(&self) -> &EmaState {
        self.signal.state()
    }

    pub fn signal(&self) -> Option<Signal> {
        self.signal.signal()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Take the events emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, kind: EventKind) {
        let event = EngineEvent::new(self.clock.now(), kind);
        event.log();
        self.events.push(event);
    }

    // ==================== Lifecycle ====================

    /// Connect to the broker and adopt whatever position it reports.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.retry.run("connect", || self.broker.connect()).await?;
        let broker = self.broker.name().to_string();
        self.emit(EventKind::Connected { broker });
        self.reconcile(true).await
    }

    /// Initialize the averages from daily closes before today, falling back
    /// to `snapshot` and then to a cold start.
    pub async fn bootstrap(&mut self, snapshot: Option<EmaState>) -> BootstrapSource {
        let today = self.clock.now().with_timezone(&self.tz).date_naive();
        let start = today - Duration::days(i64::from(self.config.bootstrap_lookback_days));
        let end = today.pred_opt().unwrap_or(today);

        let history = self
            .retry
            .run("get_daily_closes", || {
                self.market.get_daily_closes(&self.config.symbol, start, end)
            })
            .await;

        match history {
            Ok(bars) if !bars.is_empty() => {
                let mut engine = SignalEngine::new(self.config.fast_period, self.config.slow_period);
                let applied = engine.bootstrap(&bars);
                if applied > 0 {
                    self.signal = engine;
                    info!(
                        bars = applied,
                        signal = ?self.signal.signal(),
                        "Bootstrapped averages from history"
                    );
                    return BootstrapSource::History(applied);
                }
                warn!("History contained no usable closes");
            }
            Ok(_) => warn!(start = %start, end = %end, "No history returned for bootstrap"),
            Err(e) => warn!(error = %e, "History unavailable for bootstrap"),
        }

        let restored = snapshot.and_then(|state| {
            SignalEngine::restore(state, self.config.fast_period, self.config.slow_period)
        });
        match restored {
            Some(engine) => {
                self.signal = engine;
                info!(
                    last_date = ?self.signal.state().last_date,
                    signal = ?self.signal.signal(),
                    "Restored averages from snapshot"
                );
                BootstrapSource::Snapshot
            }
            None => {
                warn!("Cold start: averages seed from the first session close");
                BootstrapSource::Cold
            }
        }
    }

    /// Record the shutdown and disconnect. The position is left open.
    pub async fn shutdown(&mut self) {
        let shares = self.position.as_ref().map_or(0, |p| p.shares);
        let entry_price = self.position.as_ref().map(|p| p.entry_price);
        self.emit(EventKind::Shutdown {
            shares,
            entry_price,
        });

        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "Broker disconnect failed");
        }
    }

    // ==================== Tick ====================

    /// Run one pass over the session's checkpoints.
    ///
    /// Returns an error only when the loop must halt. Transient failures
    /// leave checkpoints pending for the next tick.
    pub async fn tick(&mut self) -> Result<(), EngineError> {
        if self.halted {
            debug!("Scheduler halted, ignoring tick");
            return Ok(());
        }

        match self.run_tick().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                self.halted = true;
                self.emit(EventKind::Halted {
                    reason: e.to_string(),
                });
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Tick incomplete, retrying next poll");
                Ok(())
            }
        }
    }

    async fn run_tick(&mut self) -> Result<(), EngineError> {
        let local = self.clock.now().with_timezone(&self.tz);
        let (date, time) = (local.date_naive(), local.time());

        self.roll_session(date);
        self.reconcile_if_needed().await?;

        if !self.is_session_day(date) {
            return Ok(());
        }

        if self.open_due(time) {
            let result = self.open_session().await;
            self.settle(Checkpoint::Open, result)?;
        }
        self.reconcile_if_needed().await?;

        let polled = if self.stop_exit_pending {
            self.flatten(ExitReason::StopLoss).await
        } else if self.phase == Phase::PositionOpen {
            self.poll_risk().await
        } else {
            Ok(())
        };
        if let Err(e) = polled {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(error = %e, "Risk poll failed");
        }
        self.reconcile_if_needed().await?;

        if self.entry_due(time) {
            match self.phase {
                Phase::OpenNoPosition => {
                    let result = self.enter().await;
                    self.settle(Checkpoint::Entry, result)?;
                }
                Phase::PositionOpen => self.mark_done(Checkpoint::Entry),
                _ => {}
            }
        }
        self.reconcile_if_needed().await?;

        if self.close_due(time) {
            let result = self.close_session(date).await;
            self.settle(Checkpoint::Close, result)?;
        }

        Ok(())
    }

    fn roll_session(&mut self, date: NaiveDate) {
        if self.session.as_ref().is_some_and(|s| s.date == date) {
            return;
        }
        if let Some(previous) = &self.session {
            debug!(from = %previous.date, to = %date, "Session rollover");
        }

        let mut session = SessionState::new(date);
        session.position_open = self.position.is_some();
        self.session = Some(session);
        self.phase = Phase::AwaitingOpen;
        self.deferred.clear();
        self.order_seq.clear();
    }

    fn is_session_day(&self, date: NaiveDate) -> bool {
        match self.config.mode {
            RunMode::Test => true,
            RunMode::Scheduled => !matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
        }
    }

    fn open_due(&self, time: NaiveTime) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        !session.open_done
            && match self.config.mode {
                RunMode::Test => true,
                RunMode::Scheduled => {
                    time >= self.config.open_checkpoint_time
                        && time < self.config.close_checkpoint_time
                }
            }
    }

    fn entry_due(&self, time: NaiveTime) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        session.open_done
            && !session.entry_done
            && match self.config.mode {
                RunMode::Test => true,
                RunMode::Scheduled => {
                    time >= self.config.entry_checkpoint_time
                        && time < self.config.close_checkpoint_time
                }
            }
    }

    fn close_due(&self, time: NaiveTime) -> bool {
        self.session.as_ref().is_some_and(|s| !s.close_done)
            && time >= self.config.close_checkpoint_time
    }

    fn mark_done(&mut self, checkpoint: Checkpoint) {
        if let Some(session) = self.session.as_mut() {
            match checkpoint {
                Checkpoint::Open => session.open_done = true,
                Checkpoint::Entry => session.entry_done = true,
                Checkpoint::Close => session.close_done = true,
            }
        }
        self.deferred.remove(&checkpoint);
    }

    /// Turn a checkpoint failure into a deferral unless it is fatal.
    fn settle(
        &mut self,
        checkpoint: Checkpoint,
        result: Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                if self.deferred.insert(checkpoint) {
                    self.emit(EventKind::CheckpointDeferred {
                        checkpoint,
                        reason: e.to_string(),
                    });
                } else {
                    debug!(checkpoint = %checkpoint, error = %e, "Checkpoint still pending");
                }
                Ok(())
            }
        }
    }

    // ==================== Checkpoints ====================

    async fn open_session(&mut self) -> Result<(), EngineError> {
        let equity = self.account_equity().await?;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !session.set_baseline(equity) {
            return Ok(());
        }
        let date = session.date;

        self.phase = if self.position.is_some() {
            Phase::PositionOpen
        } else {
            Phase::OpenNoPosition
        };
        self.deferred.remove(&Checkpoint::Open);
        self.emit(EventKind::SessionOpened { date, equity });
        Ok(())
    }

    /// Stop-loss poll while a position is open. Only the first breach of a
    /// session forces a flatten.
    async fn poll_risk(&mut self) -> Result<(), EngineError> {
        let equity = self.account_equity().await?;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let already_stopped = session.stop_triggered_today;
        let check = self.risk.check(equity, session);
        let day_start = session.day_start_equity.unwrap_or_default();

        let RiskCheck::Breach { drawdown } = check else {
            return Ok(());
        };
        if already_stopped {
            return Ok(());
        }

        self.emit(EventKind::StopTriggered {
            equity,
            day_start,
            drawdown,
        });
        self.phase = Phase::StoppedOut;
        self.stop_exit_pending = true;
        self.flatten(ExitReason::StopLoss).await
    }

    async fn enter(&mut self) -> Result<(), EngineError> {
        let signal = self.signal.signal();
        if signal != Some(Signal::Bull) {
            info!(signal = ?signal, "No entry, regime is not BULL");
            self.mark_done(Checkpoint::Entry);
            return Ok(());
        }
        let stopped = self.session.as_ref().is_some_and(|s| s.stop_triggered_today);
        if stopped && !self.config.allow_reentry_after_stop {
            info!("Stop triggered this session and re-entry is disabled");
            self.mark_done(Checkpoint::Entry);
            return Ok(());
        }

        self.reconcile(false).await?;
        if self.position.is_some() {
            info!("Broker already holds the position, skipping entry");
            self.mark_done(Checkpoint::Entry);
            return Ok(());
        }

        let mark = self.mark_price().await?;
        let equity = self.account_equity().await?;
        let volatility = self.volatility().await;
        let leverage = self.leverage.select(volatility);
        let shares = self.sizer.size_from_mark(equity, leverage, mark);

        if shares == 0 {
            warn!(equity = %equity, leverage = %leverage, mark, "Position size is zero, skipping entry");
            self.mark_done(Checkpoint::Entry);
            return Ok(());
        }

        let order = self.order("entry", OrderSide::Buy, shares);
        let Some(ack) = self.submit(&order, "entry").await? else {
            if self.position.is_some() {
                self.mark_done(Checkpoint::Entry);
            }
            return Ok(());
        };

        let price = ack
            .filled_avg_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(mark);
        self.position = Some(Position::new(
            self.config.symbol.clone(),
            shares,
            Decimal::try_from(price).unwrap_or_default(),
            leverage,
            self.clock.now(),
        ));
        self.sync_phase();
        self.mark_done(Checkpoint::Entry);

        self.emit(EventKind::EntryExecuted {
            order_id: ack.order_id,
            price,
            shares,
            leverage,
            equity,
            volatility,
        });
        Ok(())
    }

    async fn close_session(&mut self, date: NaiveDate) -> Result<(), EngineError> {
        if self.stop_exit_pending && self.position.is_some() {
            return Err(EngineError::OrderRejected(
                "stop-loss exit not confirmed".into(),
            ));
        }

        if self.signal.is_replay(date) {
            debug!(date = %date, "Close already applied for this session");
        } else {
            let close = self.session_close(date).await?;
            let previous = self.signal.signal();
            let signal = self.signal.update(&PriceBar::new(date, close))?;
            let state = self.signal.state();
            let (fast, slow) = (state.fast_value, state.slow_value);

            self.emit(EventKind::SignalComputed {
                date,
                close,
                fast,
                slow,
                signal,
                previous,
                flipped: previous.is_some_and(|p| p != signal),
            });
        }

        if self.position.is_some() && self.signal.signal() == Some(Signal::Bear) {
            self.flatten(ExitReason::BearSignal).await?;
            if self.position.is_some() {
                // Exit not confirmed; retry next tick
                return Ok(());
            }
        }

        self.mark_done(Checkpoint::Close);
        self.phase = Phase::ClosedForDay;
        Ok(())
    }

    /// Sell the whole position after verifying it with the broker.
    async fn flatten(&mut self, reason: ExitReason) -> Result<(), EngineError> {
        self.reconcile(false).await?;
        let Some(shares) = self.position.as_ref().map(|p| p.shares) else {
            self.sync_phase();
            return Ok(());
        };

        let intent = match reason {
            ExitReason::StopLoss => "stop",
            ExitReason::BearSignal => "bear",
        };
        let order = self.order(intent, OrderSide::Sell, shares);
        let Some(ack) = self.submit(&order, intent).await? else {
            return Ok(());
        };

        self.position = None;
        self.sync_phase();
        self.emit(EventKind::ExitExecuted {
            reason,
            order_id: ack.order_id,
            shares,
            price: ack.filled_avg_price,
        });
        Ok(())
    }

    // ==================== Broker and data access ====================

    /// Order for `intent` keyed `{symbol}-{date}-{intent}-{attempt}-{run}`.
    /// The attempt number only moves once the broker has answered, so a
    /// resubmission after a lost ack carries the same id.
    fn order(&self, intent: &'static str, side: OrderSide, shares: u64) -> OrderRequest {
        let date = self
            .session
            .as_ref()
            .map(|s| s.date.format("%Y%m%d").to_string())
            .unwrap_or_default();
        let attempt = self.order_seq.get(intent).copied().unwrap_or(0);
        let client_order_id = format!(
            "{}-{}-{}-{}-{}",
            self.config.symbol, date, intent, attempt, self.run_id
        );
        OrderRequest::market(client_order_id, &self.config.symbol, side, shares)
    }

    /// Submit once. Orders are never retried blindly: a rejection
    /// re-verifies the position, a lost link forces a reconcile.
    async fn submit(
        &mut self,
        order: &OrderRequest,
        intent: &'static str,
    ) -> Result<Option<OrderAck>, EngineError> {
        info!(
            side = order.side.as_str(),
            shares = order.shares,
            client_order_id = %order.client_order_id,
            "Submitting order"
        );

        match self.broker.submit_order(order).await {
            Ok(ack) => {
                *self.order_seq.entry(intent).or_default() += 1;
                Ok(Some(ack))
            }
            Err(EngineError::OrderRejected(reason)) => {
                *self.order_seq.entry(intent).or_default() += 1;
                self.emit(EventKind::OrderRejected {
                    side: order.side,
                    shares: order.shares,
                    reason,
                });
                self.reconcile(false).await?;
                Ok(None)
            }
            Err(EngineError::ConnectionLost(reason)) => {
                self.emit(EventKind::Disconnected {
                    reason: reason.clone(),
                });
                self.needs_reconcile = true;
                Err(EngineError::ConnectionLost(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Run a broker call under the retry policy, reconnecting before each
    /// retry that follows a lost connection.
    async fn broker_call<T, F, Fut>(&mut self, operation: &str, op: F) -> Result<T, EngineError>
    where
        F: Fn(Arc<dyn Broker>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let watch = LinkWatch::default();
        let result = self
            .retry
            .run(operation, || {
                let broker = self.broker.clone();
                let call = op(broker.clone());
                let watch = &watch;
                async move {
                    if watch.lost.load(Ordering::SeqCst) {
                        broker.connect().await?;
                        watch.reconnected.store(true, Ordering::SeqCst);
                    }
                    let result = call.await;
                    if let Err(EngineError::ConnectionLost(reason)) = &result {
                        watch.note_loss(reason);
                    }
                    result
                }
            })
            .await;

        if watch.lost.load(Ordering::SeqCst) {
            let reason = watch
                .reason
                .into_inner()
                .unwrap_or_else(|e| e.into_inner())
                .unwrap_or_default();
            self.emit(EventKind::Disconnected { reason });
            self.needs_reconcile = true;

            if watch.reconnected.load(Ordering::SeqCst) {
                let broker = self.broker.name().to_string();
                self.emit(EventKind::Reconnected { broker });
            }
        }
        result
    }

    async fn account_equity(&mut self) -> Result<Decimal, EngineError> {
        let equity = self
            .broker_call("get_account_equity", |b| async move {
                b.get_account_equity().await
            })
            .await?;
        to_decimal("equity", equity)
    }

    async fn mark_price(&mut self) -> Result<f64, EngineError> {
        let symbol = self.config.symbol.clone();
        let mark = self
            .broker_call("get_mark_price", move |b| {
                let symbol = symbol.clone();
                async move { b.get_mark_price(&symbol).await }
            })
            .await?;

        let mark = ensure_finite("mark_price", mark)?;
        if mark <= 0.0 {
            return Err(EngineError::InvalidNumeric {
                field: "mark_price",
                value: mark,
            });
        }
        Ok(mark)
    }

    async fn fetch_position(&mut self) -> Result<Option<BrokerPosition>, EngineError> {
        let symbol = self.config.symbol.clone();
        self.broker_call("get_current_position", move |b| {
            let symbol = symbol.clone();
            async move { b.get_current_position(&symbol).await }
        })
        .await
    }

    /// Volatility reading; any failure degrades to the baseline leverage.
    async fn volatility(&self) -> Option<f64> {
        let reading = self
            .retry
            .run("get_volatility_indicator", || {
                self.market.get_volatility_indicator()
            })
            .await;

        match reading {
            Ok(value) => value.filter(|v| v.is_finite()),
            Err(e) => {
                warn!(error = %e, "Volatility unavailable, using baseline leverage");
                None
            }
        }
    }

    /// Official session close, or the broker's mark when the feed has none.
    async fn session_close(&mut self, date: NaiveDate) -> Result<f64, EngineError> {
        let from_feed = self
            .retry
            .run("get_closing_price", || {
                self.market.get_closing_price(&self.config.symbol, date)
            })
            .await;

        match from_feed {
            Ok(close) => Ok(close),
            Err(e) => {
                warn!(date = %date, error = %e, "Closing price unavailable, using broker mark");
                self.mark_price().await
            }
        }
    }

    // ==================== Reconciliation ====================

    async fn reconcile_if_needed(&mut self) -> Result<(), EngineError> {
        if self.needs_reconcile {
            self.reconcile(true).await?;
        }
        Ok(())
    }

    /// Make the local position match the broker's. The broker wins.
    ///
    /// With `always_report` false, an event is only emitted on mismatch.
    async fn reconcile(&mut self, always_report: bool) -> Result<(), EngineError> {
        let reported = self.fetch_position().await?;
        self.needs_reconcile = false;

        let local = self.position.as_ref().map_or(0, |p| p.shares as i64);
        let broker = reported.as_ref().map_or(0, |p| p.shares);

        if broker < 0 {
            let mismatch = EngineError::PositionMismatch { local, broker };
            warn!(error = %mismatch, "Broker reports a short position, not adopting it");
            self.position = None;
        } else if broker == 0 {
            self.position = None;
        } else if broker != local {
            let avg_price = reported
                .as_ref()
                .and_then(|p| Decimal::try_from(p.avg_price).ok())
                .unwrap_or_default();
            self.position = Some(Position::adopted(
                self.config.symbol.clone(),
                broker as u64,
                avg_price,
                self.clock.now(),
            ));
        }
        self.sync_phase();

        if always_report || local != broker {
            self.emit(EventKind::PositionReconciled { local, broker });
        }
        Ok(())
    }

    fn sync_phase(&mut self) {
        let holding = self.position.is_some();
        if !holding {
            self.stop_exit_pending = false;
        }
        if let Some(session) = self.session.as_mut() {
            session.position_open = holding;
        }
        self.phase = match (self.phase, holding) {
            (Phase::OpenNoPosition, true) => Phase::PositionOpen,
            (Phase::PositionOpen | Phase::StoppedOut, false) => Phase::OpenNoPosition,
            (phase, _) => phase,
        };
    }
}

fn to_decimal(field: &'static str, value: f64) -> Result<Decimal, EngineError> {
    let value = ensure_finite(field, value)?;
    Decimal::try_from(value).map_err(|_| EngineError::InvalidNumeric { field, value })
}
