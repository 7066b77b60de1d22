//! Bot runner - main orchestration loop
//!
//! Composes the four runtime guarantees: the lock was taken before this
//! starts, state is reconciled against the exchange before the first
//! decision, every entry passes the risk engine, and exits go through the
//! adaptive closer. The loop is single-threaded and cooperative; all order
//! decisions for the symbol are serialized through it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertLevel, Alerter};
use crate::client::extract_equity;
use crate::closer::{AdaptiveCloser, CloseResult};
use crate::config::Config;
use crate::exchange::Exchange;
use crate::risk::{RiskAction, RiskEngine};
use crate::state::StateStore;
use crate::types::{Side, Signal};

/// Source of opaque trading signals.
///
/// Strategy code lives outside this crate; anything that can produce
/// `{side, amount}` pairs can drive the runner.
#[async_trait]
pub trait SignalSource: Send {
    async fn next_signal(&mut self) -> Option<Signal>;
}

/// Signal source that never signals; the runtime then only manages risk
/// thresholds and recovery of positions left by a previous session.
pub struct IdleSignalSource;

#[async_trait]
impl SignalSource for IdleSignalSource {
    async fn next_signal(&mut self) -> Option<Signal> {
        None
    }
}

/// Repeated-error tracking, passed explicitly through the loop.
#[derive(Debug)]
struct ErrorWindow {
    count: u32,
    window_start: Instant,
}

impl ErrorWindow {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Record one cycle error; true once the cap is hit within the window.
    fn record(&mut self, max_errors: u32, window: Duration) -> bool {
        if self.window_start.elapsed() > window {
            self.count = 0;
            self.window_start = Instant::now();
        }
        self.count += 1;
        self.count >= max_errors
    }
}

/// Main runner driving the trading cycle for one symbol.
pub struct BotRunner<E: Exchange, A: Alerter, S: SignalSource> {
    exchange: E,
    alerter: A,
    signals: S,
    config: Config,
    state_store: StateStore,
}

impl<E: Exchange, A: Alerter, S: SignalSource> BotRunner<E, A, S> {
    pub fn new(exchange: E, alerter: A, signals: S, config: Config) -> Self {
        let state_store = StateStore::new(config.ops.state_file.clone());
        Self {
            exchange,
            alerter,
            signals,
            config,
            state_store,
        }
    }

    /// Startup sequence: reconcile against the exchange, resume any
    /// interrupted flatten, establish the equity baseline.
    ///
    /// Runs before the first trading decision; a failure here aborts the
    /// process rather than trading on uncertain state.
    pub async fn startup(&mut self) -> anyhow::Result<()> {
        let symbol = self.config.trading.symbol.clone();

        let reconcile = self.state_store.reconcile(&self.exchange, &symbol).await?;
        if reconcile.mismatch {
            self.alerter
                .send(
                    &format!(
                        "Position mismatch on {symbol} at startup: local={:?}, exchange={:?}; adopted exchange view",
                        reconcile.local_position, reconcile.exchange_position
                    ),
                    AlertLevel::Warning,
                )
                .await;
            if self.config.ops.halt_on_reconcile_mismatch {
                self.state_store
                    .set_halted(true, "position_mismatch_reconciled")
                    .await?;
            }
        }

        // A crash mid-flatten leaves the breadcrumb behind; finish the job
        // before anything else.
        let state = self.state_store.load().await?;
        if state.pending_action.as_deref() == Some("flatten") {
            if state.open_position.is_some() {
                self.alerter
                    .send(
                        &format!("Resuming interrupted flatten of {symbol}"),
                        AlertLevel::Warning,
                    )
                    .await;
                self.flatten_open_position(&symbol).await?;
            } else {
                let mut state = state;
                state.pending_action = None;
                self.state_store.save(&mut state).await?;
            }
        }

        let state = self.state_store.load().await?;
        if state.baseline_equity_usdt.is_none() {
            if let Some(equity) = self.fetch_equity().await {
                info!("setting baseline equity to {equity:.2} USDT");
                self.state_store.set_baseline_equity(Some(equity)).await?;
            } else {
                warn!("no equity available at startup, baseline unset");
            }
        }

        Ok(())
    }

    /// Run the main loop until a halt condition stops it.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.startup().await?;

        let loop_interval = Duration::from_secs(self.config.trading.loop_interval_seconds);
        let error_backoff = Duration::from_secs(self.config.ops.error_backoff_seconds);
        let error_window = Duration::from_secs(self.config.ops.repeated_error_window_seconds);
        let mut errors = ErrorWindow::new();

        info!(
            "runner started for {} (interval {}s)",
            self.config.trading.symbol, self.config.trading.loop_interval_seconds
        );

        loop {
            match self.run_cycle().await {
                Ok(()) => {}
                Err(err) => {
                    error!("trading cycle error: {err:#}");
                    if errors.record(self.config.ops.max_repeated_errors, error_window) {
                        let reason = format!(
                            "{} repeated errors within {}s, last: {err:#}",
                            self.config.ops.max_repeated_errors,
                            self.config.ops.repeated_error_window_seconds
                        );
                        self.state_store.set_halted(true, &reason).await?;
                        self.alerter
                            .send(&format!("Halting: {reason}"), AlertLevel::Error)
                            .await;
                        return Err(err);
                    }
                    tokio::time::sleep(error_backoff).await;
                }
            }
            tokio::time::sleep(loop_interval).await;
        }
    }

    /// One trading cycle: threshold checks first, then at most one gated
    /// entry.
    async fn run_cycle(&mut self) -> anyhow::Result<()> {
        let symbol = self.config.trading.symbol.clone();
        let state = self.state_store.load().await?;
        let equity = self.fetch_equity().await;

        let risk = RiskEngine::new(&self.config.risk);
        let thresholds = risk.evaluate_thresholds(equity, state.baseline_equity_usdt);
        if !thresholds.allowed {
            match thresholds.action {
                RiskAction::FlattenHalt => {
                    if !state.halted {
                        self.alerter
                            .send(
                                &format!(
                                    "Risk threshold breached ({}): {}; flattening and halting",
                                    thresholds.code.as_str(),
                                    thresholds.reason
                                ),
                                AlertLevel::Error,
                            )
                            .await;
                    }
                    // Idempotent while halted: flattening an already-flat
                    // account submits nothing.
                    self.flatten_open_position(&symbol).await?;
                    self.state_store
                        .set_halted(true, thresholds.code.as_str())
                        .await?;
                }
                RiskAction::Halt => {
                    if !state.halted {
                        self.alerter
                            .send(
                                &format!(
                                    "Risk threshold breached ({}): {}; halting",
                                    thresholds.code.as_str(),
                                    thresholds.reason
                                ),
                                AlertLevel::Error,
                            )
                            .await;
                        self.state_store
                            .set_halted(true, thresholds.code.as_str())
                            .await?;
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        let Some(signal) = self.signals.next_signal().await else {
            return Ok(());
        };
        info!(
            "signal received: {} {:?} ({})",
            signal.side, signal.amount_usdt, signal.reason
        );

        let parsed_side = Side::parse(&signal.side);
        let reference_price = match parsed_side {
            Some(side) => self
                .exchange
                .get_reference_price(&symbol, side)
                .await
                .unwrap_or_default(),
            None => None,
        };
        let limits = self
            .exchange
            .get_market_limits(&symbol)
            .await
            .unwrap_or_default();

        // A signal without an amount falls back to the configured order
        // size; the risk engine still caps either at the per-trade budget.
        let amount_usdt = signal
            .amount_usdt
            .or(Some(self.config.trading.order_size_usdt));
        let decision = risk.evaluate_entry(
            &signal.side,
            amount_usdt,
            reference_price,
            limits.as_ref(),
            state.halted,
            equity,
            Some(self.config.trading.leverage),
        );
        if !decision.allowed {
            info!(
                "entry skipped ({}): {}",
                decision.code.as_str(),
                decision.reason
            );
            return Ok(());
        }

        let (Some(side), Some(qty)) = (parsed_side, decision.order_qty) else {
            return Ok(());
        };
        let client_order_id: u32 = rand::random::<u32>() & 0x7FFF_FFFF;
        let ack = self
            .exchange
            .place_market_order(&symbol, side, qty, client_order_id)
            .await?;

        self.alerter
            .send(
                &format!(
                    "Entry placed: {side} {qty} {symbol} (~{:.2} USDT, order {:?})",
                    decision.order_notional_usdt.unwrap_or_default(),
                    ack.order_id
                ),
                AlertLevel::Info,
            )
            .await;

        // Persist the exchange's view of the new position, not our own
        // arithmetic.
        let position = self.exchange.get_open_position(&symbol).await?;
        self.state_store.set_open_position(position).await?;
        Ok(())
    }

    /// Drive the open position to zero and record the outcome.
    ///
    /// A failed close never passes silently: the halt flag and reason are
    /// persisted so an operator can see why trading stopped after a restart.
    async fn flatten_open_position(&mut self, symbol: &str) -> anyhow::Result<CloseResult> {
        let mut state = self.state_store.load().await?;
        state.pending_action = Some("flatten".to_string());
        self.state_store.save(&mut state).await?;

        let closer = AdaptiveCloser::new(&self.exchange, &self.config.execution);
        let result = closer.flatten_position(symbol).await?;

        let mut state = self.state_store.load().await?;
        state.pending_action = None;
        state.close_attempt_count += result.attempts;
        state.last_close_reason = result.code.as_str().to_string();

        if result.success {
            state.open_position = None;
            self.state_store.save(&mut state).await?;
            if result.orders_sent > 0 {
                self.alerter
                    .send(
                        &format!(
                            "Position on {symbol} closed in {} orders ({:.1}s)",
                            result.orders_sent, result.elapsed_seconds
                        ),
                        AlertLevel::Info,
                    )
                    .await;
            }
        } else {
            state.open_position = self.exchange.get_open_position(symbol).await?;
            if self.config.execution.fail_halt_on_close_failure {
                state.halted = true;
                state.halt_reason = format!("close_failed:{}", result.code.as_str());
            }
            self.state_store.save(&mut state).await?;
            self.alerter
                .send(
                    &format!(
                        "Close of {symbol} failed ({}) with {} remaining after {} attempts",
                        result.code.as_str(),
                        result.remaining_qty,
                        result.attempts
                    ),
                    AlertLevel::Error,
                )
                .await;
        }

        debug!("close result for {symbol}: {result:?}");
        Ok(result)
    }

    async fn fetch_equity(&self) -> Option<f64> {
        match self.exchange.get_account_summary().await {
            Ok(Some(summary)) => extract_equity(&summary),
            Ok(None) => None,
            Err(err) => {
                warn!("account summary unavailable: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_window_resets_after_expiry() {
        let mut window = ErrorWindow::new();
        assert!(!window.record(3, Duration::from_secs(300)));
        assert!(!window.record(3, Duration::from_secs(300)));
        assert!(window.record(3, Duration::from_secs(300)));

        // Expired window starts counting from scratch.
        let mut window = ErrorWindow::new();
        window.window_start = Instant::now() - Duration::from_secs(301);
        window.count = 2;
        assert!(!window.record(3, Duration::from_secs(300)));
        assert_eq!(window.count, 1);
    }
}
