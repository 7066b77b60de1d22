//! Adaptive position closer
//!
//! Reduces an open position to (approximately) zero using reduce-only market
//! orders sized to the liquidity currently visible within a slippage band.
//! The loop is bounded three ways: an attempt cap, a wall-clock cap, and a
//! cap on consecutive iterations without measurable progress. Every exit is
//! one of the terminal codes below; there is no unbounded branch.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::exchange::Exchange;
use crate::types::{round_to_decimals, MarketLimits, Side};

/// Terminal outcome codes for one adaptive-close invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseCode {
    CloseSuccess,
    CloseTimeout,
    CloseNoProgress,
    CloseIncompleteThinBook,
    CloseInvalidSide,
}

impl CloseCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseCode::CloseSuccess => "CLOSE_SUCCESS",
            CloseCode::CloseTimeout => "CLOSE_TIMEOUT",
            CloseCode::CloseNoProgress => "CLOSE_NO_PROGRESS",
            CloseCode::CloseIncompleteThinBook => "CLOSE_INCOMPLETE_THIN_BOOK",
            CloseCode::CloseInvalidSide => "CLOSE_INVALID_SIDE",
        }
    }
}

/// Immutable outcome of one adaptive-close invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloseResult {
    pub success: bool,
    pub code: CloseCode,
    pub remaining_qty: f64,
    pub attempts: u32,
    pub orders_sent: u32,
    pub elapsed_seconds: f64,
}

/// Why an iteration failed to make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StallKind {
    /// Price or book unavailable, or the position read failed.
    DataUnavailable,
    /// No liquidity within the slippage band.
    NoLiquidity,
    /// Slice collapsed to zero under exchange precision.
    RoundedToZero,
    /// Slice below the exchange minimum and the remainder cannot finish.
    BelowMinQty,
    /// An order went out but the position did not shrink.
    OrderStalled,
}

/// Loop bookkeeping threaded through every iteration.
#[derive(Debug)]
struct CloseLoopState {
    attempts: u32,
    orders_sent: u32,
    no_progress_count: u32,
    last_qty: Option<f64>,
    started_at: Instant,
}

impl CloseLoopState {
    fn new() -> Self {
        Self {
            attempts: 0,
            orders_sent: 0,
            no_progress_count: 0,
            last_qty: None,
            started_at: Instant::now(),
        }
    }

    /// Record a no-progress event; returns the terminal code once the cap is
    /// reached. Only the sub-minimum-quantity stall escalates to the
    /// thin-book code.
    fn register_stall(&mut self, kind: StallKind, cap: u32) -> Option<CloseCode> {
        self.no_progress_count += 1;
        if self.no_progress_count < cap {
            return None;
        }
        Some(match kind {
            StallKind::BelowMinQty => CloseCode::CloseIncompleteThinBook,
            _ => CloseCode::CloseNoProgress,
        })
    }

    fn finish(&self, code: CloseCode, remaining_qty: f64) -> CloseResult {
        CloseResult {
            success: code == CloseCode::CloseSuccess,
            code,
            remaining_qty,
            attempts: self.attempts,
            orders_sent: self.orders_sent,
            elapsed_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

/// Sizing decision for one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SlicePlan {
    Submit(f64),
    Stall(StallKind),
}

/// Size one slice against the liquidity visible in the band.
///
/// Full available coverage targets the whole remainder (finish in one shot);
/// otherwise the slice is a configured fraction of visible liquidity,
/// floored at `close_min_slice_qty` and capped at the remainder.
fn plan_slice(
    remaining_qty: f64,
    available_liquidity: f64,
    limits: Option<&MarketLimits>,
    config: &ExecutionConfig,
) -> SlicePlan {
    let tolerance = config.position_qty_tolerance;

    let mut target = if available_liquidity >= remaining_qty {
        remaining_qty
    } else {
        (available_liquidity * config.liquidity_usage_pct)
            .max(config.close_min_slice_qty)
            .min(remaining_qty)
    };

    let base_decimals = limits.and_then(|l| l.base_decimals);
    if let Some(decimals) = base_decimals {
        target = round_to_decimals(target, decimals);
    }
    if target <= tolerance {
        return SlicePlan::Stall(StallKind::RoundedToZero);
    }

    let min_qty = limits.and_then(|l| l.min_qty).unwrap_or(0.0);
    if min_qty > 0.0 && target < min_qty {
        // Finishing with the full remainder is acceptable only when the
        // remainder itself satisfies the exchange minimum (within tolerance).
        if remaining_qty >= min_qty - tolerance {
            let mut promoted = remaining_qty;
            if let Some(decimals) = base_decimals {
                promoted = round_to_decimals(promoted, decimals);
            }
            if promoted > tolerance {
                return SlicePlan::Submit(promoted);
            }
        }
        return SlicePlan::Stall(StallKind::BelowMinQty);
    }

    SlicePlan::Submit(target)
}

/// Idempotency token for one real submission attempt.
///
/// Derived from the caller seed plus the attempt and order counters, folded
/// into the venue's 31-bit client-order-id range. `orders_sent` increments
/// on every submission, so no two submissions of one close share a token.
fn client_order_id(seed: u32, attempts: u32, orders_sent: u32) -> u32 {
    let raw = seed as u64 * 100_000 + attempts as u64 * 1_000 + orders_sent as u64;
    (raw % 0x7FFF_FFFF) as u32
}

/// Liquidity-aware unwind driver over an [`Exchange`].
pub struct AdaptiveCloser<'a, E: Exchange> {
    exchange: &'a E,
    config: &'a ExecutionConfig,
}

impl<'a, E: Exchange> AdaptiveCloser<'a, E> {
    pub fn new(exchange: &'a E, config: &'a ExecutionConfig) -> Self {
        Self { exchange, config }
    }

    /// Read the live position and drive it to zero.
    ///
    /// Returns a success result without submitting anything when no position
    /// is open.
    pub async fn flatten_position(&self, symbol: &str) -> anyhow::Result<CloseResult> {
        let position = self.exchange.get_open_position(symbol).await?;
        let Some(position) = position else {
            debug!("no open position on {symbol}, nothing to flatten");
            return Ok(CloseLoopState::new().finish(CloseCode::CloseSuccess, 0.0));
        };

        let close_side = position.side.inverse();
        let seed: u32 = rand::random::<u32>() & 0x7FFF;
        info!(
            "flattening {symbol}: {} {} via {} close",
            position.side, position.amount_base, close_side
        );
        Ok(self.close_position(symbol, close_side, seed).await)
    }

    /// Run the closing loop until one of the terminal codes is reached.
    ///
    /// `requested_side` is the caller's view of the close side; the order
    /// side actually used is re-derived from the live position every
    /// iteration, and a caller whose view contradicts the exchange gets
    /// `CLOSE_INVALID_SIDE` instead of an order that would add exposure.
    pub async fn close_position(
        &self,
        symbol: &str,
        requested_side: Side,
        client_order_id_seed: u32,
    ) -> CloseResult {
        let mut state = CloseLoopState::new();
        let mut limits: Option<MarketLimits> = None;
        let tolerance = self.config.position_qty_tolerance;
        let max_duration = Duration::from_secs(self.config.close_max_duration_seconds);
        let retry_interval = Duration::from_secs(self.config.close_retry_interval_seconds);
        let no_progress_cap = self.config.close_no_progress_retries;

        loop {
            // Attempt and duration caps bound worst-case runtime even under
            // slow-but-nonzero progress; checked before any other work.
            if state.attempts >= self.config.close_max_retries
                || state.started_at.elapsed() >= max_duration
            {
                return state.finish(CloseCode::CloseTimeout, state.last_qty.unwrap_or(0.0));
            }
            state.attempts += 1;

            // Probing: the authoritative remaining quantity is the
            // exchange's current report, never a local delta.
            let position = match self.exchange.get_open_position(symbol).await {
                Ok(position) => position,
                Err(err) => {
                    warn!("position read failed during close of {symbol}: {err:#}");
                    if let Some(code) =
                        state.register_stall(StallKind::DataUnavailable, no_progress_cap)
                    {
                        return state.finish(code, state.last_qty.unwrap_or(0.0));
                    }
                    tokio::time::sleep(retry_interval).await;
                    continue;
                }
            };

            let position = match position {
                Some(position) if position.amount_base > tolerance => position,
                _ => return state.finish(CloseCode::CloseSuccess, 0.0),
            };
            let remaining = position.amount_base;
            state.last_qty = Some(remaining);

            // Re-derived every iteration; the side cannot legally flip
            // mid-close, this guards against stale caller input.
            let close_side = position.side.inverse();
            if close_side != requested_side {
                warn!(
                    "close side mismatch on {symbol}: requested {requested_side}, live position is {}",
                    position.side
                );
                return state.finish(CloseCode::CloseInvalidSide, remaining);
            }

            let reference = self
                .exchange
                .get_reference_price(symbol, close_side)
                .await
                .unwrap_or_default();
            let book = self
                .exchange
                .get_order_book(symbol, self.config.orderbook_levels)
                .await
                .unwrap_or_default();
            let (reference, book) = match (reference, book) {
                (Some(reference), Some(book)) if reference > 0.0 => (reference, book),
                _ => {
                    debug!("price/book unavailable for {symbol}, retrying");
                    if let Some(code) =
                        state.register_stall(StallKind::DataUnavailable, no_progress_cap)
                    {
                        return state.finish(code, remaining);
                    }
                    tokio::time::sleep(retry_interval).await;
                    continue;
                }
            };

            let available =
                book.liquidity_within_band(close_side, reference, self.config.max_slippage_bps);
            if available <= 0.0 {
                debug!("no liquidity within band for {symbol} at reference {reference}");
                if let Some(code) = state.register_stall(StallKind::NoLiquidity, no_progress_cap) {
                    return state.finish(code, remaining);
                }
                tokio::time::sleep(retry_interval).await;
                continue;
            }

            // Limits are fetched once per close run; staleness is tolerated.
            if limits.is_none() {
                limits = self
                    .exchange
                    .get_market_limits(symbol)
                    .await
                    .unwrap_or_default();
            }

            let slice = match plan_slice(remaining, available, limits.as_ref(), self.config) {
                SlicePlan::Submit(qty) => qty,
                SlicePlan::Stall(kind) => {
                    debug!("slice sizing stalled on {symbol}: {kind:?}");
                    if let Some(code) = state.register_stall(kind, no_progress_cap) {
                        return state.finish(code, remaining);
                    }
                    tokio::time::sleep(retry_interval).await;
                    continue;
                }
            };

            // Submitting. The ack is advisory: progress is judged purely on
            // the re-read position, so a lost ack cannot wedge the loop.
            let token = client_order_id(client_order_id_seed, state.attempts, state.orders_sent);
            state.orders_sent += 1;
            info!(
                "close slice {}/{remaining} {close_side} {symbol} (attempt {}, token {token})",
                slice, state.attempts
            );
            if let Err(err) = self
                .exchange
                .place_reduce_only_market_order(symbol, close_side, slice, token)
                .await
            {
                warn!("close order submission failed for {symbol}: {err:#}");
            }

            tokio::time::sleep(retry_interval).await;

            let new_remaining = match self.exchange.get_open_position(symbol).await {
                Ok(Some(position)) => position.amount_base,
                Ok(None) => 0.0,
                // Unknown is treated as unchanged; the next probe decides.
                Err(_) => remaining,
            };
            if new_remaining <= tolerance {
                return state.finish(CloseCode::CloseSuccess, new_remaining);
            }
            if remaining - new_remaining > tolerance {
                state.no_progress_count = 0;
            } else if let Some(code) =
                state.register_stall(StallKind::OrderStalled, no_progress_cap)
            {
                return state.finish(code, new_remaining);
            }
            state.last_qty = Some(new_remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_config() -> ExecutionConfig {
        ExecutionConfig::default()
    }

    fn limits(min_qty: f64, base_decimals: u32) -> MarketLimits {
        MarketLimits {
            min_qty: Some(min_qty),
            tick_size: None,
            base_decimals: Some(base_decimals),
        }
    }

    #[test]
    fn full_coverage_targets_whole_remainder() {
        let config = exec_config();
        let plan = plan_slice(1.0, 3.0, Some(&limits(0.01, 3)), &config);
        assert_eq!(plan, SlicePlan::Submit(1.0));
    }

    #[test]
    fn thin_book_slices_a_fraction_of_visible_liquidity() {
        let config = exec_config();
        // available 0.3 < remaining 1.0: slice = max(0.01, 0.3 * 0.2) = 0.06
        let plan = plan_slice(1.0, 0.3, Some(&limits(0.01, 3)), &config);
        assert_eq!(plan, SlicePlan::Submit(0.06));
    }

    #[test]
    fn slice_is_floored_at_min_slice_qty() {
        let config = exec_config();
        // available 0.02 -> 0.2 * 0.02 = 0.004, floored at 0.01
        let plan = plan_slice(1.0, 0.02, Some(&limits(0.01, 3)), &config);
        assert_eq!(plan, SlicePlan::Submit(0.01));
    }

    #[test]
    fn slice_never_exceeds_remainder() {
        let config = exec_config();
        let plan = plan_slice(0.005, 0.002, Some(&limits(0.0, 3)), &config);
        // 0.2 * 0.002 = 0.0004 -> floor at min_slice 0.01 -> capped at remainder
        assert_eq!(plan, SlicePlan::Submit(0.005));
    }

    #[test]
    fn rounding_collapse_is_a_stall() {
        let config = exec_config();
        let plan = plan_slice(0.0004, 0.0001, Some(&limits(0.0, 3)), &config);
        assert_eq!(plan, SlicePlan::Stall(StallKind::RoundedToZero));
    }

    #[test]
    fn residual_below_min_qty_is_a_thin_book_stall() {
        let mut config = exec_config();
        config.close_min_slice_qty = 0.001;
        // remainder 0.004 < min_qty 0.01: no legal order can finish it,
        // regardless of how much liquidity the book shows
        let plan = plan_slice(0.004, 10.0, Some(&limits(0.01, 3)), &config);
        assert_eq!(plan, SlicePlan::Stall(StallKind::BelowMinQty));
        let plan = plan_slice(0.004, 0.002, Some(&limits(0.01, 3)), &config);
        assert_eq!(plan, SlicePlan::Stall(StallKind::BelowMinQty));
    }

    #[test]
    fn near_minimum_remainder_is_promoted_to_finish() {
        let mut config = exec_config();
        config.close_min_slice_qty = 0.001;
        // fractional slice 0.001 is below min_qty, but the remainder itself
        // satisfies the minimum within tolerance, so finish with the
        // remainder instead of stalling
        let plan = plan_slice(0.009_999_5, 0.005, Some(&limits(0.01, 8)), &config);
        match plan {
            SlicePlan::Submit(qty) => assert!((qty - 0.009_999_5).abs() < 1e-9),
            other => panic!("expected promotion to the remainder, got {other:?}"),
        }
    }

    #[test]
    fn client_order_ids_are_unique_per_submission_and_31_bit() {
        let a = client_order_id(7, 1, 0);
        let b = client_order_id(7, 1, 1);
        let c = client_order_id(7, 2, 1);
        assert_ne!(a, b);
        assert_ne!(b, c);
        for token in [a, b, c] {
            assert!(token < 0x8000_0000);
        }
        assert!(client_order_id(u32::MAX, u32::MAX, u32::MAX) < 0x8000_0000);
    }

    #[test]
    fn stall_cap_escalates_thin_book_only_for_min_qty_stalls() {
        let mut state = CloseLoopState::new();
        assert_eq!(state.register_stall(StallKind::DataUnavailable, 3), None);
        assert_eq!(state.register_stall(StallKind::NoLiquidity, 3), None);
        assert_eq!(
            state.register_stall(StallKind::DataUnavailable, 3),
            Some(CloseCode::CloseNoProgress)
        );

        let mut state = CloseLoopState::new();
        assert_eq!(state.register_stall(StallKind::BelowMinQty, 2), None);
        assert_eq!(
            state.register_stall(StallKind::BelowMinQty, 2),
            Some(CloseCode::CloseIncompleteThinBook)
        );
    }
}
