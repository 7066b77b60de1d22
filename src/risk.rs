//! Risk engine - entry gating and account-level threshold controls
//!
//! Pure evaluation over caller-supplied snapshots: no order is ever placed
//! without an `allowed` decision from here, and no internal state is kept
//! beyond the injected configuration.

use serde::{Deserialize, Serialize};

use crate::config::{RiskConfig, ThresholdAction};
use crate::types::{round_to_decimals, MarketLimits, Side};

/// Symbolic outcome codes for risk evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCode {
    Ok,
    InvalidSide,
    KillSwitch,
    Halted,
    ReferencePriceMissing,
    NotionalInputMissing,
    InvalidNotional,
    MarketLimitsMissing,
    MinQtyMissing,
    MinQtyInvalid,
    MinQtyViolation,
    MinNotionalViolation,
    EquityDataMissing,
    EquityDataInvalid,
    MaxDrawdownHit,
    ProfitTargetHit,
}

impl RiskCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskCode::Ok => "OK",
            RiskCode::InvalidSide => "INVALID_SIDE",
            RiskCode::KillSwitch => "KILL_SWITCH",
            RiskCode::Halted => "HALTED",
            RiskCode::ReferencePriceMissing => "REFERENCE_PRICE_MISSING",
            RiskCode::NotionalInputMissing => "NOTIONAL_INPUT_MISSING",
            RiskCode::InvalidNotional => "INVALID_NOTIONAL",
            RiskCode::MarketLimitsMissing => "MARKET_LIMITS_MISSING",
            RiskCode::MinQtyMissing => "MIN_QTY_MISSING",
            RiskCode::MinQtyInvalid => "MIN_QTY_INVALID",
            RiskCode::MinQtyViolation => "MIN_QTY_VIOLATION",
            RiskCode::MinNotionalViolation => "MIN_NOTIONAL_VIOLATION",
            RiskCode::EquityDataMissing => "EQUITY_DATA_MISSING",
            RiskCode::EquityDataInvalid => "EQUITY_DATA_INVALID",
            RiskCode::MaxDrawdownHit => "MAX_DRAWDOWN_HIT",
            RiskCode::ProfitTargetHit => "PROFIT_TARGET_HIT",
        }
    }
}

/// What the caller should do with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    Allow,
    Skip,
    Halt,
    FlattenHalt,
}

impl From<ThresholdAction> for RiskAction {
    fn from(action: ThresholdAction) -> Self {
        match action {
            ThresholdAction::FlattenHalt => RiskAction::FlattenHalt,
            ThresholdAction::Halt => RiskAction::Halt,
        }
    }
}

/// Immutable result of one risk evaluation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub code: RiskCode,
    pub reason: String,
    pub action: RiskAction,
    pub order_qty: Option<f64>,
    pub order_notional_usdt: Option<f64>,
    pub derived_min_notional_usdt: Option<f64>,
}

impl RiskDecision {
    fn blocked(code: RiskCode, reason: impl Into<String>, action: RiskAction) -> Self {
        Self {
            allowed: false,
            code,
            reason: reason.into(),
            action,
            order_qty: None,
            order_notional_usdt: None,
            derived_min_notional_usdt: None,
        }
    }

    fn passed(code: RiskCode, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            code,
            reason: reason.into(),
            action: RiskAction::Allow,
            order_qty: None,
            order_notional_usdt: None,
            derived_min_notional_usdt: None,
        }
    }
}

/// Risk controls for runtime gating and order entry checks.
pub struct RiskEngine<'a> {
    config: &'a RiskConfig,
}

impl<'a> RiskEngine<'a> {
    pub fn new(config: &'a RiskConfig) -> Self {
        Self { config }
    }

    /// Order notional from risk-per-trade and leverage.
    ///
    /// A strategy-provided amount can request less risk than the budget but
    /// never more.
    pub fn compute_notional_from_risk(
        &self,
        account_equity_usdt: f64,
        leverage: f64,
        signal_amount_usdt: Option<f64>,
    ) -> f64 {
        let leverage = leverage.max(1.0);
        let equity = account_equity_usdt.max(0.0);
        let risk_notional = equity * (self.config.risk_per_trade_pct / 100.0) * leverage;

        match signal_amount_usdt {
            Some(amount) if amount > 0.0 => amount.min(risk_notional),
            _ => risk_notional,
        }
    }

    /// Check the drawdown/profit band against the tracked equity baseline.
    ///
    /// The band is two-sided on purpose: both large losses and large gains on
    /// the baseline halt new risk-taking.
    pub fn evaluate_thresholds(
        &self,
        current_equity_usdt: Option<f64>,
        baseline_equity_usdt: Option<f64>,
    ) -> RiskDecision {
        let (current, baseline) = match (current_equity_usdt, baseline_equity_usdt) {
            (Some(current), Some(baseline)) => (current, baseline),
            _ => {
                if self.config.fail_closed {
                    return RiskDecision::blocked(
                        RiskCode::EquityDataMissing,
                        "Missing equity data for threshold checks",
                        RiskAction::Halt,
                    );
                }
                return RiskDecision::passed(RiskCode::EquityDataMissing, "skip");
            }
        };

        if baseline <= 0.0 || current <= 0.0 {
            if self.config.fail_closed {
                return RiskDecision::blocked(
                    RiskCode::EquityDataInvalid,
                    format!("Invalid equity values baseline={baseline}, current={current}"),
                    RiskAction::Halt,
                );
            }
            return RiskDecision::passed(RiskCode::EquityDataInvalid, "skip");
        }

        let track = self.config.active_track_config();
        let pnl_pct = (current - baseline) / baseline * 100.0;

        if pnl_pct <= -track.max_drawdown_pct {
            return RiskDecision::blocked(
                RiskCode::MaxDrawdownHit,
                format!(
                    "Drawdown {pnl_pct:.2}% <= -{:.2}%",
                    track.max_drawdown_pct
                ),
                self.config.threshold_action.into(),
            );
        }

        if pnl_pct >= track.profit_target_pct {
            return RiskDecision::blocked(
                RiskCode::ProfitTargetHit,
                format!("PnL {pnl_pct:.2}% >= {:.2}%", track.profit_target_pct),
                self.config.threshold_action.into(),
            );
        }

        RiskDecision::passed(RiskCode::Ok, format!("Threshold checks passed ({pnl_pct:.2}%)"))
    }

    /// Gate a prospective entry order.
    ///
    /// `side` arrives as the signal's opaque string and is validated here;
    /// everything else is a caller-supplied snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_entry(
        &self,
        side: &str,
        amount_usdt: Option<f64>,
        reference_price: Option<f64>,
        market_limits: Option<&MarketLimits>,
        is_halted: bool,
        account_equity_usdt: Option<f64>,
        leverage: Option<f64>,
    ) -> RiskDecision {
        if Side::parse(side).is_none() {
            return RiskDecision::blocked(
                RiskCode::InvalidSide,
                format!("Unsupported side: {side}"),
                RiskAction::Skip,
            );
        }

        if self.config.kill_switch {
            return RiskDecision::blocked(
                RiskCode::KillSwitch,
                "Risk kill-switch is enabled",
                RiskAction::Skip,
            );
        }

        if is_halted {
            return RiskDecision::blocked(RiskCode::Halted, "Bot is halted", RiskAction::Skip);
        }

        let reference_price = match reference_price {
            Some(price) if price > 0.0 => price,
            _ => {
                return RiskDecision::blocked(
                    RiskCode::ReferencePriceMissing,
                    "Reference price unavailable",
                    RiskAction::Skip,
                )
            }
        };

        let amount_usdt = match (amount_usdt, account_equity_usdt, leverage) {
            (None, Some(equity), Some(leverage)) => {
                self.compute_notional_from_risk(equity, leverage, None)
            }
            (None, _, _) => {
                return RiskDecision::blocked(
                    RiskCode::NotionalInputMissing,
                    "Missing amount_usdt and missing account_equity/leverage to derive it",
                    RiskAction::Skip,
                )
            }
            (Some(amount), Some(equity), Some(leverage)) => {
                self.compute_notional_from_risk(equity, leverage, Some(amount))
            }
            (Some(amount), _, _) => amount,
        };

        if amount_usdt <= 0.0 {
            return RiskDecision::blocked(
                RiskCode::InvalidNotional,
                format!("amount_usdt={amount_usdt}"),
                RiskAction::Skip,
            );
        }

        let limits = match market_limits {
            Some(limits) => limits.clone(),
            None if self.config.fail_closed => {
                return RiskDecision::blocked(
                    RiskCode::MarketLimitsMissing,
                    "Market limits are missing and fail_closed is enabled",
                    RiskAction::Skip,
                )
            }
            // Fail-open degrades to permissive defaults.
            None => MarketLimits::default(),
        };

        let min_qty = match limits.min_qty {
            None => {
                if self.config.fail_closed {
                    return RiskDecision::blocked(
                        RiskCode::MinQtyMissing,
                        "min_qty missing from exchange metadata",
                        RiskAction::Skip,
                    );
                }
                0.0
            }
            Some(min_qty) if min_qty <= 0.0 => {
                if self.config.fail_closed {
                    return RiskDecision::blocked(
                        RiskCode::MinQtyInvalid,
                        format!("Invalid min_qty={min_qty}"),
                        RiskAction::Skip,
                    );
                }
                0.0
            }
            Some(min_qty) => min_qty,
        };

        let mut computed_qty = amount_usdt / reference_price;
        if let Some(decimals) = limits.base_decimals {
            computed_qty = round_to_decimals(computed_qty, decimals);
        }

        if min_qty > 0.0 && computed_qty < min_qty {
            return RiskDecision {
                allowed: false,
                code: RiskCode::MinQtyViolation,
                reason: format!("computed_qty={computed_qty:.12} < min_qty={min_qty:.12}"),
                action: RiskAction::Skip,
                order_qty: Some(computed_qty),
                order_notional_usdt: None,
                derived_min_notional_usdt: None,
            };
        }

        let derived_min_notional = if min_qty > 0.0 {
            min_qty * reference_price * self.config.min_notional_safety_factor
        } else {
            0.0
        };
        if derived_min_notional > 0.0 && amount_usdt < derived_min_notional {
            return RiskDecision {
                allowed: false,
                code: RiskCode::MinNotionalViolation,
                reason: format!(
                    "amount_usdt={amount_usdt:.8} < derived_min_notional={derived_min_notional:.8}"
                ),
                action: RiskAction::Skip,
                order_qty: Some(computed_qty),
                order_notional_usdt: None,
                derived_min_notional_usdt: Some(derived_min_notional),
            };
        }

        RiskDecision {
            allowed: true,
            code: RiskCode::Ok,
            reason: "Entry allowed".to_string(),
            action: RiskAction::Allow,
            order_qty: Some(computed_qty),
            order_notional_usdt: Some(amount_usdt),
            derived_min_notional_usdt: Some(derived_min_notional),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;

    fn risk_config(kill_switch: bool) -> RiskConfig {
        RiskConfig {
            kill_switch,
            ..RiskConfig::default()
        }
    }

    fn limits(min_qty: f64, base_decimals: u32) -> MarketLimits {
        MarketLimits {
            min_qty: Some(min_qty),
            tick_size: None,
            base_decimals: Some(base_decimals),
        }
    }

    #[test]
    fn kill_switch_blocks_entry() {
        let config = risk_config(true);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_entry(
            "buy",
            Some(100.0),
            Some(1000.0),
            Some(&limits(0.001, 4)),
            false,
            None,
            None,
        );
        assert!(!decision.allowed);
        assert_eq!(decision.code, RiskCode::KillSwitch);
        assert_eq!(decision.action, RiskAction::Skip);
    }

    #[test]
    fn invalid_side_blocks_entry() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision =
            engine.evaluate_entry("hold", Some(100.0), Some(1000.0), None, false, None, None);
        assert_eq!(decision.code, RiskCode::InvalidSide);
    }

    #[test]
    fn missing_reference_price_blocks_entry() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_entry(
            "buy",
            Some(100.0),
            None,
            Some(&limits(0.001, 4)),
            false,
            None,
            None,
        );
        assert_eq!(decision.code, RiskCode::ReferencePriceMissing);
    }

    #[test]
    fn min_qty_violation_rejects_entry_with_computed_qty() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        // qty = 10 / 1000 = 0.01 < min_qty 0.02
        let decision = engine.evaluate_entry(
            "buy",
            Some(10.0),
            Some(1000.0),
            Some(&limits(0.02, 4)),
            false,
            None,
            None,
        );
        assert!(!decision.allowed);
        assert_eq!(decision.code, RiskCode::MinQtyViolation);
        assert_eq!(decision.order_qty, Some(0.01));
    }

    #[test]
    fn derived_min_notional_violation_rejects_entry() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        // derived min notional = 0.02 * 1000 * 1.05 = 21.0
        let decision = engine.evaluate_entry(
            "buy",
            Some(20.0),
            Some(1000.0),
            Some(&limits(0.02, 4)),
            false,
            None,
            None,
        );
        assert!(!decision.allowed);
        assert_eq!(decision.code, RiskCode::MinNotionalViolation);
        assert_eq!(decision.derived_min_notional_usdt, Some(21.0));
    }

    #[test]
    fn entry_allowed_carries_qty_and_notional() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_entry(
            "sell",
            Some(100.0),
            Some(1000.0),
            Some(&limits(0.02, 4)),
            false,
            None,
            None,
        );
        assert!(decision.allowed);
        assert_eq!(decision.code, RiskCode::Ok);
        assert_eq!(decision.order_qty, Some(0.1));
        assert_eq!(decision.order_notional_usdt, Some(100.0));
    }

    #[test]
    fn missing_notional_inputs_block_entry() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_entry(
            "buy",
            None,
            Some(1000.0),
            Some(&limits(0.001, 4)),
            false,
            None,
            None,
        );
        assert_eq!(decision.code, RiskCode::NotionalInputMissing);
    }

    #[test]
    fn notional_derived_from_equity_and_capped_by_budget() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        // budget = 10_000 * 0.25% * 10 = 250
        assert_eq!(engine.compute_notional_from_risk(10_000.0, 10.0, None), 250.0);
        assert_eq!(
            engine.compute_notional_from_risk(10_000.0, 10.0, Some(100.0)),
            100.0
        );
        assert_eq!(
            engine.compute_notional_from_risk(10_000.0, 10.0, Some(400.0)),
            250.0
        );

        let decision = engine.evaluate_entry(
            "buy",
            None,
            Some(1000.0),
            Some(&limits(0.001, 4)),
            false,
            Some(10_000.0),
            Some(10.0),
        );
        assert!(decision.allowed);
        assert_eq!(decision.order_notional_usdt, Some(250.0));
        assert_eq!(decision.order_qty, Some(0.25));
    }

    #[test]
    fn missing_market_limits_respect_fail_closed() {
        let closed = risk_config(false);
        let engine = RiskEngine::new(&closed);
        let decision =
            engine.evaluate_entry("buy", Some(100.0), Some(1000.0), None, false, None, None);
        assert_eq!(decision.code, RiskCode::MarketLimitsMissing);
        assert!(!decision.allowed);

        let mut open = risk_config(false);
        open.fail_closed = false;
        let engine = RiskEngine::new(&open);
        let decision =
            engine.evaluate_entry("buy", Some(100.0), Some(1000.0), None, false, None, None);
        assert!(decision.allowed);
        assert_eq!(decision.order_qty, Some(0.1));
    }

    #[test]
    fn drawdown_threshold_triggers_flatten_halt() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_thresholds(Some(940.0), Some(1000.0));
        assert!(!decision.allowed);
        assert_eq!(decision.code, RiskCode::MaxDrawdownHit);
        assert_eq!(decision.action, RiskAction::FlattenHalt);
    }

    #[test]
    fn profit_threshold_triggers_flatten_halt() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_thresholds(Some(1060.0), Some(1000.0));
        assert!(!decision.allowed);
        assert_eq!(decision.code, RiskCode::ProfitTargetHit);
        assert_eq!(decision.action, RiskAction::FlattenHalt);
    }

    #[test]
    fn threshold_pass_inside_band() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_thresholds(Some(1010.0), Some(1000.0));
        assert!(decision.allowed);
        assert_eq!(decision.code, RiskCode::Ok);
    }

    #[test]
    fn missing_equity_halts_when_fail_closed() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_thresholds(None, Some(1000.0));
        assert!(!decision.allowed);
        assert_eq!(decision.code, RiskCode::EquityDataMissing);
        assert_eq!(decision.action, RiskAction::Halt);

        let mut open = risk_config(false);
        open.fail_closed = false;
        let engine = RiskEngine::new(&open);
        let decision = engine.evaluate_thresholds(None, Some(1000.0));
        assert!(decision.allowed);
    }

    #[test]
    fn invalid_equity_halts_when_fail_closed() {
        let config = risk_config(false);
        let engine = RiskEngine::new(&config);
        let decision = engine.evaluate_thresholds(Some(0.0), Some(1000.0));
        assert_eq!(decision.code, RiskCode::EquityDataInvalid);
        assert_eq!(decision.action, RiskAction::Halt);
    }
}
