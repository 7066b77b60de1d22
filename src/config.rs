//! Runtime configuration
//!
//! One strongly-typed structure constructed at startup from a YAML file with
//! environment-variable overrides, then passed by reference into the risk
//! engine, the closer and the runner. No string-keyed lookups at call sites.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Full runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub ops: OpsConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Exchange endpoint and account identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub trading_account_id: String,
    #[serde(default = "default_sub_account_id")]
    pub sub_account_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default = "default_order_size_usdt")]
    pub order_size_usdt: f64,
    #[serde(default = "default_loop_interval_seconds")]
    pub loop_interval_seconds: u64,
}

/// One named risk track: the drawdown/profit band applied to the tracked
/// equity baseline.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RiskTrack {
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: f64,
}

impl Default for RiskTrack {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown_pct(),
            profit_target_pct: default_profit_target_pct(),
        }
    }
}

/// What to do when a risk track threshold is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdAction {
    FlattenHalt,
    Halt,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskConfig {
    #[serde(default = "default_active_track")]
    pub active_track: String,
    #[serde(default = "default_true")]
    pub fail_closed: bool,
    #[serde(default)]
    pub kill_switch: bool,
    #[serde(default = "default_threshold_action")]
    pub threshold_action: ThresholdAction,
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,
    #[serde(default = "default_min_notional_safety_factor")]
    pub min_notional_safety_factor: f64,
    #[serde(default = "default_tracks")]
    pub tracks: BTreeMap<String, RiskTrack>,
}

impl RiskConfig {
    /// Resolve the active track, falling back to `normal`, then to built-in
    /// defaults when the config names a track that does not exist.
    pub fn active_track_config(&self) -> RiskTrack {
        self.tracks
            .get(&self.active_track)
            .or_else(|| self.tracks.get("normal"))
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Fraction of visible band liquidity one slice may consume.
    #[serde(default = "default_liquidity_usage_pct")]
    pub liquidity_usage_pct: f64,
    #[serde(default = "default_orderbook_levels")]
    pub orderbook_levels: u32,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
    #[serde(default = "default_close_min_slice_qty")]
    pub close_min_slice_qty: f64,
    #[serde(default = "default_close_retry_interval_seconds")]
    pub close_retry_interval_seconds: u64,
    #[serde(default = "default_close_max_retries")]
    pub close_max_retries: u32,
    #[serde(default = "default_close_max_duration_seconds")]
    pub close_max_duration_seconds: u64,
    #[serde(default = "default_close_no_progress_retries")]
    pub close_no_progress_retries: u32,
    /// Completion tolerance; also the minimum quantity decrease that counts
    /// as progress between close iterations.
    #[serde(default = "default_position_qty_tolerance")]
    pub position_qty_tolerance: f64,
    #[serde(default = "default_true")]
    pub fail_halt_on_close_failure: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            liquidity_usage_pct: default_liquidity_usage_pct(),
            orderbook_levels: default_orderbook_levels(),
            max_slippage_bps: default_max_slippage_bps(),
            close_min_slice_qty: default_close_min_slice_qty(),
            close_retry_interval_seconds: default_close_retry_interval_seconds(),
            close_max_retries: default_close_max_retries(),
            close_max_duration_seconds: default_close_max_duration_seconds(),
            close_no_progress_retries: default_close_no_progress_retries(),
            position_qty_tolerance: default_position_qty_tolerance(),
            fail_halt_on_close_failure: default_true(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpsConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default = "default_true")]
    pub halt_on_reconcile_mismatch: bool,
    #[serde(default = "default_error_backoff_seconds")]
    pub error_backoff_seconds: u64,
    #[serde(default = "default_max_repeated_errors")]
    pub max_repeated_errors: u32,
    #[serde(default = "default_repeated_error_window_seconds")]
    pub repeated_error_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Config {
    /// Load configuration from a YAML file, then apply env overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env_overrides();
        config.expand_paths();
        Ok(config)
    }

    /// Defaults plus env overrides, for running without a config file.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.expand_paths();
        config
    }

    /// Required fields that have no usable default.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.exchange.api_key.is_empty() {
            anyhow::bail!("missing required config: exchange.api_key");
        }
        if self.exchange.trading_account_id.is_empty() {
            anyhow::bail!("missing required config: exchange.trading_account_id");
        }
        if self.trading.symbol.is_empty() {
            anyhow::bail!("missing required config: trading.symbol");
        }
        if !(0.0..=1.0).contains(&self.execution.liquidity_usage_pct) {
            anyhow::bail!(
                "execution.liquidity_usage_pct must be within [0, 1], got {}",
                self.execution.liquidity_usage_pct
            );
        }
        if self.risk.min_notional_safety_factor < 1.0 {
            anyhow::bail!(
                "risk.min_notional_safety_factor must be >= 1.0, got {}",
                self.risk.min_notional_safety_factor
            );
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        override_string("EXCHANGE_REST_URL", &mut self.exchange.rest_url);
        override_string("EXCHANGE_API_KEY", &mut self.exchange.api_key);
        override_string(
            "EXCHANGE_TRADING_ACCOUNT_ID",
            &mut self.exchange.trading_account_id,
        );
        override_string("EXCHANGE_SUB_ACCOUNT_ID", &mut self.exchange.sub_account_id);

        override_string("SYMBOL", &mut self.trading.symbol);
        override_parse("LEVERAGE", &mut self.trading.leverage);
        override_parse("ORDER_SIZE_USDT", &mut self.trading.order_size_usdt);
        override_parse("MAIN_LOOP_INTERVAL", &mut self.trading.loop_interval_seconds);

        override_string("RISK_ACTIVE_TRACK", &mut self.risk.active_track);
        override_bool("RISK_FAIL_CLOSED", &mut self.risk.fail_closed);
        override_bool("RISK_KILL_SWITCH", &mut self.risk.kill_switch);
        override_parse("RISK_PER_TRADE_PCT", &mut self.risk.risk_per_trade_pct);
        override_parse(
            "RISK_MIN_NOTIONAL_SAFETY_FACTOR",
            &mut self.risk.min_notional_safety_factor,
        );

        override_parse(
            "EXECUTION_LIQUIDITY_USAGE_PCT",
            &mut self.execution.liquidity_usage_pct,
        );
        override_parse("EXECUTION_ORDERBOOK_LEVELS", &mut self.execution.orderbook_levels);
        override_parse("EXECUTION_MAX_SLIPPAGE_BPS", &mut self.execution.max_slippage_bps);
        override_parse(
            "EXECUTION_CLOSE_MIN_SLICE_QTY",
            &mut self.execution.close_min_slice_qty,
        );
        override_parse(
            "EXECUTION_CLOSE_RETRY_INTERVAL_SECONDS",
            &mut self.execution.close_retry_interval_seconds,
        );
        override_parse(
            "EXECUTION_CLOSE_MAX_RETRIES",
            &mut self.execution.close_max_retries,
        );
        override_parse(
            "EXECUTION_CLOSE_MAX_DURATION_SECONDS",
            &mut self.execution.close_max_duration_seconds,
        );
        override_parse(
            "EXECUTION_CLOSE_NO_PROGRESS_RETRIES",
            &mut self.execution.close_no_progress_retries,
        );
        override_parse(
            "EXECUTION_POSITION_QTY_TOLERANCE",
            &mut self.execution.position_qty_tolerance,
        );
        override_bool(
            "EXECUTION_FAIL_HALT_ON_CLOSE_FAILURE",
            &mut self.execution.fail_halt_on_close_failure,
        );

        override_path("OPS_STATE_FILE", &mut self.ops.state_file);
        override_path("OPS_LOCK_FILE", &mut self.ops.lock_file);
        override_bool(
            "OPS_HALT_ON_RECONCILE_MISMATCH",
            &mut self.ops.halt_on_reconcile_mismatch,
        );
        override_parse("OPS_ERROR_BACKOFF_SECONDS", &mut self.ops.error_backoff_seconds);
        override_parse("OPS_MAX_REPEATED_ERRORS", &mut self.ops.max_repeated_errors);
        override_parse(
            "OPS_REPEATED_ERROR_WINDOW_SECONDS",
            &mut self.ops.repeated_error_window_seconds,
        );

        override_bool("ALERTS_ENABLED", &mut self.alerts.enabled);
    }

    fn expand_paths(&mut self) {
        self.ops.state_file = expand_home(&self.ops.state_file);
        self.ops.lock_file = expand_home(&self.ops.lock_file);
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(stripped),
        None => path.to_path_buf(),
    }
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(value) = std::env::var(var) {
        *target = value;
    }
}

fn override_path(var: &str, target: &mut PathBuf) {
    if let Ok(value) = std::env::var(var) {
        *target = PathBuf::from(value);
    }
}

fn override_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Some(value) = std::env::var(var).ok().and_then(|v| v.parse().ok()) {
        *target = value;
    }
}

fn override_bool(var: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(var) {
        *target = matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            api_key: String::new(),
            trading_account_id: String::new(),
            sub_account_id: default_sub_account_id(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            leverage: default_leverage(),
            order_size_usdt: default_order_size_usdt(),
            loop_interval_seconds: default_loop_interval_seconds(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            active_track: default_active_track(),
            fail_closed: true,
            kill_switch: false,
            threshold_action: default_threshold_action(),
            risk_per_trade_pct: default_risk_per_trade_pct(),
            min_notional_safety_factor: default_min_notional_safety_factor(),
            tracks: default_tracks(),
        }
    }
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            lock_file: default_lock_file(),
            halt_on_reconcile_mismatch: true,
            error_backoff_seconds: default_error_backoff_seconds(),
            max_repeated_errors: default_max_repeated_errors(),
            repeated_error_window_seconds: default_repeated_error_window_seconds(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_rest_url() -> String {
    "https://api.testnet.example.exchange".to_string()
}
fn default_sub_account_id() -> String {
    "0".to_string()
}
fn default_symbol() -> String {
    "BTC_USDT_Perp".to_string()
}
fn default_leverage() -> f64 {
    10.0
}
fn default_order_size_usdt() -> f64 {
    500.0
}
fn default_loop_interval_seconds() -> u64 {
    1
}
fn default_active_track() -> String {
    "normal".to_string()
}
fn default_threshold_action() -> ThresholdAction {
    ThresholdAction::FlattenHalt
}
fn default_risk_per_trade_pct() -> f64 {
    0.25
}
fn default_min_notional_safety_factor() -> f64 {
    1.05
}
fn default_max_drawdown_pct() -> f64 {
    5.0
}
fn default_profit_target_pct() -> f64 {
    5.0
}
fn default_tracks() -> BTreeMap<String, RiskTrack> {
    let mut tracks = BTreeMap::new();
    tracks.insert(
        "normal".to_string(),
        RiskTrack {
            max_drawdown_pct: 5.0,
            profit_target_pct: 5.0,
        },
    );
    tracks.insert(
        "low_vol".to_string(),
        RiskTrack {
            max_drawdown_pct: 2.0,
            profit_target_pct: 2.0,
        },
    );
    tracks
}
fn default_liquidity_usage_pct() -> f64 {
    0.20
}
fn default_orderbook_levels() -> u32 {
    20
}
fn default_max_slippage_bps() -> u32 {
    20
}
fn default_close_min_slice_qty() -> f64 {
    0.01
}
fn default_close_retry_interval_seconds() -> u64 {
    2
}
fn default_close_max_retries() -> u32 {
    20
}
fn default_close_max_duration_seconds() -> u64 {
    90
}
fn default_close_no_progress_retries() -> u32 {
    3
}
fn default_position_qty_tolerance() -> f64 {
    0.000_001
}
fn default_state_file() -> PathBuf {
    PathBuf::from("state/runtime_state.json")
}
fn default_lock_file() -> PathBuf {
    PathBuf::from("state/runtime.lock")
}
fn default_error_backoff_seconds() -> u64 {
    2
}
fn default_max_repeated_errors() -> u32 {
    20
}
fn default_repeated_error_window_seconds() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.risk.fail_closed);
        assert!(!config.risk.kill_switch);
        assert_eq!(config.risk.threshold_action, ThresholdAction::FlattenHalt);
        assert_eq!(config.execution.close_max_retries, 20);
        assert_eq!(config.execution.close_no_progress_retries, 3);
        let track = config.risk.active_track_config();
        assert_eq!(track.max_drawdown_pct, 5.0);
    }

    #[test]
    fn unknown_active_track_falls_back_to_normal() {
        let mut config = Config::default();
        config.risk.active_track = "aggressive".to_string();
        config
            .risk
            .tracks
            .get_mut("normal")
            .expect("normal track")
            .max_drawdown_pct = 7.5;
        assert_eq!(config.risk.active_track_config().max_drawdown_pct, 7.5);
    }

    #[test]
    fn yaml_sections_merge_over_defaults() {
        let yaml = r#"
trading:
  symbol: PAXG_USDT_Perp
risk:
  active_track: low_vol
execution:
  close_max_retries: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.trading.symbol, "PAXG_USDT_Perp");
        assert_eq!(config.trading.leverage, 10.0);
        assert_eq!(config.execution.close_max_retries, 5);
        let track = config.risk.active_track_config();
        assert_eq!(track.max_drawdown_pct, 2.0);
    }
}
