//! Runtime state persistence and exchange reconciliation
//!
//! One JSON document holds everything a restarted process needs to pick up a
//! crashed session: halt flag and reason, the last known open position, and
//! the equity baseline the risk thresholds track. Every mutation rewrites the
//! whole document atomically; readers never observe a half-written file.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};

use crate::exchange::Exchange;
use crate::types::Position;

/// Quantity tolerance used when comparing local and exchange positions.
const RECONCILE_QTY_TOLERANCE: f64 = 1e-9;

/// The single persisted runtime document.
///
/// Every field carries a serde default so documents written by older builds
/// merge over sane defaults instead of failing to load.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuntimeState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub halted: bool,
    #[serde(default)]
    pub halt_reason: String,
    #[serde(default)]
    pub open_position: Option<Position>,
    #[serde(default)]
    pub pending_action: Option<String>,
    #[serde(default)]
    pub close_attempt_count: u32,
    #[serde(default)]
    pub last_close_reason: String,
    #[serde(default)]
    pub baseline_equity_usdt: Option<f64>,
    #[serde(default)]
    pub last_candle_open_time_ms: Option<i64>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            version: default_version(),
            halted: false,
            halt_reason: String::new(),
            open_position: None,
            pending_action: None,
            close_attempt_count: 0,
            last_close_reason: String::new(),
            baseline_equity_usdt: None,
            last_candle_open_time_ms: None,
            updated_at: Utc::now(),
        }
    }
}

/// Result of reconciling local state against the live exchange position.
#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub mismatch: bool,
    pub exchange_position: Option<Position>,
    pub local_position: Option<Position>,
    pub state: RuntimeState,
    pub reason: String,
}

/// JSON-backed state store for crash recovery.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load state from disk, initializing defaults on first run.
    ///
    /// A corrupt or unreadable file is logged and treated as a cold start;
    /// state corruption never takes the process down.
    pub async fn load(&self) -> anyhow::Result<RuntimeState> {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<RuntimeState>(&raw) {
                Ok(state) => Ok(state),
                Err(err) => {
                    error!(
                        "state file {} is corrupt ({err}), starting from defaults",
                        self.path.display()
                    );
                    let mut state = RuntimeState::default();
                    self.save(&mut state).await?;
                    Ok(state)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut state = RuntimeState::default();
                self.save(&mut state).await?;
                Ok(state)
            }
            Err(err) => {
                error!(
                    "failed reading state file {} ({err}), starting from defaults",
                    self.path.display()
                );
                let mut state = RuntimeState::default();
                self.save(&mut state).await?;
                Ok(state)
            }
        }
    }

    /// Persist state atomically: stamp `updated_at`, write a temp file,
    /// rename over the real path.
    pub async fn save(&self, state: &mut RuntimeState) -> anyhow::Result<()> {
        state.updated_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn set_halted(&self, halted: bool, reason: &str) -> anyhow::Result<RuntimeState> {
        let mut state = self.load().await?;
        state.halted = halted;
        state.halt_reason = reason.to_string();
        self.save(&mut state).await?;
        Ok(state)
    }

    pub async fn set_open_position(
        &self,
        position: Option<Position>,
    ) -> anyhow::Result<RuntimeState> {
        let mut state = self.load().await?;
        state.open_position = position;
        self.save(&mut state).await?;
        Ok(state)
    }

    pub async fn set_baseline_equity(
        &self,
        equity_usdt: Option<f64>,
    ) -> anyhow::Result<RuntimeState> {
        let mut state = self.load().await?;
        state.baseline_equity_usdt = equity_usdt;
        self.save(&mut state).await?;
        Ok(state)
    }

    pub async fn set_last_candle_open_time_ms(
        &self,
        ts_ms: Option<i64>,
    ) -> anyhow::Result<RuntimeState> {
        let mut state = self.load().await?;
        state.last_candle_open_time_ms = ts_ms;
        self.save(&mut state).await?;
        Ok(state)
    }

    /// Side equality plus quantity-within-tolerance comparison.
    fn positions_mismatch(local: Option<&Position>, exchange: Option<&Position>) -> bool {
        match (local, exchange) {
            (None, None) => false,
            (Some(local), Some(exchange)) => {
                local.side != exchange.side
                    || (local.amount_base - exchange.amount_base).abs() > RECONCILE_QTY_TOLERANCE
            }
            _ => true,
        }
    }

    /// Reconcile local state with the live exchange position.
    ///
    /// The exchange is the source of truth: on any mismatch the local
    /// position is overwritten with the exchange's view and persisted before
    /// this returns. Must run at startup before any trading decision.
    pub async fn reconcile<E: Exchange>(
        &self,
        exchange: &E,
        symbol: &str,
    ) -> anyhow::Result<ReconcileResult> {
        let mut state = self.load().await?;
        let local_position = state.open_position.clone();

        let exchange_position = exchange.get_open_position(symbol).await?;
        let mismatch = Self::positions_mismatch(local_position.as_ref(), exchange_position.as_ref());

        let reason = if mismatch {
            warn!(
                "position mismatch on {symbol}: local={local_position:?} exchange={exchange_position:?}, adopting exchange view"
            );
            state.open_position = exchange_position.clone();
            self.save(&mut state).await?;
            "position_mismatch_reconciled"
        } else {
            info!("positions match on {symbol}");
            "positions_match"
        };

        Ok(ReconcileResult {
            mismatch,
            exchange_position,
            local_position,
            state,
            reason: reason.to_string(),
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os_string = self.path.clone().into_os_string();
        os_string.push(".tmp");
        PathBuf::from(os_string)
    }
}
