//! Perp Runner Library
//!
//! Trading runtime for a derivatives account: risk-gated entries, a
//! liquidity-aware adaptive position closer, crash-recoverable state with
//! exchange reconciliation, and a single-instance runtime lock.

pub mod alerts;
pub mod client;
pub mod closer;
pub mod config;
pub mod exchange;
pub mod lock;
pub mod risk;
pub mod runner;
pub mod state;
pub mod types;

// Re-export main types for convenience
pub use alerts::{AlertLevel, Alerter, LogAlerter};
pub use client::ExchangeClient;
pub use closer::{AdaptiveCloser, CloseCode, CloseResult};
pub use config::Config;
pub use exchange::Exchange;
pub use lock::{LockError, RuntimeLock};
pub use risk::{RiskAction, RiskCode, RiskDecision, RiskEngine};
pub use runner::{BotRunner, IdleSignalSource, SignalSource};
pub use state::{ReconcileResult, RuntimeState, StateStore};
pub use types::{MarketLimits, OrderBookSnapshot, Position, Side, Signal};
