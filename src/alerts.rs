//! Operational alerts
//!
//! The runtime classifies events and severities; delivery transports live
//! outside this crate. The shipped sink forwards to the log stream so an
//! operator tailing the process sees the same alert text a chat transport
//! would deliver.

use async_trait::async_trait;
use tracing::{error, info, warn};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

/// Sink for operator-facing events.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, message: &str, level: AlertLevel);
}

/// Log-backed alert sink.
pub struct LogAlerter {
    enabled: bool,
}

impl LogAlerter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, message: &str, level: AlertLevel) {
        if !self.enabled {
            return;
        }
        match level {
            AlertLevel::Info => info!(target: "alerts", "{message}"),
            AlertLevel::Warning => warn!(target: "alerts", "{message}"),
            AlertLevel::Error => error!(target: "alerts", "{message}"),
        }
    }
}
