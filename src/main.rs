//! Perp Runner - trading runtime for a single perpetual-futures account
//!
//! Startup order matters and is the safety story:
//! 1. Acquire the single-instance runtime lock
//! 2. Load persisted state and reconcile it against the exchange
//! 3. Only then start the trading loop (entries gated by the risk engine,
//!    exits driven by the adaptive closer)

use std::path::PathBuf;

use tracing::{info, warn};

use perp_runner::alerts::LogAlerter;
use perp_runner::client::ExchangeClient;
use perp_runner::config::Config;
use perp_runner::lock::RuntimeLock;
use perp_runner::runner::{BotRunner, IdleSignalSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("starting perp-runner (session {})", uuid::Uuid::new_v4());

    let config = match std::env::var("PERP_RUNNER_CONFIG") {
        Ok(path) => Config::load(&PathBuf::from(path))?,
        Err(_) => {
            let default_path = PathBuf::from("config/config.yaml");
            if default_path.exists() {
                Config::load(&default_path)?
            } else {
                warn!("no config file found, using defaults plus environment");
                Config::from_env()
            }
        }
    };
    config.validate()?;

    info!(
        "symbol={} leverage={}x order_size={} USDT track={}",
        config.trading.symbol,
        config.trading.leverage,
        config.trading.order_size_usdt,
        config.risk.active_track
    );
    if config.risk.kill_switch {
        warn!("risk kill-switch is enabled: no entries will be placed");
    }

    // Held for the lifetime of the process; released on drop.
    let mut lock = RuntimeLock::new(config.ops.lock_file.clone());
    lock.acquire()?;

    let exchange = ExchangeClient::new(&config.exchange)?;
    let alerter = LogAlerter::new(config.alerts.enabled);

    let runner = BotRunner::new(exchange, alerter, IdleSignalSource, config);
    let result = runner.run().await;

    lock.release();
    result
}
