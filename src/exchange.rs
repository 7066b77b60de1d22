//! Exchange collaborator contract
//!
//! The runtime core never talks to a venue directly; it consumes this trait.
//! The production implementation is [`crate::client::ExchangeClient`]; tests
//! drive the closer and reconciler through scripted mocks.

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{MarketLimits, OrderAck, OrderBookSnapshot, Position, Side};

/// Read/write operations the runtime needs from a derivatives venue.
///
/// Read methods return `Ok(None)` when the venue has no data for the query
/// (no open position, unknown symbol); transport and decode failures are
/// `Err`. The closing loop treats both the same way: as a transient
/// no-progress event, never as a reason to abort outright.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// The live open position for `symbol`, if any.
    async fn get_open_position(&self, symbol: &str) -> anyhow::Result<Option<Position>>;

    /// Side-appropriate reference price (ask for a buy, bid for a sell,
    /// with venue-specific fallbacks).
    async fn get_reference_price(&self, symbol: &str, side: Side)
        -> anyhow::Result<Option<f64>>;

    /// Order book snapshot truncated to `depth` levels per side.
    async fn get_order_book(
        &self,
        symbol: &str,
        depth: u32,
    ) -> anyhow::Result<Option<OrderBookSnapshot>>;

    /// Sizing constraints for `symbol`.
    async fn get_market_limits(&self, symbol: &str) -> anyhow::Result<Option<MarketLimits>>;

    /// Raw account summary document; equity is extracted from it by
    /// [`crate::client::extract_equity`].
    async fn get_account_summary(&self) -> anyhow::Result<Option<Value>>;

    /// Submit a market order opening or extending exposure.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        client_order_id: u32,
    ) -> anyhow::Result<OrderAck>;

    /// Submit a reduce-only market order. `client_order_id` is the
    /// idempotency token: unique per real submission attempt so venue-side
    /// retries cannot double-execute.
    async fn place_reduce_only_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        client_order_id: u32,
    ) -> anyhow::Result<OrderAck>;
}
