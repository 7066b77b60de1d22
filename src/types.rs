//! Core domain types shared across the runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order/position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side an order must take to reduce a position held on `self`.
    pub fn inverse(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Parse an exchange/signal side string ("buy"/"sell", case-insensitive).
    pub fn parse(value: &str) -> Option<Side> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" => Some(Side::Buy),
            "sell" | "short" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open position as reported by the exchange.
///
/// `amount_base` is always the exchange's reported absolute size. Once
/// reconciliation has run, the locally persisted copy is never a
/// locally-accumulated estimate.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub side: Side,
    pub amount_base: f64,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default = "Utc::now")]
    pub opened_at: DateTime<Utc>,
}

/// Exchange-reported sizing constraints for a symbol.
///
/// Fetched lazily and cached; staleness is tolerated since limits rarely
/// change intraday.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MarketLimits {
    pub min_qty: Option<f64>,
    pub tick_size: Option<f64>,
    pub base_decimals: Option<u32>,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Order book snapshot: bids descending, asks ascending.
///
/// Ephemeral; re-fetched on every closing-loop iteration and never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBookSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    /// Sum the liquidity the closer would consume within a slippage band.
    ///
    /// A buy-to-close consumes asks priced at or below
    /// `reference * (1 + bps/10_000)`; a sell-to-close consumes bids at or
    /// above `reference * (1 - bps/10_000)`.
    pub fn liquidity_within_band(
        &self,
        close_side: Side,
        reference_price: f64,
        max_slippage_bps: u32,
    ) -> f64 {
        let band = max_slippage_bps as f64 / 10_000.0;
        match close_side {
            Side::Buy => {
                let limit = reference_price * (1.0 + band);
                self.asks
                    .iter()
                    .filter(|level| level.price <= limit)
                    .map(|level| level.qty)
                    .sum()
            }
            Side::Sell => {
                let limit = reference_price * (1.0 - band);
                self.bids
                    .iter()
                    .filter(|level| level.price >= limit)
                    .map(|level| level.qty)
                    .sum()
            }
        }
    }
}

/// Normalized acknowledgement of a submitted order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderAck {
    pub order_id: Option<String>,
    pub client_order_id: u32,
}

/// Opaque trading signal consumed by the runner.
///
/// Signal generation itself lives outside this crate; the side arrives as
/// whatever string the strategy produced and is validated by the risk
/// engine's entry gate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Signal {
    pub side: String,
    pub amount_usdt: Option<f64>,
    #[serde(default)]
    pub reason: String,
}

/// Round a quantity to the exchange's base-asset precision.
///
/// Rounds half away from zero; quantities here are always positive so this
/// behaves as round-half-up, applied consistently wherever quantities meet
/// exchange precision.
pub fn round_to_decimals(qty: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (qty * factor).round() / factor
}
