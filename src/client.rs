//! Exchange REST client
//!
//! Thin connectivity layer implementing [`Exchange`] over HTTP. Venue
//! payloads come in several historical shapes; each normalizer below is a
//! pure function over the raw document, tried strategies in a fixed priority
//! order, so the rest of the crate only ever sees typed values.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::exchange::Exchange;
use crate::types::{BookLevel, MarketLimits, OrderAck, OrderBookSnapshot, Position, Side};

/// Request timeout for all venue calls.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// HTTP client for the venue's REST API.
pub struct ExchangeClient {
    http: Client,
    base_url: String,
    api_key: String,
    sub_account_id: String,
}

impl ExchangeClient {
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sub_account_id: config.sub_account_id.clone(),
        })
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("GET {path} failed: {status} - {text}"))
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("POST {path} failed: {status} - {text}"))
        }
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        client_order_id: u32,
        reduce_only: bool,
    ) -> anyhow::Result<OrderAck> {
        let body = json!({
            "symbol": symbol,
            "side": side.as_str(),
            "order_type": "market",
            "size": qty,
            "client_order_id": client_order_id,
            "reduce_only": reduce_only,
            "sub_account_id": self.sub_account_id,
        });
        let response = self.post_json("/v1/orders", &body).await?;

        let order_id = extract_order_id(&response);
        match &order_id {
            Some(id) => info!("market order placed: {id} (client id {client_order_id})"),
            None => warn!("order accepted but no id in response: {response}"),
        }
        Ok(OrderAck {
            order_id,
            client_order_id,
        })
    }
}

#[async_trait]
impl Exchange for ExchangeClient {
    async fn get_open_position(&self, symbol: &str) -> anyhow::Result<Option<Position>> {
        let payload = self
            .get_json(&format!("/v1/positions?symbol={symbol}"))
            .await?;
        Ok(extract_position(&payload, symbol))
    }

    async fn get_reference_price(
        &self,
        symbol: &str,
        side: Side,
    ) -> anyhow::Result<Option<f64>> {
        let ticker = self.get_json(&format!("/v1/ticker/{symbol}")).await?;
        let price = extract_reference_price(&ticker, side);
        if price.is_none() {
            warn!("no usable reference price in ticker for {symbol}: {ticker}");
        }
        Ok(price)
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: u32,
    ) -> anyhow::Result<Option<OrderBookSnapshot>> {
        let payload = self
            .get_json(&format!("/v1/orderbook/{symbol}?depth={depth}"))
            .await?;
        Ok(extract_order_book(&payload, depth as usize))
    }

    async fn get_market_limits(&self, symbol: &str) -> anyhow::Result<Option<MarketLimits>> {
        let payload = self.get_json("/v1/markets").await?;
        let limits = extract_market_limits(&payload, symbol);
        debug!("market limits for {symbol}: {limits:?}");
        Ok(limits)
    }

    async fn get_account_summary(&self) -> anyhow::Result<Option<Value>> {
        Ok(Some(self.get_json("/v1/account").await?))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        client_order_id: u32,
    ) -> anyhow::Result<OrderAck> {
        self.submit_market_order(symbol, side, qty, client_order_id, false)
            .await
    }

    async fn place_reduce_only_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        client_order_id: u32,
    ) -> anyhow::Result<OrderAck> {
        self.submit_market_order(symbol, side, qty, client_order_id, true)
            .await
    }
}

/// Read a numeric field that venues serialize as either number or string.
fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_f64(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(value_as_f64)
}

/// Side-appropriate reference price with fallbacks.
///
/// A buy consumes asks, so its reference is the best ask; a sell mirrors
/// with the best bid. Either falls back to the last trade, then the mark.
pub fn extract_reference_price(ticker: &Value, side: Side) -> Option<f64> {
    let preferred = match side {
        Side::Buy => "best_ask_price",
        Side::Sell => "best_bid_price",
    };
    field_f64(ticker, preferred)
        .or_else(|| field_f64(ticker, "last_price"))
        .or_else(|| field_f64(ticker, "mark_price"))
        .filter(|price| *price > 0.0)
}

/// Last-trade price with fallbacks across known ticker shapes.
pub fn extract_last_price(ticker: &Value) -> Option<f64> {
    field_f64(ticker, "last")
        .or_else(|| field_f64(ticker, "last_price"))
        .or_else(|| ticker.get("result").and_then(|r| field_f64(r, "last_price")))
        .filter(|price| *price > 0.0)
}

/// Account equity, tried in priority order across known summary shapes.
pub fn extract_equity(summary: &Value) -> Option<f64> {
    field_f64(summary, "total_equity")
        .or_else(|| field_f64(summary, "equity"))
        .or_else(|| {
            summary
                .get("result")
                .and_then(|r| field_f64(r, "total_equity"))
        })
        .or_else(|| field_f64(summary, "portfolio_value"))
        .or_else(|| summary.get("total").and_then(|t| field_f64(t, "USDT")))
        .filter(|equity| *equity > 0.0)
}

/// Sizing constraints from the markets listing.
///
/// The listing is either a `{symbol: entry}` map or an array of entries
/// keyed by an `instrument` field.
pub fn extract_market_limits(markets: &Value, symbol: &str) -> Option<MarketLimits> {
    let entry = match markets {
        Value::Object(map) => match map.get(symbol) {
            Some(entry) => Some(entry.clone()),
            None => {
                if let Some(result) = map.get("result") {
                    return extract_market_limits(result, symbol);
                }
                None
            }
        },
        Value::Array(entries) => entries
            .iter()
            .find(|e| {
                e.get("instrument").and_then(Value::as_str) == Some(symbol)
                    || e.get("symbol").and_then(Value::as_str) == Some(symbol)
            })
            .cloned(),
        _ => None,
    }?;

    Some(MarketLimits {
        min_qty: field_f64(&entry, "min_size").or_else(|| field_f64(&entry, "min_qty")),
        tick_size: field_f64(&entry, "tick_size"),
        base_decimals: entry
            .get("base_decimals")
            .and_then(Value::as_u64)
            .map(|d| d as u32),
    })
}

fn extract_levels(payload: &Value, key: &str, depth: usize) -> Vec<BookLevel> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    let entries = level.as_array()?;
                    Some(BookLevel {
                        price: value_as_f64(entries.first()?)?,
                        qty: value_as_f64(entries.get(1)?)?,
                    })
                })
                .take(depth)
                .collect()
        })
        .unwrap_or_default()
}

/// Normalize `[[price, size], ...]` arrays into typed levels.
pub fn extract_order_book(payload: &Value, depth: usize) -> Option<OrderBookSnapshot> {
    let book = OrderBookSnapshot {
        bids: extract_levels(payload, "bids", depth),
        asks: extract_levels(payload, "asks", depth),
    };
    if book.bids.is_empty() && book.asks.is_empty() {
        return None;
    }
    Some(book)
}

/// Normalize one position entry for `symbol` out of the positions listing.
///
/// Accepts `{positions: [...]}` wrappers or a bare array; side comes from an
/// explicit field or the sign of a `contracts` quantity. A zero quantity is
/// no position.
pub fn extract_position(payload: &Value, symbol: &str) -> Option<Position> {
    let entries = payload
        .get("positions")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array())
        .cloned()
        .unwrap_or_else(|| vec![payload.clone()]);

    let entry = entries.iter().find(|e| {
        e.get("symbol").and_then(Value::as_str) == Some(symbol)
            || e.get("instrument").and_then(Value::as_str) == Some(symbol)
    })?;

    let signed_contracts = field_f64(entry, "contracts");
    let side = entry
        .get("side")
        .and_then(Value::as_str)
        .and_then(Side::parse)
        .or_else(|| {
            signed_contracts.and_then(|contracts| {
                if contracts > 0.0 {
                    Some(Side::Buy)
                } else if contracts < 0.0 {
                    Some(Side::Sell)
                } else {
                    None
                }
            })
        })?;

    let amount_base = field_f64(entry, "amount_base")
        .or_else(|| field_f64(entry, "size"))
        .or(signed_contracts)
        .map(f64::abs)?;
    if amount_base <= 0.0 {
        return None;
    }

    Some(Position {
        side,
        amount_base,
        entry_price: field_f64(entry, "entry_price")
            .or_else(|| field_f64(entry, "avg_entry_price"))
            .unwrap_or(0.0),
        opened_at: chrono::Utc::now(),
    })
}

/// Order id across ack shapes: nested result first, then flat fields.
pub fn extract_order_id(response: &Value) -> Option<String> {
    response
        .get("result")
        .and_then(|r| r.get("order_id"))
        .or_else(|| response.get("order_id"))
        .or_else(|| response.get("id"))
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}
