//! Scripted Exchange mock for testing without external dependencies

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use perp_runner::exchange::Exchange;
use perp_runner::types::{
    BookLevel, MarketLimits, OrderAck, OrderBookSnapshot, Position, Side,
};

/// One order captured by the mock.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub client_order_id: u32,
    pub reduce_only: bool,
}

/// Exchange mock driven by scripted response sequences.
///
/// Each read pops the next scripted value; an exhausted sequence falls back
/// to the configured steady-state value. Orders are recorded, never
/// executed: position movement is scripted by the test.
pub struct MockExchange {
    position_script: Mutex<VecDeque<Option<Position>>>,
    steady_position: Option<Position>,
    book_script: Mutex<VecDeque<Option<OrderBookSnapshot>>>,
    steady_book: Option<OrderBookSnapshot>,
    reference_price: Option<f64>,
    market_limits: Option<MarketLimits>,
    account_summary: Option<Value>,
    pub orders: Arc<Mutex<Vec<PlacedOrder>>>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            position_script: Mutex::new(VecDeque::new()),
            steady_position: None,
            book_script: Mutex::new(VecDeque::new()),
            steady_book: None,
            reference_price: Some(100.0),
            market_limits: Some(MarketLimits {
                min_qty: Some(0.01),
                tick_size: Some(0.1),
                base_decimals: Some(3),
            }),
            account_summary: None,
            orders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_position_script(
        self,
        positions: impl IntoIterator<Item = Option<Position>>,
    ) -> Self {
        *self.position_script.lock().unwrap() = positions.into_iter().collect();
        self
    }

    pub fn with_steady_position(mut self, position: Option<Position>) -> Self {
        self.steady_position = position;
        self
    }

    pub fn with_book_script(
        self,
        books: impl IntoIterator<Item = Option<OrderBookSnapshot>>,
    ) -> Self {
        *self.book_script.lock().unwrap() = books.into_iter().collect();
        self
    }

    pub fn with_steady_book(mut self, book: Option<OrderBookSnapshot>) -> Self {
        self.steady_book = book;
        self
    }

    pub fn with_reference_price(mut self, price: Option<f64>) -> Self {
        self.reference_price = price;
        self
    }

    pub fn with_market_limits(mut self, limits: Option<MarketLimits>) -> Self {
        self.market_limits = limits;
        self
    }

    pub fn with_account_summary(mut self, summary: Option<Value>) -> Self {
        self.account_summary = summary;
        self
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.orders.lock().unwrap().clone()
    }

    /// Clone the order log handle for inspection after the mock is moved
    /// into a runner.
    pub fn orders_handle(&self) -> Arc<Mutex<Vec<PlacedOrder>>> {
        Arc::clone(&self.orders)
    }
}

/// Position helper for scripts.
pub fn position(side: Side, amount_base: f64) -> Position {
    Position {
        side,
        amount_base,
        entry_price: 2000.0,
        opened_at: Utc::now(),
    }
}

/// Book helper: one level per side.
pub fn book(bid: (f64, f64), ask: (f64, f64)) -> OrderBookSnapshot {
    OrderBookSnapshot {
        bids: vec![BookLevel {
            price: bid.0,
            qty: bid.1,
        }],
        asks: vec![BookLevel {
            price: ask.0,
            qty: ask.1,
        }],
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_open_position(&self, _symbol: &str) -> anyhow::Result<Option<Position>> {
        let mut script = self.position_script.lock().unwrap();
        Ok(match script.pop_front() {
            Some(scripted) => scripted,
            None => self.steady_position.clone(),
        })
    }

    async fn get_reference_price(
        &self,
        _symbol: &str,
        _side: Side,
    ) -> anyhow::Result<Option<f64>> {
        Ok(self.reference_price)
    }

    async fn get_order_book(
        &self,
        _symbol: &str,
        _depth: u32,
    ) -> anyhow::Result<Option<OrderBookSnapshot>> {
        let mut script = self.book_script.lock().unwrap();
        Ok(match script.pop_front() {
            Some(scripted) => scripted,
            None => self.steady_book.clone(),
        })
    }

    async fn get_market_limits(&self, _symbol: &str) -> anyhow::Result<Option<MarketLimits>> {
        Ok(self.market_limits.clone())
    }

    async fn get_account_summary(&self) -> anyhow::Result<Option<Value>> {
        Ok(self.account_summary.clone())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        client_order_id: u32,
    ) -> anyhow::Result<OrderAck> {
        self.orders.lock().unwrap().push(PlacedOrder {
            symbol: symbol.to_string(),
            side,
            qty,
            client_order_id,
            reduce_only: false,
        });
        Ok(OrderAck {
            order_id: Some(format!("ord-{client_order_id}")),
            client_order_id,
        })
    }

    async fn place_reduce_only_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        client_order_id: u32,
    ) -> anyhow::Result<OrderAck> {
        self.orders.lock().unwrap().push(PlacedOrder {
            symbol: symbol.to_string(),
            side,
            qty,
            client_order_id,
            reduce_only: true,
        });
        Ok(OrderAck {
            order_id: Some(format!("ord-{client_order_id}")),
            client_order_id,
        })
    }
}
