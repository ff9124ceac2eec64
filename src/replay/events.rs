//! Event Model
//!
//! Market-data payloads and the message-queue families carried by the bus.
//!
//! Each family is an enum whose variants bind one event kind to exactly one
//! payload type, so consumers match exhaustively at the delivery boundary
//! and an order-book event can never carry a trade.

use crate::replay::clock::TimePoint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Price in quote currency.
pub type Price = f64;

/// Quantity in base currency.
pub type Quantity = f64;

/// A single price level in the order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Price,
    pub quantity: Quantity,
}

impl Level {
    #[inline]
    pub fn new(price: Price, quantity: Quantity) -> Self {
        Self { price, quantity }
    }
}

/// Order book snapshot or diff as received from the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Exchange event time (ms)
    pub timestamp: TimePoint,
    /// Local receive time (ms); this is the replay timestamp
    pub received_timestamp: TimePoint,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids
            .iter()
            .filter(|l| l.quantity > 0.0)
            .max_by(|a, b| a.price.total_cmp(&b.price))
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks
            .iter()
            .filter(|l| l.quantity > 0.0)
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    pub fn mid(&self) -> Option<Price> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / 2.0)
    }
}

/// Public trade print.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub price: Price,
    pub quantity: Quantity,
    pub is_buyer_maker: bool,
    /// Exchange trade time (ms)
    pub trade_timestamp: TimePoint,
    /// Exchange event time (ms)
    pub event_timestamp: TimePoint,
    /// Local receive time (ms); this is the replay timestamp
    pub received_timestamp: TimePoint,
}

/// Buy-then-sell plan emitted by the analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPlanInfo {
    pub max_buy_price: Price,
    pub quantity: Quantity,
    pub min_sell_price: Price,
    pub expiration_ts: TimePoint,
    pub expiration_buy_ts: TimePoint,
    pub expiration_sell_ts: TimePoint,
}

// =============================================================================
// MESSAGE-QUEUE FAMILIES
// =============================================================================

/// A named group of event kinds, each bound to one payload type.
///
/// Envelopes are cloned once per live subscription on publish.
pub trait MessageQueue: Clone + Send + fmt::Debug + 'static {
    /// Discriminant of the family's variants.
    type Kind: Copy + Eq + fmt::Debug + fmt::Display + Send + 'static;

    /// Family name for logging.
    const NAME: &'static str;

    fn kind(&self) -> Self::Kind;
}

/// Raw market stream from the exchange or a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MarketStreamEvent {
    OrderBookUpdate(OrderBook),
    NewTrade(Trade),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketStreamKind {
    OrderBookUpdate,
    NewTrade,
}

impl MarketStreamEvent {
    /// Local receive time, used as the replay timestamp.
    pub fn received_timestamp(&self) -> TimePoint {
        match self {
            MarketStreamEvent::OrderBookUpdate(book) => book.received_timestamp,
            MarketStreamEvent::NewTrade(trade) => trade.received_timestamp,
        }
    }
}

impl MessageQueue for MarketStreamEvent {
    type Kind = MarketStreamKind;
    const NAME: &'static str = "MarketStream";

    fn kind(&self) -> MarketStreamKind {
        match self {
            MarketStreamEvent::OrderBookUpdate(_) => MarketStreamKind::OrderBookUpdate,
            MarketStreamEvent::NewTrade(_) => MarketStreamKind::NewTrade,
        }
    }
}

impl fmt::Display for MarketStreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketStreamKind::OrderBookUpdate => write!(f, "order_book_update"),
            MarketStreamKind::NewTrade => write!(f, "new_trade"),
        }
    }
}

/// Maintained order book snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderBookStreamEvent {
    SnapshotAvailable(OrderBook),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderBookStreamKind {
    SnapshotAvailable,
}

impl MessageQueue for OrderBookStreamEvent {
    type Kind = OrderBookStreamKind;
    const NAME: &'static str = "OrderBookStream";

    fn kind(&self) -> OrderBookStreamKind {
        match self {
            OrderBookStreamEvent::SnapshotAvailable(_) => OrderBookStreamKind::SnapshotAvailable,
        }
    }
}

impl fmt::Display for OrderBookStreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderBookStreamKind::SnapshotAvailable => write!(f, "snapshot_available"),
        }
    }
}

/// Analyzer output.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerStreamEvent {
    NewOrderPlan(OrderPlanInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalyzerStreamKind {
    NewOrderPlan,
}

impl MessageQueue for AnalyzerStreamEvent {
    type Kind = AnalyzerStreamKind;
    const NAME: &'static str = "AnalyzerStream";

    fn kind(&self) -> AnalyzerStreamKind {
        match self {
            AnalyzerStreamEvent::NewOrderPlan(_) => AnalyzerStreamKind::NewOrderPlan,
        }
    }
}

impl fmt::Display for AnalyzerStreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalyzerStreamKind::NewOrderPlan => write!(f, "new_order_plan"),
        }
    }
}
