use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod paper;

pub use paper::PaperBroker;

// ---------------------------------------------------------------------------
// Broker-owned read model
// ---------------------------------------------------------------------------

/// A holding as reported by the broker. Positive quantity is long, negative is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_cost: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub current_price: Option<f64>,
}

impl Position {
    pub fn new(symbol: impl Into<String>, quantity: f64, avg_cost: f64) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            avg_cost,
            unrealized_pnl: 0.0,
            current_price: None,
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0.0
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    pub fn abs_quantity(&self) -> f64 {
        self.quantity.abs()
    }

    /// Best known price: the live mark if present, otherwise average cost.
    pub fn reference_price(&self) -> Option<f64> {
        self.current_price
            .or(Some(self.avg_cost))
            .filter(|p| p.is_finite() && *p > 0.0)
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: OrderSide,
    /// Limit / reference price; brokers may ignore it for market orders.
    pub price_hint: Option<Decimal>,
    /// Caller-side reference, e.g. the signal id.
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn buy(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: OrderSide::Buy,
            price_hint: None,
            client_order_id: None,
        }
    }

    pub fn sell(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: OrderSide::Sell,
            price_hint: None,
            client_order_id: None,
        }
    }

    pub fn with_price_hint(mut self, price: Decimal) -> Self {
        self.price_hint = Some(price);
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    pub fn qty_f64(&self) -> f64 {
        self.qty.to_f64().unwrap_or(0.0)
    }
}

/// Broker acknowledgement of a filled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_reference: String,
    pub symbol: String,
    pub side: OrderSide,
    pub filled_qty: Decimal,
    pub filled_price: Decimal,
    pub filled_at: DateTime<Utc>,
}

impl OrderFill {
    pub fn filled_price_f64(&self) -> f64 {
        self.filled_price.to_f64().unwrap_or(0.0)
    }

    pub fn filled_qty_f64(&self) -> f64 {
        self.filled_qty.to_f64().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Broker traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PositionSource: Send + Sync {
    /// All open positions for an account
    async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>>;

    /// Account equity used for sizing new positions
    async fn account_equity(&self, account_id: &str) -> Result<f64>;
}

#[async_trait]
pub trait OrderSink: Send + Sync {
    /// Submit an order and wait for its fill
    async fn submit_order(&self, account_id: &str, order: OrderRequest) -> Result<OrderFill>;

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}
