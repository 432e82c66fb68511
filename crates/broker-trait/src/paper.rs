use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::{OrderFill, OrderRequest, OrderSide, OrderSink, Position, PositionSource};

#[derive(Default)]
struct PaperState {
    /// account -> symbol -> position
    positions: HashMap<String, HashMap<String, Position>>,
    equity: HashMap<String, f64>,
    fills: Vec<OrderFill>,
}

/// In-memory simulated broker.
///
/// Fills every order immediately at its price hint (or the position's reference price),
/// moved against the trader by `slippage_bps`, and books the fill into its own positions.
/// Latency, failing symbols and an unavailable position feed can be injected for tests.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    default_equity: f64,
    slippage_bps: f64,
    latency: Option<Duration>,
    failing_symbols: HashSet<String>,
    positions_unavailable: bool,
}

impl PaperBroker {
    pub fn new(default_equity: f64) -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            default_equity,
            slippage_bps: 0.0,
            latency: None,
            failing_symbols: HashSet::new(),
            positions_unavailable: false,
        }
    }

    pub fn with_position(mut self, account_id: &str, position: Position) -> Self {
        self.state
            .get_mut()
            .positions
            .entry(account_id.to_string())
            .or_default()
            .insert(position.symbol.clone(), position);
        self
    }

    pub fn with_equity(mut self, account_id: &str, equity: f64) -> Self {
        self.state
            .get_mut()
            .equity
            .insert(account_id.to_string(), equity);
        self
    }

    pub fn with_slippage_bps(mut self, bps: f64) -> Self {
        self.slippage_bps = bps;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn failing_symbol(mut self, symbol: &str) -> Self {
        self.failing_symbols.insert(symbol.to_string());
        self
    }

    pub fn with_positions_unavailable(mut self) -> Self {
        self.positions_unavailable = true;
        self
    }

    /// Replace (or remove, with quantity 0) a position after construction.
    pub async fn set_position(&self, account_id: &str, position: Position) {
        let mut state = self.state.lock().await;
        let book = state.positions.entry(account_id.to_string()).or_default();
        if position.is_flat() {
            book.remove(&position.symbol);
        } else {
            book.insert(position.symbol.clone(), position);
        }
    }

    pub async fn fills(&self) -> Vec<OrderFill> {
        self.state.lock().await.fills.clone()
    }

    fn fill_price(&self, side: OrderSide, reference: f64) -> f64 {
        let adverse = 1.0 + side.sign() * self.slippage_bps / 10_000.0;
        reference * adverse
    }
}

#[async_trait]
impl PositionSource for PaperBroker {
    async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>> {
        if self.positions_unavailable {
            bail!("paper broker: position feed unavailable");
        }
        let state = self.state.lock().await;
        let mut positions: Vec<Position> = state
            .positions
            .get(account_id)
            .map(|book| book.values().cloned().collect())
            .unwrap_or_default();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn account_equity(&self, account_id: &str) -> Result<f64> {
        let state = self.state.lock().await;
        Ok(state
            .equity
            .get(account_id)
            .copied()
            .unwrap_or(self.default_equity))
    }
}

#[async_trait]
impl OrderSink for PaperBroker {
    async fn submit_order(&self, account_id: &str, order: OrderRequest) -> Result<OrderFill> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing_symbols.contains(&order.symbol) {
            bail!("paper broker rejected order for {}", order.symbol);
        }
        if order.qty <= Decimal::ZERO {
            bail!("order quantity must be positive, got {}", order.qty);
        }

        let mut state = self.state.lock().await;
        let book = state.positions.entry(account_id.to_string()).or_default();
        let existing = book.get(&order.symbol).cloned();

        let reference = order
            .price_hint
            .and_then(|p| p.to_f64())
            .filter(|p| *p > 0.0)
            .or_else(|| existing.as_ref().and_then(|p| p.reference_price()))
            .ok_or_else(|| anyhow!("no price available for {}", order.symbol))?;
        let price = self.fill_price(order.side, reference);
        let qty = order.qty_f64();

        let mut position = existing.unwrap_or_else(|| Position::new(&order.symbol, 0.0, price));
        let signed = order.side.sign() * qty;
        let new_qty = position.quantity + signed;
        // Average cost only moves when exposure grows on the same side.
        if position.is_flat() || position.quantity.signum() == signed.signum() {
            let total = position.abs_quantity() + qty;
            if total > 0.0 {
                position.avg_cost = (position.avg_cost * position.abs_quantity() + price * qty) / total;
            }
        } else if new_qty != 0.0 && new_qty.signum() != position.quantity.signum() {
            position.avg_cost = price;
        }
        position.quantity = new_qty;
        position.current_price = Some(price);

        if position.is_flat() {
            book.remove(&order.symbol);
        } else {
            book.insert(order.symbol.clone(), position);
        }

        let fill = OrderFill {
            order_reference: format!("paper-{}", uuid::Uuid::new_v4()),
            symbol: order.symbol.clone(),
            side: order.side,
            filled_qty: order.qty,
            filled_price: Decimal::from_f64(price).unwrap_or_default(),
            filled_at: Utc::now(),
        };
        state.fills.push(fill.clone());

        tracing::debug!(
            "Paper fill {} {:?} {} @ {:.4}",
            fill.order_reference,
            order.side,
            order.symbol,
            price
        );

        Ok(fill)
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fill_opens_and_closes_position() {
        let broker = PaperBroker::new(100_000.0);

        let fill = broker
            .submit_order("acct", OrderRequest::buy("XYZ", dec!(10)).with_price_hint(dec!(50)))
            .await
            .unwrap();
        assert_eq!(fill.filled_price, dec!(50));

        let positions = broker.get_positions("acct").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 10.0);

        broker
            .submit_order("acct", OrderRequest::sell("XYZ", dec!(10)).with_price_hint(dec!(55)))
            .await
            .unwrap();
        assert!(broker.get_positions("acct").await.unwrap().is_empty());
        assert_eq!(broker.fills().await.len(), 2);
    }

    #[tokio::test]
    async fn test_slippage_moves_against_trader() {
        let broker = PaperBroker::new(100_000.0).with_slippage_bps(100.0);

        let buy = broker
            .submit_order("acct", OrderRequest::buy("XYZ", dec!(1)).with_price_hint(dec!(100)))
            .await
            .unwrap();
        assert!(buy.filled_price_f64() > 100.0);

        let sell = broker
            .submit_order("acct", OrderRequest::sell("ABC", dec!(1)).with_price_hint(dec!(100)))
            .await
            .unwrap();
        assert!(sell.filled_price_f64() < 100.0);
    }

    #[tokio::test]
    async fn test_failing_symbol_and_missing_price() {
        let broker = PaperBroker::new(100_000.0).failing_symbol("BAD");

        let err = broker
            .submit_order("acct", OrderRequest::buy("BAD", dec!(1)).with_price_hint(dec!(1)))
            .await;
        assert!(err.is_err());

        let err = broker
            .submit_order("acct", OrderRequest::buy("NOPRICE", dec!(1)))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_equity_defaults_per_account() {
        let broker = PaperBroker::new(50_000.0).with_equity("rich", 1_000_000.0);
        assert_eq!(broker.account_equity("rich").await.unwrap(), 1_000_000.0);
        assert_eq!(broker.account_equity("other").await.unwrap(), 50_000.0);
    }
}
