//! Order types and the per-order lifecycle state machine.
//!
//! An order is born `Pending` when the coordinator accepts an intent, becomes `Open` once
//! the exchange acknowledges it and ends in exactly one terminal state. Transitions out of
//! a terminal state are never allowed.

use crate::types::{CorrelationId, ExchangeOrderId, Price, Side, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the spread an order intends to sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liquidity {
    /// Resting quote that earns the spread.
    Maker,
    /// Crosses the book for immediate execution.
    Taker,
}

/// Order kind. Market orders always take liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit(Liquidity),
}

impl OrderKind {
    pub fn is_taker(&self) -> bool {
        matches!(self, OrderKind::Market | OrderKind::Limit(Liquidity::Taker))
    }

    pub fn is_maker(&self) -> bool {
        matches!(self, OrderKind::Limit(Liquidity::Maker))
    }
}

/// Lifecycle state of a tracked order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted locally, not yet acknowledged by the exchange.
    Pending,
    /// Acknowledged, resting or executing.
    Open,
    /// Some quantity filled, remainder still working.
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// The transition table. Same-state moves are only legal for `PartiallyFilled`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Open | PartiallyFilled | Filled | Cancelled | Rejected | Expired) => true,
            (Open, PartiallyFilled | Filled | Cancelled | Expired) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Cancelled | Expired) => true,
            _ => false,
        }
    }
}

/// What a caller (or the quote engine) wants to trade. Never sent to the exchange
/// until risk and inventory have accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Price>,
    pub kind: OrderKind,
    pub reduce_only: bool,
}

impl OrderIntent {
    pub fn limit(symbol: Symbol, side: Side, quantity: Decimal, price: Price, liquidity: Liquidity) -> Self {
        Self {
            symbol,
            side,
            quantity,
            price: Some(price),
            kind: OrderKind::Limit(liquidity),
            reduce_only: false,
        }
    }

    pub fn market(symbol: Symbol, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol,
            side,
            quantity,
            price: None,
            kind: OrderKind::Market,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Two intents collide when symbol, side, price and quantity all match.
    pub fn same_terms(&self, symbol: &Symbol, side: Side, price: Option<Price>, quantity: Decimal) -> bool {
        &self.symbol == symbol && self.side == side && self.price == price && self.quantity == quantity
    }
}

/// A tracked order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub correlation_id: CorrelationId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Price>,
    pub price: Option<Price>,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Set while a cancel is in flight. The status stays put until the exchange confirms.
    pub cancel_requested_at: Option<Timestamp>,
    pub reject_reason: Option<String>,
}

impl Order {
    pub fn from_intent(correlation_id: CorrelationId, intent: &OrderIntent, timestamp: Timestamp) -> Self {
        Self {
            correlation_id,
            exchange_order_id: None,
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: intent.quantity,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            price: intent.price,
            kind: intent.kind,
            reduce_only: intent.reduce_only,
            status: OrderStatus::Pending,
            created_at: timestamp,
            updated_at: timestamp,
            cancel_requested_at: None,
            reject_reason: None,
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn cancel_in_flight(&self) -> bool {
        self.cancel_requested_at.is_some() && self.is_live()
    }

    /// Records a fill and returns the resulting status. Caller checks the quantity first.
    pub(crate) fn record_fill(&mut self, quantity: Decimal, price: Price, timestamp: Timestamp) -> OrderStatus {
        debug_assert!(quantity <= self.remaining_quantity(), "cannot fill more than remaining");

        let prior_notional = self
            .average_fill_price
            .map(|p| p.value() * self.filled_quantity)
            .unwrap_or(Decimal::ZERO);
        self.filled_quantity += quantity;
        if self.filled_quantity > Decimal::ZERO {
            let avg = (prior_notional + price.value() * quantity) / self.filled_quantity;
            self.average_fill_price = Price::new(avg);
        }

        self.status = if self.remaining_quantity().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = timestamp;
        self.status
    }
}
