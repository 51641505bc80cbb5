//! Exchange client abstraction.
//!
//! The engine talks to an exchange only through `ExchangeClient`. The live wire client
//! (signing, REST/WS transport) lives outside this crate; `sim::SimulatedExchange` is the
//! in-crate implementation used for backtests and tests.

use crate::events::ExchangeEvent;
use crate::order::{Order, OrderKind, OrderStatus};
use crate::types::{Amount, CorrelationId, ExchangeOrderId, Price, Side, Symbol, Timestamp, Token};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// New order as sent over the wire. `client_id` is reused on every retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub client_id: CorrelationId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Price>,
    pub kind: OrderKind,
    pub reduce_only: bool,
}

impl PlaceOrderRequest {
    pub fn from_order(order: &Order) -> Self {
        Self {
            client_id: order.correlation_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: order.price,
            kind: order.kind,
            reduce_only: order.reduce_only,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceAck {
    pub exchange_order_id: ExchangeOrderId,
}

/// Cancels are fire-and-confirm: the terminal state arrives on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Accepted,
    /// Already filled, cancelled or expired on the exchange.
    AlreadyGone,
}

/// One resting order as the exchange reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrderSnapshot {
    pub exchange_order_id: ExchangeOrderId,
    pub client_id: Option<CorrelationId>,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub token: Token,
    pub total: Amount,
}

/// Answer to a status re-query after a timed-out write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub exchange_order_id: ExchangeOrderId,
    pub client_id: CorrelationId,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
}

/// Open orders and balances taken together, the unit reconciliation compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub open_orders: Vec<OpenOrderSnapshot>,
    pub balances: Vec<BalanceSnapshot>,
    pub taken_at: Timestamp,
}

impl ExchangeSnapshot {
    pub fn balance(&self, token: &Token) -> Option<Amount> {
        self.balances.iter().find(|b| &b.token == token).map(|b| b.total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rejected by exchange: {0}")]
    Rejected(String),

    #[error("Order not known to exchange")]
    UnknownOrder,

    #[error("Rate limited")]
    RateLimited,
}

impl ExchangeError {
    /// Timeouts, transport faults and rate limits may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout | ExchangeError::Transport(_) | ExchangeError::RateLimited
        )
    }
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, request: PlaceOrderRequest) -> Result<PlaceAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &Symbol, exchange_order_id: ExchangeOrderId) -> Result<CancelAck, ExchangeError>;

    async fn query_open_orders(&self) -> Result<Vec<OpenOrderSnapshot>, ExchangeError>;

    async fn query_balances(&self) -> Result<Vec<BalanceSnapshot>, ExchangeError>;

    /// Look up an order by client id. `None` when the exchange never saw it.
    async fn query_order(&self, client_id: CorrelationId) -> Result<Option<OrderStatusReport>, ExchangeError>;

    /// Sequenced event stream. Each call opens a fresh subscription.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ExchangeEvent>, ExchangeError>;
}
