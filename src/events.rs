// 11.0: events crossing the engine boundary.
// inbound: sequenced exchange events and settled transfers.
// outbound: EngineEvent, the audit trail of alerts and diagnostics the coordinator keeps.

use crate::order::Liquidity;
use crate::types::{Amount, CorrelationId, ExchangeOrderId, Price, Sequence, Side, Symbol, Timestamp, Token};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// how an exchange event names the order it talks about. either half may be missing
// (rejects can arrive before an exchange id exists, foreign orders carry no client id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub client_id: Option<CorrelationId>,
}

impl OrderRef {
    pub fn new(exchange_order_id: ExchangeOrderId, client_id: Option<CorrelationId>) -> Self {
        Self {
            exchange_order_id: Some(exchange_order_id),
            client_id,
        }
    }

    pub fn client(client_id: CorrelationId) -> Self {
        Self {
            exchange_order_id: None,
            client_id: Some(client_id),
        }
    }
}

// 11.1: one event from the exchange stream. sequence is monotonic per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEvent {
    pub symbol: Symbol,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub kind: ExchangeEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeEventKind {
    OrderAcknowledged {
        order: OrderRef,
    },
    OrderFilled {
        order: OrderRef,
        side: Side,
        quantity: Decimal,
        price: Price,
        fee: Amount,
        liquidity: Liquidity,
    },
    OrderCancelled {
        order: OrderRef,
    },
    OrderRejected {
        order: OrderRef,
        reason: String,
    },
    OrderExpired {
        order: OrderRef,
    },
    // positive amount = received, negative = paid
    FundingApplied {
        rate: Decimal,
        amount: Amount,
    },
}

impl ExchangeEventKind {
    pub fn order_ref(&self) -> Option<&OrderRef> {
        match self {
            ExchangeEventKind::OrderAcknowledged { order }
            | ExchangeEventKind::OrderFilled { order, .. }
            | ExchangeEventKind::OrderCancelled { order }
            | ExchangeEventKind::OrderRejected { order, .. }
            | ExchangeEventKind::OrderExpired { order } => Some(order),
            ExchangeEventKind::FundingApplied { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExchangeEventKind::OrderAcknowledged { .. } => "ack",
            ExchangeEventKind::OrderFilled { .. } => "fill",
            ExchangeEventKind::OrderCancelled { .. } => "cancel",
            ExchangeEventKind::OrderRejected { .. } => "reject",
            ExchangeEventKind::OrderExpired { .. } => "expire",
            ExchangeEventKind::FundingApplied { .. } => "funding",
        }
    }
}

// 11.2: settled on-chain transfer, reported by the blockchain collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Deposit,
    Withdrawal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettled {
    pub token: Token,
    pub amount: Amount,
    pub direction: TransferDirection,
    pub tx_hash: String,
}

impl TransferSettled {
    // signed change to the token total
    pub fn delta(&self) -> Amount {
        match self.direction {
            TransferDirection::Deposit => self.amount.abs(),
            TransferDirection::Withdrawal => self.amount.abs().negate(),
        }
    }
}

// 11.3: audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn new(id: EventId, timestamp: Timestamp, kind: EngineEventKind) -> Self {
        Self { id, timestamp, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StaleReason {
    /// Sequence already applied.
    Duplicate,
    /// Gap gave up waiting; these sequences will never be applied.
    GapLost { from: Sequence, to: Sequence },
    /// A sequence previously declared lost showed up after all.
    LateArrival,
    /// Arrived below the first sequence seen; applied, then re-synced.
    BeforeBaseline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEventKind {
    StaleEvent {
        symbol: Symbol,
        sequence: Sequence,
        reason: StaleReason,
    },
    ResyncRequested {
        symbol: Option<Symbol>,
        reason: String,
    },
    UnmatchedFill {
        symbol: Symbol,
        exchange_order_id: Option<ExchangeOrderId>,
        side: Side,
        quantity: Decimal,
        price: Price,
    },
    Overfill {
        correlation_id: CorrelationId,
        quantity: Decimal,
        remaining: Decimal,
    },
    BalanceDivergence {
        token: Token,
        local: Amount,
        exchange: Amount,
        confirmed: bool,
    },
    OrderMissingOnExchange {
        correlation_id: CorrelationId,
        confirmed: bool,
    },
    UnknownExchangeOrder {
        symbol: Symbol,
        exchange_order_id: ExchangeOrderId,
    },
    OrphanSwept {
        correlation_id: CorrelationId,
        exchange_cancel: bool,
    },
    BreakerTripped {
        equity: Amount,
        high_water_mark: Amount,
        drawdown: Decimal,
    },
    BreakerReset {
        equity: Amount,
    },
    Halted {
        token: Token,
        symbols: Vec<Symbol>,
        reason: String,
    },
    HaltCleared {
        token: Token,
    },
    InventoryLimitWarning {
        symbol: Symbol,
        utilization: Decimal,
    },
    CommandFailed {
        correlation_id: CorrelationId,
        reason: String,
    },
}

impl EngineEventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EngineEventKind::BreakerTripped { .. } | EngineEventKind::Halted { .. } => Severity::Critical,
            EngineEventKind::StaleEvent {
                reason: StaleReason::Duplicate,
                ..
            }
            | EngineEventKind::BreakerReset { .. }
            | EngineEventKind::HaltCleared { .. }
            | EngineEventKind::OrphanSwept { .. } => Severity::Info,
            _ => Severity::Warning,
        }
    }
}
