// 8.0.2: result types and errors for coordinator operations.

use crate::config::ConfigError;
use crate::events::EngineEvent;
use crate::exchange::{CancelAck, ExchangeError, OrderStatusReport, PlaceAck, PlaceOrderRequest};
use crate::inventory::{Balance, LedgerError};
use crate::journal::JournalError;
use crate::order::Order;
use crate::position::Position;
use crate::registry::RegistryError;
use crate::risk::{BreakerState, RiskRejection};
use crate::types::{Amount, CorrelationId, ExchangeOrderId, Symbol, Token};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown market {0}")]
    UnknownMarket(Symbol),

    #[error("Risk rejection: {0}")]
    Risk(#[from] RiskRejection),

    #[error("Order registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Inventory error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fill for untracked order on {symbol} ({exchange_order_id:?})")]
    UnmatchedFill {
        symbol: Symbol,
        exchange_order_id: Option<ExchangeOrderId>,
    },

    #[error("Engine is not running")]
    Stopped,
}

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never reached the exchange. Surface to the caller, don't retry.
    Rejection,
    /// Timeout or transport. Reads retry with backoff, writes only after a status re-query.
    Transient,
    /// Local and exchange views disagree. Alert and re-sync.
    Consistency,
    /// Books are wrong. Halt the affected token.
    Fatal,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::UnknownMarket(_) | EngineError::Risk(_) => ErrorClass::Rejection,
            EngineError::Registry(e) => match e {
                RegistryError::DuplicateIntent(_)
                | RegistryError::UnknownOrder(_)
                | RegistryError::AlreadyTerminal(..) => ErrorClass::Rejection,
                RegistryError::IllegalTransition { .. }
                | RegistryError::ConflictingExchangeId { .. }
                | RegistryError::Overfill { .. } => ErrorClass::Consistency,
            },
            EngineError::Ledger(e) if e.is_fatal() => ErrorClass::Fatal,
            EngineError::Ledger(_) => ErrorClass::Rejection,
            EngineError::Exchange(e) if e.is_transient() => ErrorClass::Transient,
            EngineError::Exchange(_) => ErrorClass::Rejection,
            EngineError::UnmatchedFill { .. } => ErrorClass::Consistency,
            EngineError::Journal(_) | EngineError::Config(_) | EngineError::Stopped => ErrorClass::Fatal,
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.class() == ErrorClass::Rejection
    }
}

/// Work the coordinator wants done against the exchange. Drained by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeCommand {
    Place(PlaceOrderRequest),
    /// `correlation_id` is `None` for orders the registry never knew.
    Cancel {
        correlation_id: Option<CorrelationId>,
        symbol: Symbol,
        exchange_order_id: ExchangeOrderId,
    },
    QueryOrder(CorrelationId),
    /// Fetch open orders and balances and feed them to reconciliation.
    Resync,
}

/// What came back from a dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Placed {
        correlation_id: CorrelationId,
        result: Result<PlaceAck, ExchangeError>,
    },
    Cancelled {
        correlation_id: Option<CorrelationId>,
        exchange_order_id: ExchangeOrderId,
        result: Result<CancelAck, ExchangeError>,
    },
    StatusQueried {
        correlation_id: CorrelationId,
        result: Result<Option<OrderStatusReport>, ExchangeError>,
    },
}

/// Point-in-time view for callers outside the engine loop.
#[derive(Debug, Clone)]
pub struct EngineSummary {
    pub equity: Amount,
    pub balances: Vec<(Token, Balance)>,
    pub positions: Vec<Position>,
    pub live_orders: Vec<Order>,
    pub breaker: BreakerState,
    pub halted_tokens: Vec<Token>,
    pub recent_events: Vec<EngineEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Token;

    #[test]
    fn error_classes() {
        assert_eq!(EngineError::Risk(RiskRejection::CircuitBreakerTripped).class(), ErrorClass::Rejection);
        assert_eq!(EngineError::Exchange(ExchangeError::Timeout).class(), ErrorClass::Transient);
        assert_eq!(
            EngineError::Registry(RegistryError::Overfill {
                id: CorrelationId(1),
                quantity: rust_decimal::Decimal::ONE,
                remaining: rust_decimal::Decimal::ZERO,
            })
            .class(),
            ErrorClass::Consistency
        );
        let negative = LedgerError::NegativeBalance {
            token: Token::new("USDC"),
            operation: "funding",
            free: Amount::zero(),
            delta: Amount::new(rust_decimal::Decimal::NEGATIVE_ONE),
        };
        assert_eq!(EngineError::Ledger(negative).class(), ErrorClass::Fatal);
    }
}
