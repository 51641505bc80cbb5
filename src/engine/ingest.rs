//! Exchange event ingestion.
//!
//! Every event goes through the sequencer first and is applied only when it is next in
//! line for its symbol. A fill is validated against the registry, the ledger and the
//! position book before any of them moves, then committed to all three together.

use super::core::ExecutionCoordinator;
use super::results::{EngineError, ErrorClass, ExchangeCommand};
use crate::events::{EngineEventKind, ExchangeEvent, ExchangeEventKind, OrderRef, StaleReason};
use crate::inventory::LedgerError;
use crate::journal::JournalRecord;
use crate::order::OrderStatus;
use crate::position::InventoryLimitStatus;
use crate::registry::RegistryError;
use crate::sequencer::{Released, SequenceDiagnostic};
use crate::types::{Amount, CorrelationId, ExchangeOrderId, Price, Side, Symbol};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

impl ExecutionCoordinator {
    // 8.4: single ingestion point for the exchange stream. returns how many events applied
    pub fn on_exchange_event(&mut self, event: ExchangeEvent) -> Result<usize, EngineError> {
        let released = self.sequencer.offer(event, self.current_time);
        self.process_released(released)
    }

    /// Give up on gaps that have waited too long.
    pub fn expire_sequence_gaps(&mut self) -> Result<usize, EngineError> {
        let released = self.sequencer.expire(self.current_time);
        self.process_released(released)
    }

    fn process_released(&mut self, released: Released) -> Result<usize, EngineError> {
        for diagnostic in released.diagnostics {
            self.on_sequence_diagnostic(diagnostic);
        }

        // the sequencer has already moved past the whole batch, so every event is applied
        // even when the journal stops taking them
        let mut applied = 0;
        let mut journal_failure = None;
        for event in released.ready {
            match self.apply_event(&event) {
                Ok(()) => applied += 1,
                Err(e) => self.on_apply_failure(&event, e),
            }
            // consumed either way; replay must see it to make the same decision
            if let Err(e) = self.record(JournalRecord::Exchange(event)) {
                journal_failure.get_or_insert(e);
            }
        }

        match journal_failure {
            Some(e) => {
                self.on_journal_failure(&e);
                Err(e)
            }
            None => Ok(applied),
        }
    }

    // state is ahead of the journal: stop trading and have the exchange confirm everything
    fn on_journal_failure(&mut self, error: &EngineError) {
        let reason = format!("journal unavailable: {error}");
        self.halt_all(&reason);
        self.request_resync(None, &reason);
    }

    fn on_sequence_diagnostic(&mut self, diagnostic: SequenceDiagnostic) {
        let resync = diagnostic.needs_resync();
        let (symbol, sequence, reason) = match diagnostic {
            SequenceDiagnostic::Duplicate { symbol, sequence } => (symbol, sequence, StaleReason::Duplicate),
            SequenceDiagnostic::GapLost { symbol, from, to } => (symbol, from, StaleReason::GapLost { from, to }),
            SequenceDiagnostic::LateArrival { symbol, sequence } => (symbol, sequence, StaleReason::LateArrival),
            SequenceDiagnostic::BeforeBaseline { symbol, sequence } => {
                (symbol, sequence, StaleReason::BeforeBaseline)
            }
        };
        let why = match reason {
            StaleReason::BeforeBaseline => "event arrived before the stream baseline",
            _ => "sequence gap declared lost",
        };
        self.emit(EngineEventKind::StaleEvent {
            symbol: symbol.clone(),
            sequence,
            reason,
        });
        if resync {
            self.request_resync(Some(symbol), why);
        }
    }

    pub(super) fn on_apply_failure(&mut self, event: &ExchangeEvent, error: EngineError) {
        match error.class() {
            ErrorClass::Fatal => {
                if let EngineError::Ledger(LedgerError::NegativeBalance { token, .. }) = &error {
                    let token = token.clone();
                    self.halt_token(&token, error.to_string());
                }
            }
            ErrorClass::Consistency => {
                warn!(symbol = %event.symbol, sequence = %event.sequence, error = %error, "inconsistent exchange event");
                self.request_resync(Some(event.symbol.clone()), &error.to_string());
            }
            ErrorClass::Rejection | ErrorClass::Transient => {
                debug!(symbol = %event.symbol, sequence = %event.sequence, error = %error, "exchange event ignored");
            }
        }
    }

    pub fn request_resync(&mut self, symbol: Option<Symbol>, reason: &str) {
        self.emit(EngineEventKind::ResyncRequested {
            symbol,
            reason: reason.to_string(),
        });
        self.queue(ExchangeCommand::Resync);
    }

    /// Apply one in-order event.
    pub(super) fn apply_event(&mut self, event: &ExchangeEvent) -> Result<(), EngineError> {
        match &event.kind {
            ExchangeEventKind::OrderAcknowledged { order } => self.apply_ack(order),
            ExchangeEventKind::OrderFilled {
                order,
                side,
                quantity,
                price,
                fee,
                ..
            } => self.apply_fill(&event.symbol, order, *side, *quantity, *price, *fee),
            ExchangeEventKind::OrderCancelled { order } => self.apply_terminal(order, OrderStatus::Cancelled, None),
            ExchangeEventKind::OrderExpired { order } => self.apply_terminal(order, OrderStatus::Expired, None),
            ExchangeEventKind::OrderRejected { order, reason } => {
                self.apply_terminal(order, OrderStatus::Rejected, Some(reason.clone()))
            }
            ExchangeEventKind::FundingApplied { rate, amount } => self.apply_funding(&event.symbol, *rate, *amount),
        }
    }

    // binds without journaling: the event that carried the id is journaled itself
    fn bind_from_event(&mut self, id: CorrelationId, order: &OrderRef) -> Result<(), EngineError> {
        if let Some(exchange_order_id) = order.exchange_order_id {
            match self.registry.bind_exchange_id(id, exchange_order_id) {
                Ok(_) | Err(RegistryError::AlreadyTerminal(..)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn apply_ack(&mut self, order: &OrderRef) -> Result<(), EngineError> {
        let Some(id) = self.registry.resolve(order) else {
            warn!(exchange_order_id = ?order.exchange_order_id, "ack for untracked order");
            return Ok(());
        };
        self.bind_from_event(id, order)?;
        match self.registry.acknowledge(id, self.current_time) {
            Ok(_) => {}
            Err(RegistryError::AlreadyTerminal(..)) => {
                debug!(correlation_id = %id, "ack for finished order");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.dispatch_deferred_cancel(id);
        Ok(())
    }

    fn apply_fill(
        &mut self,
        symbol: &Symbol,
        order: &OrderRef,
        side: Side,
        quantity: Decimal,
        price: Price,
        fee: Amount,
    ) -> Result<(), EngineError> {
        let Some(id) = self.registry.resolve(order) else {
            return self.apply_unmatched_fill(symbol, order.exchange_order_id, side, quantity, price, fee);
        };
        self.bind_from_event(id, order)?;

        let tracked = match self.registry.check_fill(id, quantity) {
            Ok(tracked) => tracked.clone(),
            Err(RegistryError::Overfill {
                id,
                quantity,
                remaining,
            }) => {
                self.emit(EngineEventKind::Overfill {
                    correlation_id: id,
                    quantity,
                    remaining,
                });
                return Err(RegistryError::Overfill { id, quantity, remaining }.into());
            }
            // the exchange says it traded; our copy already finished
            Err(RegistryError::AlreadyTerminal(..)) => {
                return self.apply_unmatched_fill(symbol, order.exchange_order_id, side, quantity, price, fee);
            }
            Err(e) => return Err(e.into()),
        };
        if side != tracked.side {
            warn!(correlation_id = %id, reported = %side, tracked = %tracked.side, "fill side disagrees with order");
        }
        let market = self.market(&tracked.symbol)?.clone();

        // validate everything before anything moves
        let change = self
            .positions
            .preview_fill(&tracked.symbol, tracked.side, quantity, price, self.current_time);
        let cash_delta = change.realized_pnl.sub(fee);
        let settlement = self
            .ledger
            .plan_fill(Some(id), &market.settlement_token, quantity, cash_delta)?;

        let status = self.registry.apply_fill(id, quantity, price, self.current_time)?;
        self.ledger.apply_fill(&settlement);
        let realized = change.realized_pnl;
        self.positions.commit(change);

        info!(
            correlation_id = %id, symbol = %tracked.symbol, side = %tracked.side, %quantity, %price,
            %fee, %realized, released = %settlement.released, status = ?status, "fill applied"
        );
        self.dispatch_deferred_cancel(id);
        self.check_inventory(&tracked.symbol);
        Ok(())
    }

    // exchange truth wins for the position; the order side of it needs a re-sync
    fn apply_unmatched_fill(
        &mut self,
        symbol: &Symbol,
        exchange_order_id: Option<ExchangeOrderId>,
        side: Side,
        quantity: Decimal,
        price: Price,
        fee: Amount,
    ) -> Result<(), EngineError> {
        let market = self.market(symbol)?.clone();
        let change = self.positions.preview_fill(symbol, side, quantity, price, self.current_time);
        let cash_delta = change.realized_pnl.sub(fee);
        let settlement = self
            .ledger
            .plan_fill(None, &market.settlement_token, quantity, cash_delta)?;
        self.ledger.apply_fill(&settlement);
        self.positions.commit(change);

        self.emit(EngineEventKind::UnmatchedFill {
            symbol: symbol.clone(),
            exchange_order_id,
            side,
            quantity,
            price,
        });
        self.check_inventory(symbol);
        Err(EngineError::UnmatchedFill {
            symbol: symbol.clone(),
            exchange_order_id,
        })
    }

    fn apply_terminal(&mut self, order: &OrderRef, status: OrderStatus, reason: Option<String>) -> Result<(), EngineError> {
        let Some(id) = self.registry.resolve(order) else {
            debug!(exchange_order_id = ?order.exchange_order_id, ?status, "terminal event for untracked order");
            return Ok(());
        };
        self.bind_from_event(id, order)?;
        match self.registry.transition(id, status, reason, self.current_time) {
            Ok(_) => {}
            Err(RegistryError::AlreadyTerminal(..)) => {
                debug!(correlation_id = %id, ?status, "terminal event for finished order");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let released = self.ledger.release(id);
        self.cancels_dispatched.remove(&id);
        info!(correlation_id = %id, ?status, %released, "order closed");
        Ok(())
    }

    fn check_inventory(&mut self, symbol: &Symbol) {
        let utilization = self
            .positions
            .inventory_status(symbol, self.config.quoting.max_inventory);
        if utilization.status != InventoryLimitStatus::Normal {
            self.emit(EngineEventKind::InventoryLimitWarning {
                symbol: symbol.clone(),
                utilization: utilization.ratio,
            });
        }
    }
}
