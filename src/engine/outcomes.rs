//! Results of exchange commands the runtime dispatched.
//!
//! A place or cancel outcome never changes an order's status by itself: the exchange stream
//! carries the authoritative transitions. Outcomes bind exchange ids, undo cancels that never
//! went out, and close orders the exchange has confirmed it never saw.

use super::core::ExecutionCoordinator;
use super::results::{CommandOutcome, EngineError, ExchangeCommand};
use crate::events::EngineEventKind;
use crate::exchange::{CancelAck, ExchangeError, OrderStatusReport, PlaceAck};
use crate::journal::JournalRecord;
use crate::order::OrderStatus;
use crate::registry::RegistryError;
use crate::types::{CorrelationId, ExchangeOrderId};
use tracing::{debug, info, warn};

impl ExecutionCoordinator {
    pub fn on_command_outcome(&mut self, outcome: CommandOutcome) -> Result<(), EngineError> {
        match outcome {
            CommandOutcome::Placed { correlation_id, result } => self.on_placed(correlation_id, result),
            CommandOutcome::Cancelled {
                correlation_id,
                exchange_order_id,
                result,
            } => self.on_cancelled(correlation_id, exchange_order_id, result),
            CommandOutcome::StatusQueried { correlation_id, result } => self.on_status(correlation_id, result),
        }
    }

    fn bind_from_outcome(&mut self, id: CorrelationId, exchange_order_id: ExchangeOrderId) -> Result<(), EngineError> {
        match self.registry.bind_exchange_id(id, exchange_order_id) {
            Ok(true) => {
                self.record(JournalRecord::ExchangeIdBound {
                    correlation_id: id,
                    exchange_order_id,
                })?;
                self.dispatch_deferred_cancel(id);
                Ok(())
            }
            Ok(false) | Err(RegistryError::AlreadyTerminal(..)) => Ok(()),
            Err(e @ RegistryError::ConflictingExchangeId { .. }) => {
                let symbol = self.registry.get(id).map(|o| o.symbol.clone());
                self.request_resync(symbol, &e.to_string());
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_placed(&mut self, id: CorrelationId, result: Result<PlaceAck, ExchangeError>) -> Result<(), EngineError> {
        match result {
            Ok(ack) => {
                debug!(correlation_id = %id, exchange_order_id = %ack.exchange_order_id, "place accepted");
                self.bind_from_outcome(id, ack.exchange_order_id)
            }
            // retries are spent; the runtime already re-queried before giving up
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "place failed");
                self.emit(EngineEventKind::CommandFailed {
                    correlation_id: id,
                    reason: e.to_string(),
                });
                let pending = self.registry.get(id).is_some_and(|o| o.status == OrderStatus::Pending);
                if pending {
                    self.finish_locally(id, OrderStatus::Rejected, &e.to_string())?;
                }
                Ok(())
            }
        }
    }

    fn on_cancelled(
        &mut self,
        id: Option<CorrelationId>,
        exchange_order_id: ExchangeOrderId,
        result: Result<CancelAck, ExchangeError>,
    ) -> Result<(), EngineError> {
        let Some(id) = id else {
            match result {
                Ok(_) => info!(%exchange_order_id, "unknown exchange order cancelled"),
                Err(e) => warn!(%exchange_order_id, error = %e, "cancel of unknown exchange order failed"),
            }
            return Ok(());
        };

        match result {
            Ok(CancelAck::Accepted) => {
                debug!(correlation_id = %id, "cancel accepted; waiting for confirmation");
                Ok(())
            }
            // gone or never there: ask what actually happened to it
            Ok(CancelAck::AlreadyGone) | Err(ExchangeError::UnknownOrder) => {
                debug!(correlation_id = %id, "cancel target gone; querying status");
                self.queue(ExchangeCommand::QueryOrder(id));
                Ok(())
            }
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "cancel failed");
                self.cancels_dispatched.remove(&id);
                match self.registry.clear_cancel_request(id) {
                    Ok(true) => self.record(JournalRecord::CancelRequestCleared { correlation_id: id })?,
                    Ok(false) | Err(RegistryError::AlreadyTerminal(..)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.emit(EngineEventKind::CommandFailed {
                    correlation_id: id,
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }

    fn on_status(
        &mut self,
        id: CorrelationId,
        result: Result<Option<OrderStatusReport>, ExchangeError>,
    ) -> Result<(), EngineError> {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "status query failed");
                self.emit(EngineEventKind::CommandFailed {
                    correlation_id: id,
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };
        let Some(local) = self.registry.get(id).cloned() else {
            return Err(RegistryError::UnknownOrder(id).into());
        };
        if local.status.is_terminal() {
            return Ok(());
        }

        let Some(report) = report else {
            // the exchange never saw it
            let status = if local.status == OrderStatus::Pending {
                OrderStatus::Rejected
            } else {
                OrderStatus::Cancelled
            };
            self.finish_locally(id, status, "not known to exchange")?;
            return Ok(());
        };

        self.bind_from_outcome(id, report.exchange_order_id)?;
        match report.status {
            OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected => {
                // fills still in transit on the stream would be lost by closing now
                if report.filled_quantity == local.filled_quantity {
                    let status = if local.status.can_transition_to(report.status) {
                        report.status
                    } else {
                        OrderStatus::Cancelled
                    };
                    self.finish_locally(id, status, "confirmed by status query")?;
                } else {
                    self.request_resync(Some(local.symbol), "status query disagrees on filled quantity");
                }
            }
            OrderStatus::Filled => {
                if report.filled_quantity != local.filled_quantity {
                    debug!(correlation_id = %id, reported = %report.filled_quantity, local = %local.filled_quantity, "fills in transit");
                }
            }
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled => {
                debug!(correlation_id = %id, status = ?report.status, "order still working");
            }
        }
        Ok(())
    }
}
