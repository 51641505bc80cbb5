//! Startup recovery, reconciliation and journal replay.
//!
//! On start the coordinator either replays its journal or starts empty, then takes one fresh
//! exchange snapshot: balances it has never seen are seeded from it and every live order
//! the exchange no longer reports is swept. From then on the reconciliation loop compares
//! snapshots on its own schedule.

use super::core::ExecutionCoordinator;
use super::results::{EngineError, ExchangeCommand};
use crate::config::EngineConfig;
use crate::events::{EngineEventKind, OrderRef};
use crate::exchange::{ExchangeSnapshot, OpenOrderSnapshot};
use crate::journal::{Journal, JournalEntry, JournalRecord};
use crate::order::OrderStatus;
use crate::reconcile::ReconciliationPlan;
use crate::registry::RegistryError;
use crate::types::{CorrelationId, ExchangeOrderId};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl ExecutionCoordinator {
    /// Seed unseen balances from the exchange, then sweep orphans.
    pub fn bootstrap(&mut self, snapshot: &ExchangeSnapshot) -> Result<Vec<CorrelationId>, EngineError> {
        self.set_time(snapshot.taken_at);
        let known: BTreeSet<_> = self.ledger.balances().map(|(t, _)| t.clone()).collect();
        for balance in &snapshot.balances {
            if !known.contains(&balance.token) {
                self.seed_balance(&balance.token, balance.total)?;
            }
        }
        let swept = self.orphan_sweep(&snapshot.open_orders);
        info!(balances = snapshot.balances.len(), open = snapshot.open_orders.len(), swept = swept.len(), "bootstrapped");
        Ok(swept)
    }

    // 8.8: every live order the exchange doesn't report is cancelled, exactly once
    pub fn orphan_sweep(&mut self, open_orders: &[OpenOrderSnapshot]) -> Vec<CorrelationId> {
        let reported: BTreeSet<CorrelationId> = open_orders
            .iter()
            .filter_map(|o| self.registry.resolve(&OrderRef::new(o.exchange_order_id, o.client_id)))
            .collect();

        let mut orphans: Vec<(CorrelationId, Option<ExchangeOrderId>)> = self
            .registry
            .live_orders()
            .filter(|o| !reported.contains(&o.correlation_id) && !self.swept.contains(&o.correlation_id))
            .map(|o| (o.correlation_id, o.exchange_order_id))
            .collect();
        orphans.sort_by_key(|(id, _)| *id);

        let mut swept = Vec::new();
        for (id, exchange_order_id) in orphans {
            self.swept.insert(id);
            let exchange_cancel = exchange_order_id.is_some();
            let result = match exchange_order_id {
                Some(eid) => self.sweep_with_exchange_cancel(id, eid),
                None => self.finish_locally(id, OrderStatus::Cancelled, "orphan sweep").map(|_| ()),
            };
            match result {
                Ok(()) => {
                    self.emit(EngineEventKind::OrphanSwept {
                        correlation_id: id,
                        exchange_cancel,
                    });
                    swept.push(id);
                }
                Err(e) => warn!(correlation_id = %id, error = %e, "orphan sweep failed"),
            }
        }
        swept
    }

    fn sweep_with_exchange_cancel(&mut self, id: CorrelationId, eid: ExchangeOrderId) -> Result<(), EngineError> {
        let symbol = self.registry.get(id).map(|o| o.symbol.clone()).ok_or(RegistryError::UnknownOrder(id))?;
        self.registry.request_cancel(id, self.current_time)?;
        self.record(JournalRecord::CancelRequested { correlation_id: id })?;
        if self.cancels_dispatched.insert(id) {
            self.queue(ExchangeCommand::Cancel {
                correlation_id: Some(id),
                symbol,
                exchange_order_id: eid,
            });
        }
        Ok(())
    }

    /// Close an order without the exchange's word: reservation released, journaled.
    /// Returns false when the order had already finished.
    pub fn finish_locally(&mut self, id: CorrelationId, status: OrderStatus, reason: &str) -> Result<bool, EngineError> {
        match self.registry.transition(id, status, Some(reason.to_string()), self.current_time) {
            Ok(_) => {}
            Err(RegistryError::AlreadyTerminal(..)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let released = self.ledger.release(id);
        self.cancels_dispatched.remove(&id);
        info!(correlation_id = %id, ?status, reason, %released, "order closed locally");
        self.record(JournalRecord::LocalTransition {
            correlation_id: id,
            status,
            reason: reason.to_string(),
        })?;
        Ok(true)
    }

    // 8.9: compare with a fresh exchange snapshot and apply whatever is confirmed
    pub fn reconcile(&mut self, snapshot: &ExchangeSnapshot) -> Result<ReconciliationPlan, EngineError> {
        self.set_time(snapshot.taken_at);
        let plan = self
            .recon
            .compare(snapshot, &self.registry, &self.ledger, self.current_time);

        for alert in &plan.alerts {
            self.emit(alert.clone());
        }
        for (symbol, exchange_order_id) in &plan.cancel_unknown {
            self.queue(ExchangeCommand::Cancel {
                correlation_id: None,
                symbol: symbol.clone(),
                exchange_order_id: *exchange_order_id,
            });
        }
        for id in &plan.expire_local {
            self.finish_locally(*id, OrderStatus::Expired, "missing on exchange")?;
        }
        for (token, total) in &plan.adjust_balances {
            match self.ledger.adjust_total(token, *total) {
                Ok(delta) => {
                    warn!(%token, %total, %delta, "balance adjusted to exchange");
                    self.record(JournalRecord::BalanceAdjusted {
                        token: token.clone(),
                        total: *total,
                    })?;
                }
                Err(e) => {
                    let error = EngineError::from(e);
                    self.halt_token(token, error.to_string());
                }
            }
        }
        if plan.resync {
            self.emit(EngineEventKind::ResyncRequested {
                symbol: None,
                reason: format!("{} reconciliation suspects", self.recon.suspects()),
            });
        }
        Ok(plan)
    }

    /// Rebuild a coordinator from its journal. Nothing is re-journaled or re-sent while
    /// replaying; afterwards new entries append to the same journal.
    pub fn replay(config: EngineConfig, journal: Box<dyn Journal>) -> Result<Self, EngineError> {
        let entries = journal.entries()?;
        let mut coordinator = Self::with_journal(config, journal)?;
        coordinator.replaying = true;
        let count = entries.len();
        for entry in entries {
            coordinator.replay_entry(entry)?;
        }
        coordinator.replaying = false;
        coordinator.resume_pending_cancels();
        info!(entries = count, live_orders = coordinator.registry.live_count(), "journal replayed");
        Ok(coordinator)
    }

    fn replay_entry(&mut self, entry: JournalEntry) -> Result<(), EngineError> {
        self.set_time(entry.at);
        match entry.record {
            JournalRecord::BalanceSeeded { token, total } => self.ledger.seed(&token, total)?,
            JournalRecord::OrderSubmitted { order, reservation } => {
                let token = self.market(&order.symbol)?.settlement_token.clone();
                let (id, quantity) = (order.correlation_id, order.quantity);
                self.registry.restore(order);
                if !reservation.is_zero() {
                    self.ledger.reserve(id, &token, reservation, quantity)?;
                }
            }
            JournalRecord::ExchangeIdBound {
                correlation_id,
                exchange_order_id,
            } => match self.registry.bind_exchange_id(correlation_id, exchange_order_id) {
                Ok(_) | Err(RegistryError::AlreadyTerminal(..)) => {}
                Err(e) => return Err(e.into()),
            },
            JournalRecord::CancelRequested { correlation_id } => {
                match self.registry.request_cancel(correlation_id, entry.at) {
                    Ok(_) | Err(RegistryError::AlreadyTerminal(..)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            JournalRecord::CancelRequestCleared { correlation_id } => {
                match self.registry.clear_cancel_request(correlation_id) {
                    Ok(_) | Err(RegistryError::AlreadyTerminal(..)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            JournalRecord::Exchange(event) => {
                self.sequencer.observe_applied(&event.symbol, event.sequence);
                // the live run failed the same way; repeat its reaction
                if let Err(e) = self.apply_event(&event) {
                    debug!(symbol = %event.symbol, sequence = %event.sequence, error = %e, "replayed event failed");
                    self.on_apply_failure(&event, e);
                }
            }
            JournalRecord::LocalTransition {
                correlation_id,
                status,
                reason,
            } => {
                self.finish_locally(correlation_id, status, &reason)?;
            }
            JournalRecord::Transfer(transfer) => self.on_transfer(transfer)?,
            JournalRecord::BalanceAdjusted { token, total } => {
                self.ledger.adjust_total(&token, total)?;
            }
        }
        Ok(())
    }

    // cancels requested before a restart may never have gone out
    fn resume_pending_cancels(&mut self) {
        let pending: Vec<CorrelationId> = self
            .registry
            .live_orders()
            .filter(|o| o.cancel_in_flight())
            .map(|o| o.correlation_id)
            .collect();
        for id in pending {
            self.dispatch_deferred_cancel(id);
        }
    }
}
