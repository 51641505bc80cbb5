//! Intent submission and cancellation.
//!
//! An intent passes the risk gate, then the ledger, and only then becomes an order: the
//! reservation is taken against the correlation id the registry assigns, and the place
//! command is queued last. Nothing is sent for an intent that any step refused.

use super::core::ExecutionCoordinator;
use super::results::{EngineError, ExchangeCommand};
use crate::config::MarketSpec;
use crate::exchange::PlaceOrderRequest;
use crate::journal::JournalRecord;
use crate::order::{OrderIntent, OrderKind, OrderStatus};
use crate::registry::{CancelDisposition, RegistryError};
use crate::risk::{flatten_side, RiskRejection, RiskSnapshot};
use crate::types::{floor_to_lot, Amount, CorrelationId, Symbol};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

impl ExecutionCoordinator {
    // 8.2: the full acceptance path for a caller or quote intent
    pub fn submit(&mut self, intent: OrderIntent) -> Result<CorrelationId, EngineError> {
        let market = self.market(&intent.symbol)?.clone();
        self.registry.ensure_not_duplicate(&intent)?;

        let snapshot = self.risk_snapshot(&intent, &market);
        if let Err(rejection) = self.risk.evaluate(&intent, &market, &snapshot) {
            debug!(symbol = %intent.symbol, side = %intent.side, reason = %rejection, "intent rejected by risk");
            return Err(rejection.into());
        }
        self.accept_intent(intent, &market)
    }

    /// Skips the risk gate. Used for reduce-only flattening after a breaker trip.
    pub(super) fn submit_unchecked(&mut self, intent: OrderIntent) -> Result<CorrelationId, EngineError> {
        let market = self.market(&intent.symbol)?.clone();
        self.accept_intent(intent, &market)
    }

    fn accept_intent(&mut self, intent: OrderIntent, market: &MarketSpec) -> Result<CorrelationId, EngineError> {
        let reservation = self.reservation_for(&intent, market)?;
        self.ledger.check_reserve(&market.settlement_token, reservation)?;

        let id = self.registry.submit(&intent, self.current_time)?;
        if !reservation.is_zero() {
            if let Err(e) = self
                .ledger
                .reserve(id, &market.settlement_token, reservation, intent.quantity)
            {
                // checked above, so this only trips on a programming error
                if let Err(rollback) =
                    self.registry
                        .transition(id, OrderStatus::Rejected, Some(e.to_string()), self.current_time)
                {
                    warn!(correlation_id = %id, error = %rollback, "rollback of unreserved order failed");
                }
                return Err(e.into());
            }
        }

        let order = self.registry.get(id).cloned().ok_or(RegistryError::UnknownOrder(id))?;
        self.record(JournalRecord::OrderSubmitted {
            order: order.clone(),
            reservation,
        })?;
        self.queue(ExchangeCommand::Place(PlaceOrderRequest::from_order(&order)));

        info!(
            correlation_id = %id, symbol = %order.symbol, side = %order.side, qty = %order.quantity,
            price = ?order.price.map(|p| p.value()), %reservation, "order accepted"
        );
        Ok(id)
    }

    /// Amount locked for an intent, in the market's settlement token.
    pub(super) fn reservation_for(&self, intent: &OrderIntent, market: &MarketSpec) -> Result<Amount, EngineError> {
        if intent.reduce_only {
            return Ok(Amount::zero());
        }
        let price = match (intent.kind, intent.price) {
            (_, Some(price)) => price.value(),
            (OrderKind::Market, None) => {
                let mid = self
                    .snapshots
                    .get(&intent.symbol)
                    .and_then(|s| s.mid)
                    .ok_or_else(|| RiskRejection::NoReferencePrice(intent.symbol.clone()))?;
                mid.value() * (Decimal::ONE + self.config.risk.max_slippage_pct)
            }
            (OrderKind::Limit(_), None) => {
                return Err(RiskRejection::InvalidIntent("limit order without a price".to_string()).into())
            }
        };
        Ok(Amount::new(intent.quantity * price * market.initial_margin_fraction))
    }

    /// Everything the gate needs, captured from current state.
    pub fn risk_snapshot(&self, intent: &OrderIntent, market: &MarketSpec) -> RiskSnapshot {
        let siblings: Vec<&Symbol> = self
            .markets
            .values()
            .filter(|m| m.base_token == market.base_token)
            .map(|m| &m.symbol)
            .collect();

        let token_position = siblings.iter().map(|s| self.positions.size(s).value()).sum();
        let resting_same_side = siblings
            .iter()
            .map(|s| self.registry.open_quantity(s, intent.side))
            .sum();

        RiskSnapshot {
            token_position,
            resting_same_side,
            gross_notional: self.gross_notional(),
            market: self.snapshots.get(&intent.symbol).cloned(),
        }
    }

    /// Sum of |size| x mark over open positions, in the reference token.
    pub fn gross_notional(&self) -> Decimal {
        self.positions
            .open_positions()
            .filter_map(|p| {
                let mark = p.last_mark.or(p.entry_price)?;
                Some(p.notional_value(mark).value())
            })
            .sum()
    }

    // 8.3: cancel. sent now if the exchange knows the order, otherwise once it is acknowledged
    pub fn cancel(&mut self, id: CorrelationId) -> Result<(), EngineError> {
        let disposition = self.registry.request_cancel(id, self.current_time)?;
        match disposition {
            CancelDisposition::AlreadyRequested => {
                debug!(correlation_id = %id, "cancel already in flight");
                return Ok(());
            }
            CancelDisposition::Deferred => {
                debug!(correlation_id = %id, "cancel deferred until acknowledged");
            }
            CancelDisposition::Dispatch(exchange_order_id) => {
                let symbol = self.registry.get(id).map(|o| o.symbol.clone()).ok_or(RegistryError::UnknownOrder(id))?;
                self.cancels_dispatched.insert(id);
                self.queue(ExchangeCommand::Cancel {
                    correlation_id: Some(id),
                    symbol,
                    exchange_order_id,
                });
            }
        }
        self.record(JournalRecord::CancelRequested { correlation_id: id })
    }

    /// Cancel every live order, optionally for one symbol. Returns how many were requested.
    pub fn cancel_all(&mut self, symbol: Option<&Symbol>) -> usize {
        let ids: Vec<CorrelationId> = self
            .registry
            .live_orders()
            .filter(|o| symbol.map_or(true, |s| &o.symbol == s))
            .filter(|o| o.cancel_requested_at.is_none())
            .map(|o| o.correlation_id)
            .collect();

        let mut requested = 0;
        for id in ids {
            match self.cancel(id) {
                Ok(()) => requested += 1,
                Err(e) => warn!(correlation_id = %id, error = %e, "cancel failed"),
            }
        }
        requested
    }

    // send a deferred cancel once the order is acknowledged and has an exchange id
    pub(super) fn dispatch_deferred_cancel(&mut self, id: CorrelationId) {
        if self.cancels_dispatched.contains(&id) {
            return;
        }
        let Some(order) = self.registry.get(id) else {
            return;
        };
        if !order.cancel_in_flight() || order.status == OrderStatus::Pending {
            return;
        }
        let Some(exchange_order_id) = order.exchange_order_id else {
            return;
        };
        let symbol = order.symbol.clone();
        debug!(correlation_id = %id, "dispatching deferred cancel");
        self.cancels_dispatched.insert(id);
        self.queue(ExchangeCommand::Cancel {
            correlation_id: Some(id),
            symbol,
            exchange_order_id,
        });
    }

    /// Reduce-only market orders closing every open position. Bypasses the gate.
    pub(super) fn flatten_all(&mut self) -> Vec<CorrelationId> {
        let targets: Vec<(Symbol, Decimal)> = self
            .positions
            .open_positions()
            .map(|p| (p.symbol.clone(), p.size.value()))
            .collect();

        let mut placed = Vec::new();
        for (symbol, size) in targets {
            let Some(side) = flatten_side(size) else {
                continue;
            };
            let lot = self.markets.get(&symbol).map(|m| m.lot_size).unwrap_or(Decimal::ZERO);
            let quantity = floor_to_lot(size.abs(), lot);
            if quantity <= Decimal::ZERO {
                continue;
            }
            let intent = OrderIntent::market(symbol.clone(), side, quantity).reduce_only();
            match self.submit_unchecked(intent) {
                Ok(id) => placed.push(id),
                Err(e) => warn!(%symbol, error = %e, "flatten order failed"),
            }
        }
        placed
    }
}
