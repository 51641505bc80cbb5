// 2.1: order registry. the single source of truth for what is live on the exchange.
// holds orders by correlation id with an exchange-id index. terminal orders get archived.

use crate::events::OrderRef;
use crate::order::{Order, OrderIntent, OrderStatus};
use crate::types::{CorrelationId, ExchangeOrderId, Price, Side, Symbol, Timestamp};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate intent already in flight as {0}")]
    DuplicateIntent(CorrelationId),

    #[error("Unknown order {0}")]
    UnknownOrder(CorrelationId),

    #[error("Order {0} is already terminal ({1:?})")]
    AlreadyTerminal(CorrelationId, OrderStatus),

    #[error("Illegal transition for {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: CorrelationId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Order {id} already bound to {existing}, refusing {offered}")]
    ConflictingExchangeId {
        id: CorrelationId,
        existing: ExchangeOrderId,
        offered: ExchangeOrderId,
    },

    #[error("Fill of {quantity} exceeds remaining {remaining} on {id}")]
    Overfill {
        id: CorrelationId,
        quantity: Decimal,
        remaining: Decimal,
    },
}

/// What the coordinator must do after a local cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// Order is acknowledged; send the cancel now.
    Dispatch(ExchangeOrderId),
    /// Not yet acknowledged; the cancel goes out once the ack arrives.
    Deferred,
    /// A cancel is already in flight; nothing more to send.
    AlreadyRequested,
}

/// Result of an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Opened,
    /// Duplicate or late ack. Nothing changed.
    NoOp,
}

#[derive(Debug)]
pub struct OrderRegistry {
    orders: HashMap<CorrelationId, Order>,
    by_exchange_id: HashMap<ExchangeOrderId, CorrelationId>,
    archive: VecDeque<Order>,
    max_archived: usize,
    next_id: u64,
}

impl OrderRegistry {
    pub fn new(max_archived: usize) -> Self {
        Self {
            orders: HashMap::new(),
            by_exchange_id: HashMap::new(),
            archive: VecDeque::new(),
            max_archived,
            next_id: 1,
        }
    }

    /// Fails with `DuplicateIntent` when identical terms are already working.
    pub fn ensure_not_duplicate(&self, intent: &OrderIntent) -> Result<(), RegistryError> {
        let clash = self.orders.values().find(|o| {
            o.is_live() && intent.same_terms(&o.symbol, o.side, o.price, o.quantity)
        });
        match clash {
            Some(existing) => Err(RegistryError::DuplicateIntent(existing.correlation_id)),
            None => Ok(()),
        }
    }

    // 2.1.1: submit. assigns the correlation id; the order starts Pending.
    pub fn submit(&mut self, intent: &OrderIntent, timestamp: Timestamp) -> Result<CorrelationId, RegistryError> {
        self.ensure_not_duplicate(intent)?;
        let id = CorrelationId(self.next_id);
        self.next_id += 1;
        self.orders.insert(id, Order::from_intent(id, intent, timestamp));
        debug!(correlation_id = %id, symbol = %intent.symbol, side = %intent.side, qty = %intent.quantity, "order submitted");
        Ok(id)
    }

    /// Re-inserts an order verbatim. Used by journal replay.
    pub(crate) fn restore(&mut self, order: Order) {
        self.next_id = self.next_id.max(order.correlation_id.0 + 1);
        if let Some(eid) = order.exchange_order_id {
            self.by_exchange_id.insert(eid, order.correlation_id);
        }
        self.orders.insert(order.correlation_id, order);
    }

    pub fn get(&self, id: CorrelationId) -> Option<&Order> {
        self.orders
            .get(&id)
            .or_else(|| self.archive.iter().find(|o| o.correlation_id == id))
    }

    fn tracked(&self, id: CorrelationId) -> Result<&Order, RegistryError> {
        match self.orders.get(&id) {
            Some(order) => Ok(order),
            None => match self.archive.iter().find(|o| o.correlation_id == id) {
                Some(archived) => Err(RegistryError::AlreadyTerminal(id, archived.status)),
                None => Err(RegistryError::UnknownOrder(id)),
            },
        }
    }

    fn tracked_mut(&mut self, id: CorrelationId) -> Result<&mut Order, RegistryError> {
        self.tracked(id)?;
        self.orders.get_mut(&id).ok_or(RegistryError::UnknownOrder(id))
    }

    pub fn lookup_exchange_id(&self, eid: ExchangeOrderId) -> Option<CorrelationId> {
        self.by_exchange_id.get(&eid).copied()
    }

    /// Resolve an exchange event's order reference to a tracked correlation id.
    pub fn resolve(&self, order: &OrderRef) -> Option<CorrelationId> {
        order
            .client_id
            .filter(|cid| self.get(*cid).is_some())
            .or_else(|| order.exchange_order_id.and_then(|eid| self.lookup_exchange_id(eid)))
    }

    // 2.1.2: bind the exchange id. idempotent for the same id, refuses a second live id.
    pub fn bind_exchange_id(&mut self, id: CorrelationId, eid: ExchangeOrderId) -> Result<bool, RegistryError> {
        let order = self.tracked_mut(id)?;
        match order.exchange_order_id {
            Some(existing) if existing == eid => Ok(false),
            Some(existing) => Err(RegistryError::ConflictingExchangeId {
                id,
                existing,
                offered: eid,
            }),
            None => {
                order.exchange_order_id = Some(eid);
                debug!(correlation_id = %id, exchange_order_id = %eid, "exchange id bound");
                self.by_exchange_id.insert(eid, id);
                Ok(true)
            }
        }
    }

    pub fn acknowledge(&mut self, id: CorrelationId, timestamp: Timestamp) -> Result<AckOutcome, RegistryError> {
        let order = self.tracked_mut(id)?;
        if order.status != OrderStatus::Pending {
            debug!(correlation_id = %id, status = ?order.status, "duplicate ack ignored");
            return Ok(AckOutcome::NoOp);
        }
        order.status = OrderStatus::Open;
        order.updated_at = timestamp;
        Ok(AckOutcome::Opened)
    }

    /// Validates a fill without touching state.
    pub fn check_fill(&self, id: CorrelationId, quantity: Decimal) -> Result<&Order, RegistryError> {
        let order = self.tracked(id)?;
        if order.status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal(id, order.status));
        }
        if quantity > order.remaining_quantity() {
            return Err(RegistryError::Overfill {
                id,
                quantity,
                remaining: order.remaining_quantity(),
            });
        }
        Ok(order)
    }

    pub fn apply_fill(
        &mut self,
        id: CorrelationId,
        quantity: Decimal,
        price: Price,
        timestamp: Timestamp,
    ) -> Result<OrderStatus, RegistryError> {
        self.check_fill(id, quantity)?;
        let order = self.orders.get_mut(&id).ok_or(RegistryError::UnknownOrder(id))?;
        Ok(order.record_fill(quantity, price, timestamp))
    }

    // 2.1.3: move to a terminal (or any legal) state.
    pub fn transition(
        &mut self,
        id: CorrelationId,
        next: OrderStatus,
        reason: Option<String>,
        timestamp: Timestamp,
    ) -> Result<OrderStatus, RegistryError> {
        let order = self.tracked_mut(id)?;
        if order.status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal(id, order.status));
        }
        if !order.status.can_transition_to(next) {
            return Err(RegistryError::IllegalTransition {
                id,
                from: order.status,
                to: next,
            });
        }
        let previous = order.status;
        order.status = next;
        order.updated_at = timestamp;
        if reason.is_some() {
            order.reject_reason = reason;
        }
        debug!(correlation_id = %id, from = ?previous, to = ?next, "order transition");
        Ok(previous)
    }

    // 2.1.4: local cancel request. the status only changes once the exchange confirms.
    pub fn request_cancel(&mut self, id: CorrelationId, timestamp: Timestamp) -> Result<CancelDisposition, RegistryError> {
        let order = self.tracked_mut(id)?;
        if order.status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal(id, order.status));
        }
        if order.cancel_requested_at.is_some() {
            return Ok(CancelDisposition::AlreadyRequested);
        }
        order.cancel_requested_at = Some(timestamp);
        order.updated_at = timestamp;
        Ok(match (order.status, order.exchange_order_id) {
            (OrderStatus::Pending, _) | (_, None) => CancelDisposition::Deferred,
            (_, Some(eid)) => CancelDisposition::Dispatch(eid),
        })
    }

    /// Forget a cancel that the exchange never took, so it can be requested again.
    pub fn clear_cancel_request(&mut self, id: CorrelationId) -> Result<bool, RegistryError> {
        let order = self.tracked_mut(id)?;
        Ok(order.cancel_requested_at.take().is_some())
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.is_live())
    }

    pub fn live_orders_for<'a>(&'a self, symbol: &'a Symbol) -> impl Iterator<Item = &'a Order> + 'a {
        self.live_orders().filter(move |o| &o.symbol == symbol)
    }

    /// Live resting quotes on one side, skipping those already being cancelled.
    pub fn working_maker_orders<'a>(&'a self, symbol: &'a Symbol, side: Side) -> Vec<&'a Order> {
        self.live_orders_for(symbol)
            .filter(|o| o.side == side && o.kind.is_maker() && !o.cancel_in_flight())
            .collect()
    }

    pub fn has_cancel_in_flight(&self, symbol: &Symbol, side: Side) -> bool {
        self.live_orders_for(symbol)
            .any(|o| o.side == side && o.kind.is_maker() && o.cancel_in_flight())
    }

    /// Unfilled quantity resting on one side.
    pub fn open_quantity(&self, symbol: &Symbol, side: Side) -> Decimal {
        self.live_orders_for(symbol)
            .filter(|o| o.side == side)
            .map(|o| o.remaining_quantity())
            .sum()
    }

    pub fn live_count(&self) -> usize {
        self.live_orders().count()
    }

    // 2.1.5: archive terminal orders. the archive is bounded, oldest dropped first.
    pub fn archive_terminal(&mut self) -> usize {
        let terminal: Vec<CorrelationId> = self
            .orders
            .iter()
            .filter(|(_, o)| o.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();

        let mut moved: Vec<Order> = terminal.iter().filter_map(|id| self.orders.remove(id)).collect();
        moved.sort_by_key(|o| o.correlation_id);
        let count = moved.len();

        for order in moved {
            if let Some(eid) = order.exchange_order_id {
                self.by_exchange_id.remove(&eid);
            }
            self.archive.push_back(order);
        }
        while self.archive.len() > self.max_archived {
            self.archive.pop_front();
        }
        count
    }

    pub fn archived(&self) -> impl Iterator<Item = &Order> {
        self.archive.iter()
    }
}
