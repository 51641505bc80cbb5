//! Simulated exchange for backtests, the simulator binary and tests.
//!
//! Implements `ExchangeClient` over an in-memory book: market and crossing taker orders fill
//! against the current top of book, maker orders rest until a trade prints through them.
//! Every state change is published on a per-symbol sequenced stream to all subscribers.
//! Faults can be scripted to exercise timeouts and rejects.

use crate::config::MarketSpec;
use crate::events::{ExchangeEvent, ExchangeEventKind, OrderRef};
use crate::exchange::{
    BalanceSnapshot, CancelAck, ExchangeClient, ExchangeError, OpenOrderSnapshot, OrderStatusReport, PlaceAck,
    PlaceOrderRequest,
};
use crate::market::MarketSnapshot;
use crate::order::{Liquidity, OrderKind, OrderStatus};
use crate::position::PositionBook;
use crate::types::{Amount, Bps, CorrelationId, ExchangeOrderId, Price, Sequence, Side, Symbol, Timestamp, Token};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

const SUBSCRIBER_BUFFER: usize = 4_096;

/// Scripted misbehaviour, consumed one per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// The next place times out before the exchange sees it.
    DropPlace,
    /// The next place is accepted but the response is lost.
    TimeoutAfterAccept,
    /// The next place is rejected with this reason.
    RejectPlace(String),
    /// The next cancel fails with a transport error.
    FailCancel,
}

#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub orders_placed: u64,
    pub orders_cancelled: u64,
    pub orders_rejected: u64,
    pub fills: u64,
    pub events_published: u64,
}

#[derive(Debug, Clone)]
struct SimOrder {
    exchange_order_id: ExchangeOrderId,
    client_id: CorrelationId,
    symbol: Symbol,
    side: Side,
    quantity: Decimal,
    filled: Decimal,
    price: Option<Price>,
    status: OrderStatus,
}

impl SimOrder {
    fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }

    fn reference(&self) -> OrderRef {
        OrderRef::new(self.exchange_order_id, Some(self.client_id))
    }
}

#[derive(Debug, Default)]
struct SimState {
    clock: Timestamp,
    next_order_id: u64,
    markets: HashMap<Symbol, MarketSpec>,
    books: HashMap<Symbol, MarketSnapshot>,
    orders: BTreeMap<ExchangeOrderId, SimOrder>,
    by_client: HashMap<CorrelationId, ExchangeOrderId>,
    balances: BTreeMap<Token, Amount>,
    positions: PositionBook,
    sequences: HashMap<Symbol, Sequence>,
    subscribers: Vec<mpsc::Sender<ExchangeEvent>>,
    faults: VecDeque<SimFault>,
    published: Vec<ExchangeEvent>,
    stats: SimStats,
}

impl SimState {
    fn publish(&mut self, symbol: &Symbol, kind: ExchangeEventKind) {
        let sequence = self
            .sequences
            .entry(symbol.clone())
            .and_modify(|s| *s = s.next())
            .or_insert(Sequence(1));
        let event = ExchangeEvent {
            symbol: symbol.clone(),
            sequence: *sequence,
            timestamp: self.clock,
            kind,
        };
        debug!(%symbol, sequence = %event.sequence, kind = event.kind.name(), "sim event");
        self.subscribers.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
        self.published.push(event);
        self.stats.events_published += 1;
    }

    fn take_fault(&mut self, matches: impl Fn(&SimFault) -> bool) -> Option<SimFault> {
        let index = self.faults.iter().position(matches)?;
        self.faults.remove(index)
    }

    fn settlement_token(&self, symbol: &Symbol) -> Option<Token> {
        self.markets.get(symbol).map(|m| m.settlement_token.clone())
    }

    // books the fill against the sim's own account and publishes it
    fn fill(&mut self, id: ExchangeOrderId, quantity: Decimal, price: Price, liquidity: Liquidity) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        let quantity = quantity.min(order.remaining());
        if quantity <= Decimal::ZERO {
            return;
        }
        order.filled += quantity;
        order.status = if order.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let (symbol, side, reference) = (order.symbol.clone(), order.side, order.reference());

        let fee_bps = match self.markets.get(&symbol) {
            Some(m) if liquidity == Liquidity::Maker => m.maker_fee(),
            Some(m) => m.taker_fee(),
            None => Bps::new(0),
        };
        let fee = Amount::new(quantity * price.value() * fee_bps.as_fraction());
        let realized = self.positions.apply_fill(&symbol, side, quantity, price, self.clock);
        if let Some(token) = self.settlement_token(&symbol) {
            let balance = self.balances.entry(token).or_default();
            *balance = balance.add(realized).sub(fee);
        }
        self.stats.fills += 1;

        self.publish(
            &symbol,
            ExchangeEventKind::OrderFilled {
                order: reference,
                side,
                quantity,
                price,
                fee,
                liquidity,
            },
        );
    }

    fn crossing_price(&self, symbol: &Symbol, side: Side, limit: Option<Price>) -> Option<Price> {
        let book = self.books.get(symbol)?;
        let opposite = book.best_opposite(side).or(book.mid)?;
        match limit {
            None => Some(opposite),
            Some(limit) => {
                let crosses = match side {
                    Side::Buy => limit >= opposite,
                    Side::Sell => limit <= opposite,
                };
                crosses.then_some(opposite)
            }
        }
    }

    fn accept(&mut self, request: &PlaceOrderRequest) -> Result<ExchangeOrderId, ExchangeError> {
        // same client id twice is the same order
        if let Some(existing) = self.by_client.get(&request.client_id) {
            return Ok(*existing);
        }
        let reference = OrderRef::client(request.client_id);

        if let Some(reason) = self.validate(request) {
            self.stats.orders_rejected += 1;
            self.publish(
                &request.symbol,
                ExchangeEventKind::OrderRejected {
                    order: reference,
                    reason: reason.clone(),
                },
            );
            return Err(ExchangeError::Rejected(reason));
        }

        self.next_order_id += 1;
        let id = ExchangeOrderId(self.next_order_id);
        self.orders.insert(
            id,
            SimOrder {
                exchange_order_id: id,
                client_id: request.client_id,
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                filled: Decimal::ZERO,
                price: request.price,
                status: OrderStatus::Open,
            },
        );
        self.by_client.insert(request.client_id, id);
        self.stats.orders_placed += 1;
        self.publish(
            &request.symbol,
            ExchangeEventKind::OrderAcknowledged {
                order: OrderRef::new(id, Some(request.client_id)),
            },
        );

        if request.kind.is_taker() {
            match self.crossing_price(&request.symbol, request.side, request.price) {
                Some(price) => self.fill(id, request.quantity, price, Liquidity::Taker),
                None if request.kind == OrderKind::Market => self.finish(id, OrderStatus::Expired),
                None => {}
            }
            // immediate-or-cancel: whatever did not fill is gone
            if self.orders.get(&id).is_some_and(|o| o.status.is_live()) && request.kind == OrderKind::Market {
                self.finish(id, OrderStatus::Expired);
            }
        }
        Ok(id)
    }

    fn validate(&self, request: &PlaceOrderRequest) -> Option<String> {
        let Some(market) = self.markets.get(&request.symbol) else {
            return Some(format!("unknown symbol {}", request.symbol));
        };
        if request.quantity < market.min_order_size {
            return Some("size below minimum".to_string());
        }
        if request.kind.is_maker() && self.crossing_price(&request.symbol, request.side, request.price).is_some() {
            return Some("post-only order would cross".to_string());
        }
        if request.reduce_only {
            let size = self.positions.size(&request.symbol).value();
            let reduces = request.side.sign() * size < Decimal::ZERO && request.quantity <= size.abs();
            if !reduces {
                return Some("reduce-only order would increase position".to_string());
            }
        }
        None
    }

    fn finish(&mut self, id: ExchangeOrderId, status: OrderStatus) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        order.status = status;
        let (symbol, reference) = (order.symbol.clone(), order.reference());
        let kind = match status {
            OrderStatus::Expired => ExchangeEventKind::OrderExpired { order: reference },
            _ => ExchangeEventKind::OrderCancelled { order: reference },
        };
        self.publish(&symbol, kind);
    }

    fn resting(&self, symbol: &Symbol) -> Vec<ExchangeOrderId> {
        self.orders
            .values()
            .filter(|o| &o.symbol == symbol && o.status.is_live())
            .map(|o| o.exchange_order_id)
            .collect()
    }
}

/// In-memory exchange. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct SimulatedExchange {
    state: Mutex<SimState>,
}

impl SimulatedExchange {
    pub fn new(markets: impl IntoIterator<Item = MarketSpec>) -> Self {
        let state = SimState {
            markets: markets.into_iter().map(|m| (m.symbol.clone(), m)).collect(),
            ..SimState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn deposit(&self, token: &Token, amount: Amount) {
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(token.clone()).or_default();
        *balance = balance.add(amount);
    }

    pub async fn set_time(&self, now: Timestamp) {
        self.state.lock().await.clock = now;
    }

    /// Move the top of book. Resting orders the new book crosses fill as makers at their price.
    pub async fn set_book(&self, snapshot: MarketSnapshot) {
        let mut state = self.state.lock().await;
        state.clock = state.clock.max(snapshot.timestamp);
        let symbol = snapshot.symbol.clone();
        state.books.insert(symbol.clone(), snapshot.clone());

        let crossed: Vec<(ExchangeOrderId, Decimal, Price)> = state
            .resting(&symbol)
            .into_iter()
            .filter_map(|id| state.orders.get(&id))
            .filter_map(|o| {
                let price = o.price?;
                let hit = match o.side {
                    Side::Buy => snapshot.best_ask.is_some_and(|ask| ask <= price),
                    Side::Sell => snapshot.best_bid.is_some_and(|bid| bid >= price),
                };
                hit.then_some((o.exchange_order_id, o.remaining(), price))
            })
            .collect();
        for (id, quantity, price) in crossed {
            state.fill(id, quantity, price, Liquidity::Maker);
        }
    }

    /// A trade prints at `price` for `quantity`: resting orders at or through it fill in
    /// price priority until the quantity runs out.
    pub async fn trade_through(&self, symbol: &Symbol, price: Price, quantity: Decimal) -> Decimal {
        let mut state = self.state.lock().await;
        let mut hits: Vec<(ExchangeOrderId, Price)> = state
            .resting(symbol)
            .into_iter()
            .filter_map(|id| state.orders.get(&id))
            .filter_map(|o| {
                let limit = o.price?;
                let hit = match o.side {
                    Side::Buy => limit >= price,
                    Side::Sell => limit <= price,
                };
                hit.then_some((o.exchange_order_id, limit))
            })
            .collect();
        // most aggressive first
        hits.sort_by(|a, b| (b.1.value() - price.value()).abs().cmp(&(a.1.value() - price.value()).abs()));

        let mut left = quantity;
        for (id, limit) in hits {
            if left <= Decimal::ZERO {
                break;
            }
            let take = state.orders.get(&id).map(|o| o.remaining().min(left)).unwrap_or_default();
            state.fill(id, take, limit, Liquidity::Maker);
            left -= take;
        }
        quantity - left
    }

    /// Fill part of one order at a given price.
    pub async fn partial_fill(&self, id: ExchangeOrderId, quantity: Decimal, price: Price) {
        self.state.lock().await.fill(id, quantity, price, Liquidity::Maker);
    }

    /// Cancel an order from the exchange side (self-trade prevention, expiry, admin).
    pub async fn expire_order(&self, id: ExchangeOrderId) {
        self.state.lock().await.finish(id, OrderStatus::Expired);
    }

    /// Settle funding at `rate` against the open position. Longs pay positive rates.
    pub async fn apply_funding(&self, symbol: &Symbol, rate: Decimal) -> Option<Amount> {
        let mut state = self.state.lock().await;
        let position = state.positions.get(symbol).filter(|p| !p.is_flat())?.clone();
        let mark = state.books.get(symbol).and_then(|b| b.mid).or(position.entry_price)?;
        let amount = Amount::new(-(position.size.value() * mark.value() * rate));
        let now = state.clock;
        state.positions.apply_funding(symbol, amount, now);
        if let Some(token) = state.settlement_token(symbol) {
            let balance = state.balances.entry(token).or_default();
            *balance = balance.add(amount);
        }
        state.publish(symbol, ExchangeEventKind::FundingApplied { rate, amount });
        Some(amount)
    }

    /// Place an order the engine never asked for.
    pub async fn inject_foreign_order(&self, symbol: &Symbol, side: Side, quantity: Decimal, price: Price) -> ExchangeOrderId {
        let mut state = self.state.lock().await;
        state.next_order_id += 1;
        let id = ExchangeOrderId(state.next_order_id);
        state.orders.insert(
            id,
            SimOrder {
                exchange_order_id: id,
                client_id: CorrelationId(u64::MAX - id.0),
                symbol: symbol.clone(),
                side,
                quantity,
                filled: Decimal::ZERO,
                price: Some(price),
                status: OrderStatus::Open,
            },
        );
        id
    }

    pub async fn inject_fault(&self, fault: SimFault) {
        self.state.lock().await.faults.push_back(fault);
    }

    pub async fn exchange_id_for(&self, client_id: CorrelationId) -> Option<ExchangeOrderId> {
        self.state.lock().await.by_client.get(&client_id).copied()
    }

    pub async fn position(&self, symbol: &Symbol) -> Decimal {
        self.state.lock().await.positions.size(symbol).value()
    }

    pub async fn balance(&self, token: &Token) -> Amount {
        self.state.lock().await.balances.get(token).copied().unwrap_or_default()
    }

    pub async fn published(&self) -> Vec<ExchangeEvent> {
        self.state.lock().await.published.clone()
    }

    pub async fn stats(&self) -> SimStats {
        self.state.lock().await.stats.clone()
    }
}

#[async_trait]
impl ExchangeClient for SimulatedExchange {
    async fn place_order(&self, request: PlaceOrderRequest) -> Result<PlaceAck, ExchangeError> {
        let mut state = self.state.lock().await;
        let fault = state.take_fault(|f| {
            matches!(f, SimFault::DropPlace | SimFault::TimeoutAfterAccept | SimFault::RejectPlace(_))
        });
        match fault {
            Some(SimFault::DropPlace) => {
                info!(client_id = %request.client_id, "sim dropped place");
                return Err(ExchangeError::Timeout);
            }
            Some(SimFault::RejectPlace(reason)) => {
                state.stats.orders_rejected += 1;
                state.publish(
                    &request.symbol,
                    ExchangeEventKind::OrderRejected {
                        order: OrderRef::client(request.client_id),
                        reason: reason.clone(),
                    },
                );
                return Err(ExchangeError::Rejected(reason));
            }
            Some(SimFault::TimeoutAfterAccept) => {
                state.accept(&request)?;
                info!(client_id = %request.client_id, "sim accepted place but lost the response");
                return Err(ExchangeError::Timeout);
            }
            _ => {}
        }
        let exchange_order_id = state.accept(&request)?;
        Ok(PlaceAck { exchange_order_id })
    }

    async fn cancel_order(&self, symbol: &Symbol, exchange_order_id: ExchangeOrderId) -> Result<CancelAck, ExchangeError> {
        let mut state = self.state.lock().await;
        if state.take_fault(|f| *f == SimFault::FailCancel).is_some() {
            return Err(ExchangeError::Transport("connection reset".to_string()));
        }
        let Some(order) = state.orders.get(&exchange_order_id) else {
            return Err(ExchangeError::UnknownOrder);
        };
        if &order.symbol != symbol {
            return Err(ExchangeError::UnknownOrder);
        }
        if order.status.is_terminal() {
            return Ok(CancelAck::AlreadyGone);
        }
        state.stats.orders_cancelled += 1;
        state.finish(exchange_order_id, OrderStatus::Cancelled);
        Ok(CancelAck::Accepted)
    }

    async fn query_open_orders(&self) -> Result<Vec<OpenOrderSnapshot>, ExchangeError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.status.is_live())
            .map(|o| OpenOrderSnapshot {
                exchange_order_id: o.exchange_order_id,
                client_id: Some(o.client_id),
                symbol: o.symbol.clone(),
                side: o.side,
                quantity: o.quantity,
                filled_quantity: o.filled,
                price: o.price,
            })
            .collect())
    }

    async fn query_balances(&self) -> Result<Vec<BalanceSnapshot>, ExchangeError> {
        let state = self.state.lock().await;
        Ok(state
            .balances
            .iter()
            .map(|(token, total)| BalanceSnapshot {
                token: token.clone(),
                total: *total,
            })
            .collect())
    }

    async fn query_order(&self, client_id: CorrelationId) -> Result<Option<OrderStatusReport>, ExchangeError> {
        let state = self.state.lock().await;
        let report = state
            .by_client
            .get(&client_id)
            .and_then(|id| state.orders.get(id))
            .map(|o| OrderStatusReport {
                exchange_order_id: o.exchange_order_id,
                client_id: o.client_id,
                status: o.status,
                filled_quantity: o.filled,
            });
        Ok(report)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ExchangeEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.state.lock().await.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::new("BTC-PERP")
    }

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    async fn exchange() -> SimulatedExchange {
        let sim = SimulatedExchange::new(EngineConfig::simulation().markets);
        sim.deposit(&Token::new("USDC"), Amount::new(dec!(100000))).await;
        sim.set_book(MarketSnapshot::new(btc(), Some(px(dec!(49999))), Some(px(dec!(50001))), Timestamp::from_millis(1)))
            .await;
        sim
    }

    fn limit(cid: u64, side: Side, price: Decimal, liquidity: Liquidity) -> PlaceOrderRequest {
        PlaceOrderRequest {
            client_id: CorrelationId(cid),
            symbol: btc(),
            side,
            quantity: dec!(1),
            price: Some(px(price)),
            kind: OrderKind::Limit(liquidity),
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn maker_rests_then_fills_on_trade() {
        let sim = exchange().await;
        let mut rx = sim.subscribe().await.unwrap();

        let ack = sim.place_order(limit(1, Side::Buy, dec!(49990), Liquidity::Maker)).await.unwrap();
        assert_eq!(sim.query_open_orders().await.unwrap().len(), 1);

        let filled = sim.trade_through(&btc(), px(dec!(49985)), dec!(0.4)).await;
        assert_eq!(filled, dec!(0.4));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, Sequence(1));
        assert!(matches!(first.kind, ExchangeEventKind::OrderAcknowledged { .. }));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, Sequence(2));
        match second.kind {
            ExchangeEventKind::OrderFilled { order, quantity, price, .. } => {
                assert_eq!(order.exchange_order_id, Some(ack.exchange_order_id));
                assert_eq!(quantity, dec!(0.4));
                assert_eq!(price, px(dec!(49990)));
            }
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(sim.position(&btc()).await, dec!(0.4));
    }

    #[tokio::test]
    async fn post_only_cross_is_rejected() {
        let sim = exchange().await;
        let err = sim.place_order(limit(1, Side::Buy, dec!(50005), Liquidity::Maker)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
        assert_eq!(sim.stats().await.orders_rejected, 1);
    }

    #[tokio::test]
    async fn market_order_fills_at_touch_and_pays_taker_fee() {
        let sim = exchange().await;
        let request = PlaceOrderRequest {
            client_id: CorrelationId(7),
            symbol: btc(),
            side: Side::Buy,
            quantity: dec!(1),
            price: None,
            kind: OrderKind::Market,
            reduce_only: false,
        };
        sim.place_order(request).await.unwrap();
        assert_eq!(sim.position(&btc()).await, dec!(1));
        // 50001 * 5 bps
        assert_eq!(sim.balance(&Token::new("USDC")).await, Amount::new(dec!(100000) - dec!(25.0005)));
    }

    #[tokio::test]
    async fn retried_client_id_is_idempotent() {
        let sim = exchange().await;
        sim.inject_fault(SimFault::TimeoutAfterAccept).await;
        let request = limit(3, Side::Sell, dec!(50100), Liquidity::Maker);
        assert_eq!(sim.place_order(request.clone()).await, Err(ExchangeError::Timeout));

        let report = sim.query_order(CorrelationId(3)).await.unwrap().unwrap();
        let again = sim.place_order(request).await.unwrap();
        assert_eq!(again.exchange_order_id, report.exchange_order_id);
        assert_eq!(sim.query_open_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_twice_reports_gone() {
        let sim = exchange().await;
        let ack = sim.place_order(limit(1, Side::Buy, dec!(49990), Liquidity::Maker)).await.unwrap();
        assert_eq!(sim.cancel_order(&btc(), ack.exchange_order_id).await, Ok(CancelAck::Accepted));
        assert_eq!(sim.cancel_order(&btc(), ack.exchange_order_id).await, Ok(CancelAck::AlreadyGone));
        assert_eq!(sim.cancel_order(&btc(), ExchangeOrderId(999)).await, Err(ExchangeError::UnknownOrder));
    }

    #[tokio::test]
    async fn funding_charges_longs_on_positive_rate() {
        let sim = exchange().await;
        sim.place_order(PlaceOrderRequest {
            client_id: CorrelationId(1),
            symbol: btc(),
            side: Side::Buy,
            quantity: dec!(1),
            price: None,
            kind: OrderKind::Market,
            reduce_only: false,
        })
        .await
        .unwrap();
        let paid = sim.apply_funding(&btc(), dec!(0.0001)).await.unwrap();
        assert_eq!(paid, Amount::new(dec!(-5)));
    }
}
