//! Periodic comparison of local state with an exchange snapshot.
//!
//! The comparison is pure bookkeeping: it returns a `ReconciliationPlan` and the coordinator
//! applies it. Divergences are not trusted on first sight. A local order missing from the
//! exchange, or a balance outside tolerance, becomes a suspect and triggers a re-sync; only
//! after `confirm_after` consecutive snapshots agree is it corrected. Exchange orders the
//! registry doesn't know are cancelled, once each.

use crate::config::ReconciliationConfig;
use crate::events::{EngineEventKind, OrderRef};
use crate::exchange::ExchangeSnapshot;
use crate::inventory::InventoryLedger;
use crate::registry::OrderRegistry;
use crate::types::{Amount, CorrelationId, ExchangeOrderId, Symbol, Timestamp, Token};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ReconciliationPlan {
    pub cancel_unknown: Vec<(Symbol, ExchangeOrderId)>,
    pub expire_local: Vec<CorrelationId>,
    /// Token and the exchange-confirmed total to move to.
    pub adjust_balances: Vec<(Token, Amount)>,
    pub alerts: Vec<EngineEventKind>,
    /// Suspects exist; re-query before the next scheduled pass.
    pub resync: bool,
}

impl ReconciliationPlan {
    pub fn is_clean(&self) -> bool {
        self.cancel_unknown.is_empty()
            && self.expire_local.is_empty()
            && self.adjust_balances.is_empty()
            && self.alerts.is_empty()
    }
}

#[derive(Debug)]
pub struct ReconciliationLoop {
    config: ReconciliationConfig,
    tolerance: Decimal,
    order_strikes: HashMap<CorrelationId, u32>,
    balance_strikes: HashMap<Token, u32>,
    unknown_cancelled: HashSet<ExchangeOrderId>,
    last_run: Option<Timestamp>,
    // suspects pull the next pass forward to one grace period out
    early_run_at: Option<Timestamp>,
}

impl ReconciliationLoop {
    pub fn new(config: ReconciliationConfig, tolerance: Decimal) -> Self {
        Self {
            config,
            tolerance,
            order_strikes: HashMap::new(),
            balance_strikes: HashMap::new(),
            unknown_cancelled: HashSet::new(),
            last_run: None,
            early_run_at: None,
        }
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        if self.early_run_at.is_some_and(|at| now >= at) {
            return true;
        }
        match self.last_run {
            Some(last) => now.millis_since(last) >= self.config.balance_recon_interval_ms as i64,
            None => true,
        }
    }

    pub fn suspects(&self) -> usize {
        self.order_strikes.len() + self.balance_strikes.len()
    }

    pub fn compare(
        &mut self,
        snapshot: &ExchangeSnapshot,
        registry: &OrderRegistry,
        ledger: &InventoryLedger,
        now: Timestamp,
    ) -> ReconciliationPlan {
        self.last_run = Some(now);
        let mut plan = ReconciliationPlan::default();
        self.compare_orders(snapshot, registry, now, &mut plan);
        self.compare_balances(snapshot, ledger, &mut plan);
        plan.resync = self.suspects() > 0;
        self.early_run_at = plan
            .resync
            .then(|| now.plus_millis(self.config.order_grace_ms.min(self.config.balance_recon_interval_ms) as i64));
        debug!(
            unknown = plan.cancel_unknown.len(),
            expired = plan.expire_local.len(),
            adjusted = plan.adjust_balances.len(),
            suspects = self.suspects(),
            "reconciliation pass"
        );
        plan
    }

    fn compare_orders(
        &mut self,
        snapshot: &ExchangeSnapshot,
        registry: &OrderRegistry,
        now: Timestamp,
        plan: &mut ReconciliationPlan,
    ) {
        let mut seen = BTreeSet::new();
        for remote in &snapshot.open_orders {
            let reference = OrderRef::new(remote.exchange_order_id, remote.client_id);
            let live = registry
                .resolve(&reference)
                .filter(|id| registry.get(*id).is_some_and(|o| o.is_live()));
            match live {
                Some(id) => {
                    seen.insert(id);
                }
                None => {
                    if self.unknown_cancelled.insert(remote.exchange_order_id) {
                        warn!(symbol = %remote.symbol, exchange_order_id = %remote.exchange_order_id, "unknown exchange order");
                        plan.cancel_unknown.push((remote.symbol.clone(), remote.exchange_order_id));
                        plan.alerts.push(EngineEventKind::UnknownExchangeOrder {
                            symbol: remote.symbol.clone(),
                            exchange_order_id: remote.exchange_order_id,
                        });
                    }
                }
            }
        }

        // an unknown order the exchange stopped reporting may be cancelled again if it returns
        let reported: HashSet<ExchangeOrderId> = snapshot.open_orders.iter().map(|o| o.exchange_order_id).collect();
        self.unknown_cancelled.retain(|eid| reported.contains(eid));

        let grace = self.config.order_grace_ms as i64;
        let mut missing = Vec::new();
        for order in registry.live_orders() {
            if seen.contains(&order.correlation_id) {
                continue;
            }
            if now.millis_since(order.created_at) < grace {
                continue;
            }
            missing.push(order.correlation_id);
        }
        missing.sort();

        // orders that are back (or gone for good) drop their strikes
        self.order_strikes.retain(|id, _| missing.contains(id));

        for id in missing {
            let strikes = self.order_strikes.entry(id).or_insert(0);
            *strikes += 1;
            let confirmed = *strikes >= self.config.confirm_after;
            plan.alerts.push(EngineEventKind::OrderMissingOnExchange {
                correlation_id: id,
                confirmed,
            });
            if confirmed {
                warn!(correlation_id = %id, "order confirmed missing on exchange");
                self.order_strikes.remove(&id);
                plan.expire_local.push(id);
            }
        }
    }

    fn compare_balances(&mut self, snapshot: &ExchangeSnapshot, ledger: &InventoryLedger, plan: &mut ReconciliationPlan) {
        let mut diverged = HashSet::new();
        for remote in &snapshot.balances {
            let local = ledger.balance(&remote.token).total();
            if (local.value() - remote.total.value()).abs() <= self.tolerance {
                continue;
            }
            diverged.insert(remote.token.clone());

            let strikes = self.balance_strikes.entry(remote.token.clone()).or_insert(0);
            *strikes += 1;
            let confirmed = *strikes >= self.config.confirm_after;
            warn!(token = %remote.token, %local, exchange = %remote.total, confirmed, "balance divergence");
            plan.alerts.push(EngineEventKind::BalanceDivergence {
                token: remote.token.clone(),
                local,
                exchange: remote.total,
                confirmed,
            });
            if confirmed {
                self.balance_strikes.remove(&remote.token);
                diverged.remove(&remote.token);
                plan.adjust_balances.push((remote.token.clone(), remote.total));
            }
        }
        self.balance_strikes.retain(|token, _| diverged.contains(token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BalanceSnapshot, OpenOrderSnapshot};
    use crate::order::{Liquidity, OrderIntent};
    use crate::types::{Price, Side};
    use rust_decimal_macros::dec;

    fn cfg() -> ReconciliationConfig {
        ReconciliationConfig {
            balance_recon_interval_ms: 1_000,
            confirm_after: 2,
            order_grace_ms: 500,
        }
    }

    fn registry_with_order() -> (OrderRegistry, CorrelationId) {
        let mut reg = OrderRegistry::new(100);
        let intent = OrderIntent::limit(
            Symbol::new("BTC-PERP"),
            Side::Buy,
            dec!(1),
            Price::new_unchecked(dec!(50000)),
            Liquidity::Maker,
        );
        let id = reg.submit(&intent, Timestamp::from_millis(0)).unwrap();
        reg.bind_exchange_id(id, ExchangeOrderId(11)).unwrap();
        reg.acknowledge(id, Timestamp::from_millis(1)).unwrap();
        (reg, id)
    }

    fn ledger(total: Decimal) -> InventoryLedger {
        let mut l = InventoryLedger::new();
        l.seed(&Token::new("USDC"), Amount::new(total)).unwrap();
        l
    }

    fn snapshot(orders: Vec<OpenOrderSnapshot>, usdc: Decimal, at: i64) -> ExchangeSnapshot {
        ExchangeSnapshot {
            open_orders: orders,
            balances: vec![BalanceSnapshot {
                token: Token::new("USDC"),
                total: Amount::new(usdc),
            }],
            taken_at: Timestamp::from_millis(at),
        }
    }

    fn remote(eid: u64, cid: Option<u64>) -> OpenOrderSnapshot {
        OpenOrderSnapshot {
            exchange_order_id: ExchangeOrderId(eid),
            client_id: cid.map(CorrelationId),
            symbol: Symbol::new("BTC-PERP"),
            side: Side::Sell,
            quantity: dec!(1),
            filled_quantity: Decimal::ZERO,
            price: Some(Price::new_unchecked(dec!(51000))),
        }
    }

    #[test]
    fn matching_state_is_clean() {
        let (reg, id) = registry_with_order();
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        let snap = snapshot(vec![remote(11, Some(id.0))], dec!(1000), 1_000);
        let plan = recon.compare(&snap, &reg, &ledger(dec!(1000)), Timestamp::from_millis(1_000));
        assert!(plan.is_clean());
        assert!(!plan.resync);
    }

    #[test]
    fn unknown_exchange_order_cancelled_once() {
        let (reg, id) = registry_with_order();
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        let snap = snapshot(vec![remote(11, Some(id.0)), remote(99, None)], dec!(1000), 1_000);

        let first = recon.compare(&snap, &reg, &ledger(dec!(1000)), Timestamp::from_millis(1_000));
        assert_eq!(first.cancel_unknown, vec![(Symbol::new("BTC-PERP"), ExchangeOrderId(99))]);

        let second = recon.compare(&snap, &reg, &ledger(dec!(1000)), Timestamp::from_millis(2_000));
        assert!(second.cancel_unknown.is_empty());
    }

    #[test]
    fn missing_order_needs_confirmation() {
        let (reg, id) = registry_with_order();
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        let snap = snapshot(vec![], dec!(1000), 1_000);

        let first = recon.compare(&snap, &reg, &ledger(dec!(1000)), Timestamp::from_millis(1_000));
        assert!(first.expire_local.is_empty());
        assert!(first.resync);

        let second = recon.compare(&snap, &reg, &ledger(dec!(1000)), Timestamp::from_millis(2_000));
        assert_eq!(second.expire_local, vec![id]);
    }

    #[test]
    fn young_orders_are_ignored() {
        let (reg, _) = registry_with_order();
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        let snap = snapshot(vec![], dec!(1000), 100);
        let plan = recon.compare(&snap, &reg, &ledger(dec!(1000)), Timestamp::from_millis(100));
        assert!(plan.is_clean());
    }

    #[test]
    fn suspect_cleared_when_order_reappears() {
        let (reg, id) = registry_with_order();
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        recon.compare(&snapshot(vec![], dec!(1000), 1_000), &reg, &ledger(dec!(1000)), Timestamp::from_millis(1_000));
        recon.compare(
            &snapshot(vec![remote(11, Some(id.0))], dec!(1000), 2_000),
            &reg,
            &ledger(dec!(1000)),
            Timestamp::from_millis(2_000),
        );
        // strike counter restarted, so one more miss is not enough
        let plan = recon.compare(&snapshot(vec![], dec!(1000), 3_000), &reg, &ledger(dec!(1000)), Timestamp::from_millis(3_000));
        assert!(plan.expire_local.is_empty());
    }

    #[test]
    fn balance_divergence_within_tolerance_ignored() {
        let reg = OrderRegistry::new(10);
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        let plan = recon.compare(&snapshot(vec![], dec!(1000.005), 0), &reg, &ledger(dec!(1000)), Timestamp::from_millis(0));
        assert!(plan.is_clean());
    }

    #[test]
    fn balance_divergence_confirmed_then_adjusted() {
        let reg = OrderRegistry::new(10);
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        let local = ledger(dec!(1000));
        let snap = snapshot(vec![], dec!(990), 0);

        let first = recon.compare(&snap, &reg, &local, Timestamp::from_millis(0));
        assert!(first.adjust_balances.is_empty());
        assert_eq!(first.alerts.len(), 1);

        let second = recon.compare(&snap, &reg, &local, Timestamp::from_millis(1_000));
        assert_eq!(second.adjust_balances, vec![(Token::new("USDC"), Amount::new(dec!(990)))]);
    }

    #[test]
    fn suspects_pull_the_next_pass_forward() {
        let reg = OrderRegistry::new(10);
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        let plan = recon.compare(&snapshot(vec![], dec!(990), 0), &reg, &ledger(dec!(1000)), Timestamp::from_millis(0));
        assert!(plan.resync);
        // grace is 500ms, interval 1000ms
        assert!(!recon.is_due(Timestamp::from_millis(499)));
        assert!(recon.is_due(Timestamp::from_millis(500)));
    }

    #[test]
    fn due_on_interval() {
        let reg = OrderRegistry::new(10);
        let mut recon = ReconciliationLoop::new(cfg(), dec!(0.01));
        assert!(recon.is_due(Timestamp::from_millis(0)));
        recon.compare(&snapshot(vec![], dec!(1000), 0), &reg, &ledger(dec!(1000)), Timestamp::from_millis(0));
        assert!(!recon.is_due(Timestamp::from_millis(500)));
        assert!(recon.is_due(Timestamp::from_millis(1_000)));
    }
}
