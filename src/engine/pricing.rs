//! Market data, the drawdown breaker and the quote cycle.

use super::core::ExecutionCoordinator;
use super::results::{EngineError, ExchangeCommand};
use crate::events::EngineEventKind;
use crate::market::MarketSnapshot;
use crate::order::Order;
use crate::quoting::QuotePlan;
use crate::risk::Halt;
use crate::types::{CorrelationId, Side, Symbol, Token};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl ExecutionCoordinator {
    // 8.5: one market data tick. marks positions, feeds the breaker, maybe re-quotes
    pub fn on_market(&mut self, snapshot: MarketSnapshot) -> Result<Option<QuotePlan>, EngineError> {
        let market = self.market(&snapshot.symbol)?.clone();
        self.set_time(snapshot.timestamp);
        let now = self.current_time;

        self.quotes.observe(&snapshot);
        if let Some(mid) = snapshot.mid {
            self.positions.mark_to_market(&snapshot.symbol, mid, now);
        }
        let refresh = self.quotes.needs_refresh(&market, &snapshot, now);
        self.snapshots.insert(snapshot.symbol.clone(), snapshot);

        self.check_breaker();

        if refresh {
            return Ok(Some(self.run_quote_cycle(&market.symbol)?));
        }
        Ok(None)
    }

    /// Feed current equity to the breaker. Returns true the moment it trips.
    pub fn check_breaker(&mut self) -> bool {
        let equity = self.equity();
        let Some(trip) = self.risk.on_equity(equity, self.current_time) else {
            return false;
        };
        self.emit(EngineEventKind::BreakerTripped {
            equity: trip.equity,
            high_water_mark: trip.high_water_mark,
            drawdown: trip.drawdown,
        });

        let cancelled = self.cancel_all(None);
        let flattened = if trip.flatten { self.flatten_all().len() } else { 0 };
        warn!(cancelled, flattened, "breaker actions dispatched");
        true
    }

    /// Manual re-arm. The high-water mark restarts at current equity.
    pub fn reset_breaker(&mut self) -> bool {
        let equity = self.equity();
        let was_tripped = self.risk.reset(equity, self.current_time);
        if was_tripped {
            self.emit(EngineEventKind::BreakerReset { equity });
        }
        was_tripped
    }

    // 8.6: diff the target quote against what's resting, cancel first, then place
    pub fn run_quote_cycle(&mut self, symbol: &Symbol) -> Result<QuotePlan, EngineError> {
        let market = self.market(symbol)?.clone();
        if self.risk.is_tripped() || self.risk.is_halted(&market) || !self.quotes.is_enabled(symbol) {
            return Ok(QuotePlan::default());
        }
        let Some(snapshot) = self.snapshots.get(symbol).cloned() else {
            return Ok(QuotePlan::default());
        };

        let position = self.positions.size(symbol).value();
        let Some(quote) = self.quotes.compute(&market, &snapshot, position, self.current_time) else {
            return Ok(QuotePlan::default());
        };

        let resting: Vec<Order> = [Side::Buy, Side::Sell]
            .into_iter()
            .flat_map(|side| self.registry.working_maker_orders(symbol, side))
            .cloned()
            .collect();
        let resting_refs: Vec<&Order> = resting.iter().collect();
        let in_flight: Vec<Side> = [Side::Buy, Side::Sell]
            .into_iter()
            .filter(|side| self.registry.has_cancel_in_flight(symbol, *side))
            .collect();

        let plan = self.quotes.plan(&market, &quote, &resting_refs, &in_flight);
        self.quotes.record_quote(quote);

        for id in &plan.cancels {
            if let Err(e) = self.cancel(*id) {
                warn!(correlation_id = %id, error = %e, "quote cancel failed");
            }
        }
        for intent in &plan.places {
            match self.submit(intent.clone()) {
                Ok(id) => debug!(correlation_id = %id, side = %intent.side, "quote placed"),
                Err(e) if e.is_rejection() => debug!(%symbol, side = %intent.side, error = %e, "quote skipped"),
                Err(e) => warn!(%symbol, side = %intent.side, error = %e, "quote failed"),
            }
        }
        Ok(plan)
    }

    /// Timer tick: gap expiry, quote cadence, reconciliation schedule and archival.
    pub fn on_tick(&mut self) -> Result<(), EngineError> {
        self.expire_sequence_gaps()?;

        let due: Vec<Symbol> = self
            .markets
            .values()
            .filter(|m| {
                self.snapshots
                    .get(&m.symbol)
                    .is_some_and(|s| self.quotes.needs_refresh(m, s, self.current_time))
            })
            .map(|m| m.symbol.clone())
            .collect();
        for symbol in due {
            self.run_quote_cycle(&symbol)?;
        }

        if self.recon.is_due(self.current_time) {
            self.queue(ExchangeCommand::Resync);
        }

        if self.registry.archive_terminal() > 0 {
            let registry = &self.registry;
            self.cancels_dispatched.retain(|id| registry.get(*id).is_some_and(|o| o.is_live()));
            self.swept.retain(|id| registry.get(*id).is_some());
        }
        Ok(())
    }

    pub fn start_market_making(&mut self, symbol: &Symbol) -> Result<(), EngineError> {
        self.market(symbol)?;
        self.quotes.start(symbol);
        info!(%symbol, "market making started");
        Ok(())
    }

    /// Stops quoting and cancels the symbol's resting maker orders.
    pub fn stop_market_making(&mut self, symbol: &Symbol) -> Result<usize, EngineError> {
        self.market(symbol)?;
        self.quotes.stop(symbol);
        let makers: Vec<CorrelationId> = self
            .registry
            .live_orders_for(symbol)
            .filter(|o| o.kind.is_maker() && !o.cancel_in_flight())
            .map(|o| o.correlation_id)
            .collect();
        let mut cancelled = 0;
        for id in makers {
            match self.cancel(id) {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(correlation_id = %id, error = %e, "cancel failed"),
            }
        }
        info!(%symbol, cancelled, "market making stopped");
        Ok(cancelled)
    }

    fn symbols_using(&self, token: &Token) -> Vec<Symbol> {
        self.markets
            .values()
            .filter(|m| &m.base_token == token || &m.settlement_token == token)
            .map(|m| m.symbol.clone())
            .collect()
    }

    // 8.7: fatal ledger errors stop everything touching the token until cleared by hand
    pub fn halt_token(&mut self, token: &Token, reason: String) {
        let symbols = self.symbols_using(token);
        let halt = Halt {
            token: token.clone(),
            symbols: symbols.clone(),
            reason: reason.clone(),
        };
        self.risk.halt(&halt);
        self.emit(EngineEventKind::Halted {
            token: token.clone(),
            symbols: symbols.clone(),
            reason,
        });
        for symbol in &symbols {
            self.cancel_all(Some(symbol));
        }
    }

    /// Halt every token any market touches.
    pub fn halt_all(&mut self, reason: &str) {
        let tokens: BTreeSet<Token> = self
            .markets
            .values()
            .flat_map(|m| [m.base_token.clone(), m.settlement_token.clone()])
            .collect();
        for token in &tokens {
            self.halt_token(token, reason.to_string());
        }
    }

    pub fn clear_halt(&mut self, token: &Token) -> bool {
        let symbols = self.symbols_using(token);
        let cleared = self.risk.clear_halt(token, &symbols);
        if cleared {
            self.emit(EngineEventKind::HaltCleared { token: token.clone() });
        }
        cleared
    }
}
