// 8.0 engine/core.rs: the coordinator. owns registry, ledger, positions and every piece of
// per-symbol state. deterministic and free of I/O: exchange work is queued in an outbox
// that the runtime drains.

use super::results::{EngineError, EngineSummary, ExchangeCommand};
use crate::config::{EngineConfig, MarketSpec};
use crate::events::{EngineEvent, EngineEventKind, EventId, Severity};
use crate::inventory::{Balance, InventoryLedger};
use crate::journal::{Journal, JournalEntry, JournalRecord, MemoryJournal};
use crate::market::MarketSnapshot;
use crate::order::Order;
use crate::position::{Position, PositionBook};
use crate::quoting::QuoteEngine;
use crate::reconcile::ReconciliationLoop;
use crate::registry::OrderRegistry;
use crate::risk::RiskGate;
use crate::sequencer::{EventSequencer, SequencerConfig};
use crate::types::{Amount, CorrelationId, Symbol, Timestamp, Token};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{error, info, warn};

/** 8.1: coordinator struct. all mutable engine state lives here */
pub struct ExecutionCoordinator {
    pub(super) config: EngineConfig,
    pub(super) markets: BTreeMap<Symbol, MarketSpec>,
    pub(super) registry: OrderRegistry,
    pub(super) ledger: InventoryLedger,
    pub(super) positions: PositionBook,
    pub(super) sequencer: EventSequencer,
    pub(super) risk: RiskGate,
    pub(super) quotes: QuoteEngine,
    pub(super) recon: ReconciliationLoop,
    pub(super) snapshots: HashMap<Symbol, MarketSnapshot>,
    // cancels actually sent; a deferred cancel is sent once its order is acknowledged
    pub(super) cancels_dispatched: HashSet<CorrelationId>,
    // orders the startup sweep already handled
    pub(super) swept: HashSet<CorrelationId>,
    pub(super) events: VecDeque<EngineEvent>,
    pub(super) next_event_id: u64,
    pub(super) outbox: VecDeque<ExchangeCommand>,
    pub(super) journal: Box<dyn Journal>,
    // set while rebuilding from the journal: nothing is journaled or sent
    pub(super) replaying: bool,
    pub(super) current_time: Timestamp,
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("markets", &self.markets.keys().collect::<Vec<_>>())
            .field("live_orders", &self.registry.live_count())
            .field("breaker", self.risk.breaker())
            .field("outbox", &self.outbox.len())
            .field("replaying", &self.replaying)
            .finish()
    }
}

impl ExecutionCoordinator {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_journal(config, Box::new(MemoryJournal::new()))
    }

    pub fn with_journal(config: EngineConfig, journal: Box<dyn Journal>) -> Result<Self, EngineError> {
        config.validate()?;

        let markets: BTreeMap<Symbol, MarketSpec> =
            config.markets.iter().map(|m| (m.symbol.clone(), m.clone())).collect();
        let sequencer = EventSequencer::new(SequencerConfig {
            max_reorder_wait_ms: config.execution.max_reorder_wait_ms,
            max_buffered_events: config.execution.max_buffered_events,
        });
        let mut quotes = QuoteEngine::new(config.quoting.clone());
        for market in markets.values().filter(|m| m.quoting_enabled) {
            quotes.start(&market.symbol);
        }

        info!(markets = markets.len(), reference = %config.reference_token, "coordinator created");
        Ok(Self {
            registry: OrderRegistry::new(config.execution.max_archived_orders),
            ledger: InventoryLedger::new(),
            positions: PositionBook::new(),
            sequencer,
            risk: RiskGate::new(config.risk.clone()),
            quotes,
            recon: ReconciliationLoop::new(config.reconciliation.clone(), config.risk.inventory_tolerance),
            snapshots: HashMap::new(),
            cancels_dispatched: HashSet::new(),
            swept: HashSet::new(),
            events: VecDeque::new(),
            next_event_id: 1,
            outbox: VecDeque::new(),
            journal,
            replaying: false,
            current_time: Timestamp::from_millis(0),
            markets,
            config,
        })
    }

    pub fn set_time(&mut self, timestamp: Timestamp) {
        // the clock never runs backwards
        self.current_time = self.current_time.max(timestamp);
    }

    pub fn time(&self) -> Timestamp {
        self.current_time
    }

    pub fn advance_time(&mut self, millis: i64) {
        self.current_time = self.current_time.plus_millis(millis);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn market(&self, symbol: &Symbol) -> Result<&MarketSpec, EngineError> {
        self.markets.get(symbol).ok_or_else(|| EngineError::UnknownMarket(symbol.clone()))
    }

    pub fn registry(&self) -> &OrderRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &InventoryLedger {
        &self.ledger
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn risk(&self) -> &RiskGate {
        &self.risk
    }

    pub fn quotes(&self) -> &QuoteEngine {
        &self.quotes
    }

    pub fn order(&self, id: CorrelationId) -> Option<&Order> {
        self.registry.get(id)
    }

    pub fn balance(&self, token: &Token) -> Balance {
        self.ledger.balance(token)
    }

    pub fn position_size(&self, symbol: &Symbol) -> Decimal {
        self.positions.size(symbol).value()
    }

    pub fn snapshot(&self, symbol: &Symbol) -> Option<&MarketSnapshot> {
        self.snapshots.get(symbol)
    }

    pub fn events(&self) -> impl Iterator<Item = &EngineEvent> {
        self.events.iter()
    }

    /// Reference-token total plus unrealized pnl across every symbol.
    pub fn equity(&self) -> Amount {
        self.ledger
            .balance(&self.config.reference_token)
            .total()
            .add(self.positions.total_unrealized())
    }

    /// Seed a starting balance. Existing locks are kept.
    pub fn seed_balance(&mut self, token: &Token, total: Amount) -> Result<(), EngineError> {
        self.ledger.seed(token, total)?;
        self.record(JournalRecord::BalanceSeeded {
            token: token.clone(),
            total,
        })
    }

    /// Take every queued exchange command, oldest first.
    pub fn take_commands(&mut self) -> Vec<ExchangeCommand> {
        self.outbox.drain(..).collect()
    }

    pub fn pending_commands(&self) -> usize {
        self.outbox.len()
    }

    /// Everything journaled so far, oldest first.
    pub fn journal_entries(&self) -> Result<Vec<JournalEntry>, EngineError> {
        Ok(self.journal.entries()?)
    }

    pub fn summary(&self) -> EngineSummary {
        EngineSummary {
            equity: self.equity(),
            balances: self.ledger.balances().map(|(t, b)| (t.clone(), *b)).collect(),
            positions: self.positions.positions().cloned().collect::<Vec<Position>>(),
            live_orders: self.registry.live_orders().cloned().collect(),
            breaker: self.risk.breaker().clone(),
            halted_tokens: self.risk.halted_tokens().cloned().collect(),
            recent_events: self.events.iter().rev().take(50).cloned().collect(),
        }
    }

    pub(super) fn queue(&mut self, command: ExchangeCommand) {
        if self.replaying {
            return;
        }
        if command == ExchangeCommand::Resync && self.outbox.contains(&ExchangeCommand::Resync) {
            return;
        }
        self.outbox.push_back(command);
    }

    pub(super) fn record(&mut self, record: JournalRecord) -> Result<(), EngineError> {
        if self.replaying {
            return Ok(());
        }
        let entry = JournalEntry {
            at: self.current_time,
            record,
        };
        self.journal.append(&entry).map_err(|e| {
            error!(error = %e, "journal append failed");
            EngineError::from(e)
        })
    }

    pub(super) fn emit(&mut self, kind: EngineEventKind) {
        match kind.severity() {
            Severity::Critical => error!(event = ?kind, "engine alert"),
            Severity::Warning => warn!(event = ?kind, "engine alert"),
            Severity::Info => info!(event = ?kind, "engine event"),
        }

        let event = EngineEvent::new(EventId(self.next_event_id), self.current_time, kind);
        self.next_event_id += 1;
        self.events.push_back(event);

        while self.events.len() > self.config.execution.max_events {
            self.events.pop_front();
        }
    }
}
