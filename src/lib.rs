// perps-mm: live order and market-making engine for perpetual futures.
// risk-first order lifecycle: nothing reaches the exchange until risk and inventory agree.
// the coordinator is deterministic with no external I/O; runtime.rs wraps it in tokio.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: Symbol, Token, CorrelationId, Price, Amount, Timestamp
//   2.x  order.rs: intents, orders, lifecycle state machine
//   2.1x registry.rs: order registry, exchange-id index, archive
//   2.2  sequencer.rs: per-symbol ordering of the exchange stream
//   3.x  inventory.rs: free/locked balances and per-order reservations
//   4.x  position.rs: positions, pnl, increase/reduce/flip, position book
//   5.x  quoting.rs: Avellaneda-Stoikov quotes, size skew, quote diffing
//   5.1  market.rs: market snapshot + rolling volatility
//   6.x  risk.rs: pre-trade gate, drawdown breaker, halts
//   6.4  drawdown.rs: rolling high-water mark
//   7.x  config.rs: markets, risk limits, quoting, timing
//   8.x  engine/: coordinator: orders, ingest, funding, pricing, recovery, outcomes
//   9.x  exchange.rs: exchange client trait + wire types
//   9.1  sim.rs: simulated exchange
//   9.2  runtime.rs: tokio loop, handle, retries
//   10.x reconcile.rs: periodic reconciliation against exchange snapshots
//   10.1 journal.rs: append-only journal + replay records
//   11.x events.rs: exchange events, transfers, engine alerts

// core modules
pub mod engine;
pub mod events;
pub mod inventory;
pub mod market;
pub mod order;
pub mod position;
pub mod registry;
pub mod sequencer;
pub mod types;

// risk and quoting
pub mod drawdown;
pub mod quoting;
pub mod risk;

// integration modules
pub mod config;
pub mod exchange;
pub mod journal;
pub mod logging;
pub mod reconcile;
pub mod runtime;
pub mod sim;

// re exports for convenience
pub use config::{EngineConfig, ExecutionConfig, Horizon, MarketSpec, QuotingConfig, ReconciliationConfig, RiskConfig};
pub use engine::*;
pub use events::*;
pub use exchange::{
    BalanceSnapshot, CancelAck, ExchangeClient, ExchangeError, ExchangeSnapshot, OpenOrderSnapshot, OrderStatusReport,
    PlaceAck, PlaceOrderRequest,
};
pub use inventory::{Balance, InventoryLedger, LedgerError};
pub use journal::{FileJournal, Journal, JournalEntry, JournalError, JournalRecord, MemoryJournal};
pub use market::MarketSnapshot;
pub use order::*;
pub use position::*;
pub use quoting::{Quote, QuoteEngine, QuoteLevel, QuotePlan};
pub use registry::{OrderRegistry, RegistryError};
pub use risk::{BreakerState, RiskGate, RiskRejection, RiskSnapshot};
pub use runtime::{EngineHandle, EngineInput, EngineRuntime};
pub use sim::{SimFault, SimulatedExchange};
pub use types::*;
