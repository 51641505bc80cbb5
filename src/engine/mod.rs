// 8.0: execution coordinator. owns the order registry, the inventory ledger and the
// position book, gates intents through risk, ingests the sequenced exchange stream and
// runs the quote cycle. deterministic with no external I/O; the runtime drains its outbox.

mod core;
mod funding;
mod ingest;
mod orders;
mod outcomes;
mod pricing;
mod recovery;
mod results;

pub use self::core::ExecutionCoordinator;
pub use results::{CommandOutcome, EngineError, EngineSummary, ErrorClass, ExchangeCommand};
