//! Funding payments and on-chain transfers.

use super::core::ExecutionCoordinator;
use super::results::EngineError;
use crate::events::TransferSettled;
use crate::journal::JournalRecord;
use crate::types::{Amount, Symbol};
use rust_decimal::Decimal;
use tracing::info;

impl ExecutionCoordinator {
    // funding comes in on the exchange stream; cash and realized pnl move together
    pub(super) fn apply_funding(&mut self, symbol: &Symbol, rate: Decimal, amount: Amount) -> Result<(), EngineError> {
        let token = self.market(symbol)?.settlement_token.clone();
        self.ledger.settle(&token, amount, "funding")?;
        self.positions.apply_funding(symbol, amount, self.current_time);
        info!(%symbol, %rate, %amount, "funding applied");
        Ok(())
    }

    /// A settled deposit or withdrawal. Equity moves, but not as drawdown.
    pub fn on_transfer(&mut self, transfer: TransferSettled) -> Result<(), EngineError> {
        let delta = transfer.delta();
        if let Err(e) = self.ledger.settle(&transfer.token, delta, "transfer") {
            let error = EngineError::from(e);
            self.halt_token(&transfer.token, error.to_string());
            return Err(error);
        }
        if transfer.token == self.config.reference_token {
            self.risk.on_transfer(delta);
        }
        info!(token = %transfer.token, %delta, tx = %transfer.tx_hash, "transfer settled");
        self.record(JournalRecord::Transfer(transfer))
    }

    /// Expected funding on the current position. None when flat or never marked.
    pub fn estimate_funding(&self, symbol: &Symbol, rate: Decimal, hours: Decimal) -> Option<Amount> {
        self.positions.estimate_funding(symbol, rate, hours)
    }
}
