//! Token inventory: free, locked and total balances.
//!
//! Placing an order locks margin out of free balance, fills release their share of that lock and
//! book the cash delta, cancels and rejects unlock the rest. Every reservation is keyed by the
//! order's correlation id so the ledger alone knows what is locked and why. `free + locked`
//! is the total by construction, and any operation that would take a component negative is
//! refused before it mutates anything.

use crate::types::{Amount, CorrelationId, Token};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub free: Amount,
    pub locked: Amount,
}

impl Balance {
    pub fn total(&self) -> Amount {
        self.free.add(self.locked)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub token: Token,
    /// Still locked.
    pub amount: Amount,
    /// Order quantity the remaining lock covers.
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient free {token}: requested {requested}, available {available}")]
    InsufficientFree {
        token: Token,
        requested: Amount,
        available: Amount,
    },

    #[error("{operation} would drive {token} negative (free {free}, delta {delta})")]
    NegativeBalance {
        token: Token,
        operation: &'static str,
        free: Amount,
        delta: Amount,
    },

    #[error("Reservation for {0} already exists")]
    DuplicateReservation(CorrelationId),
}

impl LedgerError {
    /// Negative balances mean the books are wrong. Everything else is a plain rejection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::NegativeBalance { .. })
    }
}

/// A validated fill settlement. Build with `plan_fill`, apply with `apply_fill`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillSettlement {
    pub correlation_id: Option<CorrelationId>,
    pub token: Token,
    pub filled_quantity: Decimal,
    pub released: Amount,
    pub cash_delta: Amount,
}

#[derive(Debug, Default)]
pub struct InventoryLedger {
    balances: BTreeMap<Token, Balance>,
    reservations: HashMap<CorrelationId, Reservation>,
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, token: &Token) -> Balance {
        self.balances.get(token).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> impl Iterator<Item = (&Token, &Balance)> {
        self.balances.iter()
    }

    pub fn reservation(&self, id: CorrelationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Sum of outstanding reservations for a token. Always equal to its locked balance.
    pub fn reserved_total(&self, token: &Token) -> Amount {
        self.reservations
            .values()
            .filter(|r| &r.token == token)
            .map(|r| r.amount)
            .sum()
    }

    // 3.1: seed the starting total. existing locks are kept, free absorbs the difference
    pub fn seed(&mut self, token: &Token, total: Amount) -> Result<(), LedgerError> {
        let current = self.balance(token);
        let free = total.sub(current.locked);
        if free.is_negative() {
            return Err(LedgerError::NegativeBalance {
                token: token.clone(),
                operation: "seed",
                free: current.free,
                delta: total.sub(current.total()),
            });
        }
        info!(%token, %total, "balance seeded");
        self.balances.insert(
            token.clone(),
            Balance {
                free,
                locked: current.locked,
            },
        );
        Ok(())
    }

    // 3.2: reserve. free -> locked, keyed by the order
    pub fn reserve(
        &mut self,
        id: CorrelationId,
        token: &Token,
        amount: Amount,
        quantity: Decimal,
    ) -> Result<(), LedgerError> {
        if self.reservations.contains_key(&id) {
            return Err(LedgerError::DuplicateReservation(id));
        }
        self.check_reserve(token, amount)?;

        let balance = self.balances.entry(token.clone()).or_default();
        balance.free = balance.free.sub(amount);
        balance.locked = balance.locked.add(amount);
        self.reservations.insert(
            id,
            Reservation {
                token: token.clone(),
                amount,
                quantity,
            },
        );
        debug!(correlation_id = %id, %token, %amount, "reserved");
        Ok(())
    }

    pub fn check_reserve(&self, token: &Token, amount: Amount) -> Result<(), LedgerError> {
        let available = self.balance(token).free;
        if amount > available {
            return Err(LedgerError::InsufficientFree {
                token: token.clone(),
                requested: amount,
                available,
            });
        }
        Ok(())
    }

    // 3.3: release whatever is still locked for the order. cancel, reject and expire land here.
    // orders that never reserved (reduce-only) release nothing
    pub fn release(&mut self, id: CorrelationId) -> Amount {
        let Some(reservation) = self.reservations.remove(&id) else {
            return Amount::zero();
        };
        if let Some(balance) = self.balances.get_mut(&reservation.token) {
            balance.locked = balance.locked.sub(reservation.amount);
            balance.free = balance.free.add(reservation.amount);
        }
        debug!(correlation_id = %id, token = %reservation.token, amount = %reservation.amount, "released");
        reservation.amount
    }

    // 3.4: validate a fill's effect. nothing changes until apply_fill
    pub fn plan_fill(
        &self,
        id: Option<CorrelationId>,
        token: &Token,
        filled_quantity: Decimal,
        cash_delta: Amount,
    ) -> Result<FillSettlement, LedgerError> {
        let released = match id.and_then(|id| self.reservations.get(&id)) {
            Some(r) if r.quantity > Decimal::ZERO => {
                if filled_quantity >= r.quantity {
                    r.amount
                } else {
                    r.amount.mul(filled_quantity / r.quantity)
                }
            }
            _ => Amount::zero(),
        };

        let balance = self.balance(token);
        if balance.free.add(released).add(cash_delta).is_negative() {
            return Err(LedgerError::NegativeBalance {
                token: token.clone(),
                operation: "fill settlement",
                free: balance.free,
                delta: released.add(cash_delta),
            });
        }

        Ok(FillSettlement {
            correlation_id: id,
            token: token.clone(),
            filled_quantity,
            released,
            cash_delta,
        })
    }

    pub fn apply_fill(&mut self, settlement: &FillSettlement) {
        if let Some(id) = settlement.correlation_id {
            let exhausted = match self.reservations.get_mut(&id) {
                Some(r) => {
                    r.amount = r.amount.sub(settlement.released);
                    r.quantity = (r.quantity - settlement.filled_quantity).max(Decimal::ZERO);
                    r.quantity.is_zero() || r.amount.is_zero()
                }
                None => false,
            };
            if exhausted {
                self.reservations.remove(&id);
            }
        }

        let balance = self.balances.entry(settlement.token.clone()).or_default();
        balance.locked = balance.locked.sub(settlement.released);
        balance.free = balance.free.add(settlement.released).add(settlement.cash_delta);
    }

    // 3.5: book a cash movement straight to free balance (funding, transfers)
    pub fn settle(&mut self, token: &Token, delta: Amount, operation: &'static str) -> Result<(), LedgerError> {
        let balance = self.balance(token);
        if balance.free.add(delta).is_negative() {
            return Err(LedgerError::NegativeBalance {
                token: token.clone(),
                operation,
                free: balance.free,
                delta,
            });
        }
        let entry = self.balances.entry(token.clone()).or_default();
        entry.free = entry.free.add(delta);
        debug!(%token, %delta, operation, "settled");
        Ok(())
    }

    /// Move the total to an externally confirmed figure. Locks stay where they are.
    pub fn adjust_total(&mut self, token: &Token, total: Amount) -> Result<Amount, LedgerError> {
        let current = self.balance(token);
        let delta = total.sub(current.total());
        self.settle(token, delta, "reconciliation adjustment")?;
        Ok(delta)
    }
}
