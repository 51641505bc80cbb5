// 4.0: per-symbol position tracking. pnl = size * (mark - entry).
// 4.1 has increase/reduce/flip logic at the bottom, 4.5 the book that owns positions.

use crate::types::{Amount, Price, Side, SignedSize, Symbol, Timestamp};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// utilization at which the book starts warning
pub const NEAR_LIMIT_RATIO: Decimal = dec!(0.8);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub size: SignedSize,
    // None while flat
    pub entry_price: Option<Price>,
    pub realized_pnl: Amount,
    pub unrealized_pnl: Amount,
    pub cumulative_funding: Amount,
    pub last_mark: Option<Price>,
    pub updated_at: Timestamp,
}

impl Position {
    pub fn flat(symbol: Symbol, timestamp: Timestamp) -> Self {
        Self {
            symbol,
            size: SignedSize::zero(),
            entry_price: None,
            realized_pnl: Amount::zero(),
            unrealized_pnl: Amount::zero(),
            cumulative_funding: Amount::zero(),
            last_mark: None,
            updated_at: timestamp,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    pub fn side(&self) -> Option<Side> {
        self.size.side()
    }

    // 4.1: paper gains/losses at a given price
    pub fn unrealized_at(&self, mark_price: Price) -> Amount {
        match self.entry_price {
            Some(entry) => calculate_unrealized_pnl(self.size, entry, mark_price),
            None => Amount::zero(),
        }
    }

    pub fn notional_value(&self, mark_price: Price) -> Amount {
        Amount::new(self.size.abs() * mark_price.value())
    }
}

// 4.2: the pnl formula. size * (mark - entry)
pub fn calculate_unrealized_pnl(size: SignedSize, entry_price: Price, mark_price: Price) -> Amount {
    Amount::new(size.value() * (mark_price.value() - entry_price.value()))
}

pub fn calculate_realized_pnl(close_size: SignedSize, entry_price: Price, exit_price: Price) -> Amount {
    Amount::new(close_size.value() * (exit_price.value() - entry_price.value()))
}

// 4.3: funding estimate over a period. positive = we pay.
// rate is quoted per day, scaled by hours / 24. divide last so 8h stays exact
pub fn estimate_funding_payment(size: SignedSize, mark_price: Price, rate: Decimal, hours: Decimal) -> Amount {
    Amount::new(size.value() * mark_price.value() * rate * hours / dec!(24))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionChange {
    pub previous: Position,
    pub next: Position,
    // realized by this fill only, before fees
    pub realized_pnl: Amount,
}

// 4.4: adds to the position. averages the entry price
pub fn increase_position(position: &Position, delta_size: Decimal, fill_price: Price, timestamp: Timestamp) -> Position {
    debug_assert!(
        (delta_size > Decimal::ZERO) == position.size.is_long() || position.is_flat(),
        "increase must be same direction as existing position"
    );

    let old_size = position.size.value();
    let new_size_value = old_size + delta_size;

    let new_entry = match position.entry_price {
        Some(entry) if !position.is_flat() => {
            let weighted_sum = old_size.abs() * entry.value() + delta_size.abs() * fill_price.value();
            Price::new(weighted_sum / new_size_value.abs()).unwrap_or(fill_price)
        }
        _ => fill_price,
    };

    Position {
        size: SignedSize::new(new_size_value),
        entry_price: Some(new_entry),
        updated_at: timestamp,
        ..position.clone()
    }
}

// reduce never crosses zero. returns the new position and realized pnl of the closed slice
pub fn reduce_position(
    position: &Position,
    reduce_amount: Decimal,
    fill_price: Price,
    timestamp: Timestamp,
) -> (Position, Amount) {
    debug_assert!(reduce_amount > Decimal::ZERO, "reduce amount must be positive");

    let position_abs_size = position.size.abs();
    let reduce_amount = reduce_amount.min(position_abs_size);

    let realized = match position.entry_price {
        Some(entry) => {
            let close_size = SignedSize::new(position.size.value().signum() * reduce_amount);
            calculate_realized_pnl(close_size, entry, fill_price)
        }
        None => Amount::zero(),
    };

    let remaining_abs = position_abs_size - reduce_amount;
    let (size, entry_price) = if remaining_abs.is_zero() {
        (SignedSize::zero(), None)
    } else {
        // entry unchanged on reduction
        (
            SignedSize::new(position.size.value().signum() * remaining_abs),
            position.entry_price,
        )
    };

    let next = Position {
        size,
        entry_price,
        realized_pnl: position.realized_pnl.add(realized),
        updated_at: timestamp,
        ..position.clone()
    };
    (next, realized)
}

// close the whole position, then open the remainder the other way at the fill price
pub fn flip_position(
    position: &Position,
    new_side_size: Decimal,
    fill_price: Price,
    timestamp: Timestamp,
) -> (Position, Amount) {
    let (closed, realized) = reduce_position(position, position.size.abs(), fill_price, timestamp);
    let opened = Position {
        size: SignedSize::new(new_side_size),
        entry_price: Some(fill_price),
        ..closed
    };
    (opened, realized)
}

/// How close a symbol is to its inventory limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryLimitStatus {
    Normal,
    NearLimit,
    AtLimit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InventoryUtilization {
    pub ratio: Decimal,
    pub status: InventoryLimitStatus,
}

// 4.5: owns every position. mutated only through preview/commit so a fill can be validated
// against the ledger before anything moves
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: BTreeMap<Symbol, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn size(&self, symbol: &Symbol) -> SignedSize {
        self.positions.get(symbol).map(|p| p.size).unwrap_or_else(SignedSize::zero)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| !p.is_flat())
    }

    pub fn total_unrealized(&self) -> Amount {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Computes what a fill would do without touching the book.
    pub fn preview_fill(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Price,
        timestamp: Timestamp,
    ) -> PositionChange {
        let previous = self
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol.clone(), timestamp));

        let delta = side.sign() * quantity;
        let current = previous.size.value();
        let same_direction = previous.is_flat() || current.signum() == delta.signum();

        let (mut next, realized_pnl) = if same_direction {
            (increase_position(&previous, delta, price, timestamp), Amount::zero())
        } else if quantity <= current.abs() {
            reduce_position(&previous, quantity, price, timestamp)
        } else {
            flip_position(&previous, current + delta, price, timestamp)
        };

        // keep unrealized consistent with the last mark
        next.unrealized_pnl = match next.last_mark {
            Some(mark) => next.unrealized_at(mark),
            None => Amount::zero(),
        };

        PositionChange {
            previous,
            next,
            realized_pnl,
        }
    }

    pub fn commit(&mut self, change: PositionChange) {
        self.positions.insert(change.next.symbol.clone(), change.next);
    }

    // 4.6: weighted-average fill accounting. returns pnl realized by this fill
    pub fn apply_fill(&mut self, symbol: &Symbol, side: Side, quantity: Decimal, price: Price, timestamp: Timestamp) -> Amount {
        let change = self.preview_fill(symbol, side, quantity, price, timestamp);
        let realized = change.realized_pnl;
        self.commit(change);
        realized
    }

    /// Updates unrealized pnl only.
    pub fn mark_to_market(&mut self, symbol: &Symbol, mark: Price, timestamp: Timestamp) -> Amount {
        let position = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(symbol.clone(), timestamp));
        position.last_mark = Some(mark);
        position.unrealized_pnl = position.unrealized_at(mark);
        position.unrealized_pnl
    }

    /// Funding is booked like realized pnl. positive = received.
    pub fn apply_funding(&mut self, symbol: &Symbol, amount: Amount, timestamp: Timestamp) {
        let position = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(symbol.clone(), timestamp));
        position.cumulative_funding = position.cumulative_funding.add(amount);
        position.realized_pnl = position.realized_pnl.add(amount);
        position.updated_at = timestamp;
    }

    /// Expected funding payment over `hours` at `rate`. None when flat or unmarked.
    pub fn estimate_funding(&self, symbol: &Symbol, rate: Decimal, hours: Decimal) -> Option<Amount> {
        let position = self.positions.get(symbol).filter(|p| !p.is_flat())?;
        let mark = position.last_mark.or(position.entry_price)?;
        Some(estimate_funding_payment(position.size, mark, rate, hours))
    }

    pub fn inventory_status(&self, symbol: &Symbol, max_inventory: Decimal) -> InventoryUtilization {
        let ratio = if max_inventory > Decimal::ZERO {
            self.size(symbol).abs() / max_inventory
        } else {
            Decimal::ZERO
        };
        let status = if ratio >= Decimal::ONE {
            InventoryLimitStatus::AtLimit
        } else if ratio >= NEAR_LIMIT_RATIO {
            InventoryLimitStatus::NearLimit
        } else {
            InventoryLimitStatus::Normal
        };
        InventoryUtilization { ratio, status }
    }

    /// Overwrites a position verbatim. Journal replay only.
    pub(crate) fn restore(&mut self, position: Position) {
        self.positions.insert(position.symbol.clone(), position);
    }
}
