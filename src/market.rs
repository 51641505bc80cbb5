//! Market data state.
//!
//! `MarketSnapshot` is the explicit per-cycle view of a book that quoting and risk read.
//! `VolatilityEstimator` keeps a rolling window of mids and turns it into a per-second
//! realized variance of log returns.

use crate::types::{Price, Side, Symbol, Timestamp};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Top of book at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    /// Reference mid. Falls back to the bid/ask midpoint when not supplied.
    pub mid: Option<Price>,
    pub timestamp: Timestamp,
}

impl MarketSnapshot {
    pub fn new(symbol: Symbol, best_bid: Option<Price>, best_ask: Option<Price>, timestamp: Timestamp) -> Self {
        let mid = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Price::new((bid.value() + ask.value()) / Decimal::TWO),
            _ => None,
        };
        Self {
            symbol,
            best_bid,
            best_ask,
            mid,
            timestamp,
        }
    }

    pub fn with_mid(mut self, mid: Price) -> Self {
        self.mid = Some(mid);
        self
    }

    /// Best price a taker on `side` would hit first: the ask for buys, the bid for sells.
    pub fn best_opposite(&self, side: Side) -> Option<Price> {
        match side {
            Side::Buy => self.best_ask,
            Side::Sell => self.best_bid,
        }
    }
}

/// Rolling realized variance of log returns, per second.
///
/// Variance is `sum(r^2) / sum(dt)` over the last `lookback` mids, which keeps irregular
/// sampling honest. Returns `None` until two usable samples exist.
#[derive(Debug, Clone)]
pub struct VolatilityEstimator {
    lookback: usize,
    samples: VecDeque<(Timestamp, Price)>,
}

impl VolatilityEstimator {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(2),
            samples: VecDeque::with_capacity(lookback.max(2)),
        }
    }

    pub fn record(&mut self, timestamp: Timestamp, mid: Price) {
        // out-of-order or same-instant mids carry no time information
        if let Some((last_ts, _)) = self.samples.back() {
            if timestamp <= *last_ts {
                return;
            }
        }
        self.samples.push_back((timestamp, mid));
        while self.samples.len() > self.lookback {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn variance_per_sec(&self) -> Option<Decimal> {
        if self.samples.len() < 2 {
            return None;
        }
        let mut sum_sq = Decimal::ZERO;
        let mut sum_dt = Decimal::ZERO;
        for (prev, next) in self.samples.iter().zip(self.samples.iter().skip(1)) {
            let ratio = next.1.value() / prev.1.value();
            let r = ratio.checked_ln()?;
            sum_sq += r * r;
            sum_dt += prev.0.elapsed_secs(&next.0);
        }
        if sum_dt.is_zero() {
            return None;
        }
        Some(sum_sq / sum_dt)
    }
}
