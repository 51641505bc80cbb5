//! Avellaneda-Stoikov quoting.
//!
//! Each cycle takes an explicit `MarketSnapshot`, the current position and the rolling
//! variance and produces a two-sided `Quote`:
//!
//! - reservation `r = mid - q * gamma * sigma^2 * tau`, with `q` clamped to `+/-max_inventory`
//! - half-spread `delta = gamma * sigma^2 * tau / 2 + ln(1 + gamma / k) / gamma`, floored at
//!   `min_spread_ticks * tick / 2`
//! - bid `r - delta` rounded down to tick, ask `r + delta` rounded up
//!
//! `sigma^2` is the per-second relative variance scaled by `mid^2` so it is in price units.
//! Sizes shrink on the side that would grow `|q|` and vanish at the limit. Above 80%
//! utilization both sides are scaled down, never below 10% of base size.
//!
//! Quotes are superseded, never merged. Resting orders that drift from the target are
//! cancelled and replaced on a later cycle.

use crate::config::{MarketSpec, QuotingConfig};
use crate::market::{MarketSnapshot, VolatilityEstimator};
use crate::order::{Liquidity, Order, OrderIntent};
use crate::position::NEAR_LIMIT_RATIO;
use crate::types::{floor_to_lot, CorrelationId, Price, Side, Symbol, Timestamp};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

const MIN_NEAR_LIMIT_SCALE: Decimal = dec!(0.1);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuoteLevel {
    pub price: Price,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid: Option<QuoteLevel>,
    pub ask: Option<QuoteLevel>,
    pub reservation_price: Decimal,
    pub half_spread: Decimal,
    /// Relative variance per second the quote was built with.
    pub variance: Decimal,
    pub mid: Price,
    pub generated_at: Timestamp,
    pub valid_until: Timestamp,
}

impl Quote {
    pub fn level(&self, side: Side) -> Option<QuoteLevel> {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.valid_until
    }
}

/// Reservation price and half-spread for one set of inputs.
pub fn reservation_and_spread(
    mid: Decimal,
    variance_rel: Decimal,
    inventory: Decimal,
    gamma: Decimal,
    k: Decimal,
    tau_secs: Decimal,
) -> Option<(Decimal, Decimal)> {
    let sigma_sq = variance_rel * mid * mid;
    let reservation = mid - inventory * gamma * sigma_sq * tau_secs;
    let intensity_term = (Decimal::ONE + gamma / k).checked_ln()? / gamma;
    let half_spread = gamma * sigma_sq * tau_secs / Decimal::TWO + intensity_term;
    Some((reservation, half_spread))
}

/// Bid and ask sizes for a position. Zero means "don't quote that side".
pub fn skewed_sizes(base: Decimal, position: Decimal, max_inventory: Decimal, skew_factor: Decimal) -> (Decimal, Decimal) {
    let ratio = if max_inventory > Decimal::ZERO {
        position.abs() / max_inventory
    } else {
        Decimal::ONE
    };

    // the side that grows |q|
    let reduced = if ratio >= Decimal::ONE {
        Decimal::ZERO
    } else {
        (base * (Decimal::ONE - skew_factor * ratio)).max(Decimal::ZERO)
    };

    let (mut bid, mut ask) = if position > Decimal::ZERO {
        (reduced, base)
    } else if position < Decimal::ZERO {
        (base, reduced)
    } else {
        (base, base)
    };

    if ratio > NEAR_LIMIT_RATIO {
        let scale = (Decimal::ONE - (ratio - NEAR_LIMIT_RATIO) * Decimal::TWO).max(MIN_NEAR_LIMIT_SCALE);
        bid *= scale;
        ask *= scale;
    }
    (bid, ask)
}

/// What a quote cycle wants the coordinator to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotePlan {
    pub cancels: Vec<CorrelationId>,
    pub places: Vec<OrderIntent>,
}

impl QuotePlan {
    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty() && self.places.is_empty()
    }
}

#[derive(Debug)]
struct SymbolState {
    enabled: bool,
    volatility: VolatilityEstimator,
    last_quote: Option<Quote>,
}

#[derive(Debug)]
pub struct QuoteEngine {
    config: QuotingConfig,
    states: HashMap<Symbol, SymbolState>,
}

impl QuoteEngine {
    pub fn new(config: QuotingConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn config(&self) -> &QuotingConfig {
        &self.config
    }

    fn state_mut(&mut self, symbol: &Symbol) -> &mut SymbolState {
        let lookback = self.config.vol_lookback;
        self.states.entry(symbol.clone()).or_insert_with(|| SymbolState {
            enabled: false,
            volatility: VolatilityEstimator::new(lookback),
            last_quote: None,
        })
    }

    pub fn start(&mut self, symbol: &Symbol) {
        self.state_mut(symbol).enabled = true;
    }

    /// Returns whether the symbol was quoting.
    pub fn stop(&mut self, symbol: &Symbol) -> bool {
        let state = self.state_mut(symbol);
        let was = state.enabled;
        state.enabled = false;
        state.last_quote = None;
        was
    }

    pub fn is_enabled(&self, symbol: &Symbol) -> bool {
        self.states.get(symbol).is_some_and(|s| s.enabled)
    }

    pub fn last_quote(&self, symbol: &Symbol) -> Option<&Quote> {
        self.states.get(symbol).and_then(|s| s.last_quote.as_ref())
    }

    pub fn variance(&self, symbol: &Symbol) -> Option<Decimal> {
        self.states.get(symbol).and_then(|s| s.volatility.variance_per_sec())
    }

    /// Feed a mid into the volatility window.
    pub fn observe(&mut self, snapshot: &MarketSnapshot) {
        if let Some(mid) = snapshot.mid {
            self.state_mut(&snapshot.symbol).volatility.record(snapshot.timestamp, mid);
        }
    }

    /// Due on cadence, or early when mid has moved enough ticks since the last quote.
    pub fn needs_refresh(&self, market: &MarketSpec, snapshot: &MarketSnapshot, now: Timestamp) -> bool {
        let Some(state) = self.states.get(&market.symbol).filter(|s| s.enabled) else {
            return false;
        };
        let Some(mid) = snapshot.mid else {
            return false;
        };
        let Some(last) = &state.last_quote else {
            return true;
        };
        if last.is_expired(now) || now.millis_since(last.generated_at) >= self.config.quote_refresh_interval_ms as i64 {
            return true;
        }
        let threshold = market.tick_size * Decimal::from(self.config.refresh_tick_threshold);
        (mid.value() - last.mid.value()).abs() >= threshold
    }

    /// Build a quote. `None` without a mid or when both sides round away.
    pub fn compute(&self, market: &MarketSpec, snapshot: &MarketSnapshot, position: Decimal, now: Timestamp) -> Option<Quote> {
        let mid = snapshot.mid?;
        let cfg = &self.config;
        let variance = self.variance(&market.symbol).unwrap_or(Decimal::ZERO);
        let q = position.max(-cfg.max_inventory).min(cfg.max_inventory);
        let tau = cfg.horizon.tau_secs(now);

        let (reservation, raw_half_spread) =
            reservation_and_spread(mid.value(), variance, q, cfg.risk_aversion, cfg.arrival_intensity, tau)?;
        let min_half_spread = Decimal::from(cfg.min_spread_ticks) * market.tick_size / Decimal::TWO;
        let half_spread = raw_half_spread.max(min_half_spread);

        let (bid_size, ask_size) = skewed_sizes(cfg.base_order_size, position, cfg.max_inventory, cfg.size_skew_factor);

        // never cross the book
        let mut bid_px = Price::floor_to_tick(reservation - half_spread, market.tick_size);
        let mut ask_px = Price::ceil_to_tick(reservation + half_spread, market.tick_size);
        if let (Some(bid), Some(best_ask)) = (bid_px, snapshot.best_ask) {
            if bid >= best_ask {
                bid_px = Price::floor_to_tick(best_ask.value() - market.tick_size, market.tick_size);
            }
        }
        if let (Some(ask), Some(best_bid)) = (ask_px, snapshot.best_bid) {
            if ask <= best_bid {
                ask_px = Price::ceil_to_tick(best_bid.value() + market.tick_size, market.tick_size);
            }
        }

        let level = |price: Option<Price>, size: Decimal| {
            let size = floor_to_lot(size, market.lot_size);
            match price {
                Some(price) if size > Decimal::ZERO && size >= market.min_order_size => Some(QuoteLevel { price, size }),
                _ => None,
            }
        };
        let bid = level(bid_px, bid_size);
        let ask = level(ask_px, ask_size);

        debug!(
            symbol = %market.symbol, %mid, %reservation, %half_spread, %variance, position = %position,
            "quote computed"
        );

        Some(Quote {
            symbol: market.symbol.clone(),
            bid,
            ask,
            reservation_price: reservation,
            half_spread,
            variance,
            mid,
            generated_at: now,
            valid_until: now.plus_millis(cfg.quote_validity_ms as i64),
        })
    }

    pub fn record_quote(&mut self, quote: Quote) {
        let symbol = quote.symbol.clone();
        self.state_mut(&symbol).last_quote = Some(quote);
    }

    /// Diff a target quote against what is resting. Pure.
    ///
    /// A side with a cancel in flight is left alone. Orders that drifted past tolerance
    /// (or whose side is no longer quoted) are cancelled; the replacement is placed once the
    /// side is clear.
    pub fn plan(
        &self,
        market: &MarketSpec,
        quote: &Quote,
        resting: &[&Order],
        cancels_in_flight: &[Side],
    ) -> QuotePlan {
        let mut plan = QuotePlan::default();
        let tolerance = market.tick_size * Decimal::from(self.config.drift_tolerance_ticks);

        for side in [Side::Buy, Side::Sell] {
            if cancels_in_flight.contains(&side) {
                continue;
            }
            let on_side: Vec<&Order> = resting.iter().copied().filter(|o| o.side == side).collect();
            let target = quote.level(side);

            let mut keep = None;
            for order in &on_side {
                let within = match (target, order.price) {
                    (Some(t), Some(p)) => keep.is_none() && (p.value() - t.price.value()).abs() <= tolerance,
                    _ => false,
                };
                if within {
                    keep = Some(order.correlation_id);
                } else {
                    plan.cancels.push(order.correlation_id);
                }
            }

            let stale = on_side.len() - usize::from(keep.is_some());
            if let (Some(target), None, 0) = (target, keep, stale) {
                plan.places.push(OrderIntent::limit(
                    market.symbol.clone(),
                    side,
                    target.size,
                    target.price,
                    Liquidity::Maker,
                ));
            }
        }
        plan
    }
}
