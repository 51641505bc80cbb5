//! Pre-trade risk checks and the drawdown circuit breaker.
//!
//! `RiskGate::evaluate` is a pure function of the intent, a `RiskSnapshot` and the gate's own
//! state: it never mutates anything, so asking twice gives the same answer. The only inputs that
//! change gate state are equity marks (which may trip the breaker), manual resets and halts.

use crate::config::{MarketSpec, RiskConfig};
use crate::drawdown::EquityCurve;
use crate::market::MarketSnapshot;
use crate::order::{OrderIntent, OrderKind};
use crate::types::{Amount, Price, Side, Symbol, Timestamp, Token};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Which limit a position check ran into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitScope {
    /// Per base token, in base units.
    Token(Token),
    /// Gross notional across every symbol, in the reference token.
    GlobalNotional,
}

/// Why an intent never reached the exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RiskRejection {
    #[error("Position limit exceeded on {symbol} ({scope:?}): projected {projected}, limit {limit}")]
    PositionLimitExceeded {
        symbol: Symbol,
        scope: LimitScope,
        projected: Decimal,
        limit: Decimal,
    },

    #[error("Slippage exceeded on {symbol}: {deviation} vs max {limit}")]
    SlippageExceeded {
        symbol: Symbol,
        estimated: Price,
        deviation: Decimal,
        limit: Decimal,
    },

    #[error("No reference mid for taker intent on {0}")]
    NoReferencePrice(Symbol),

    #[error("Circuit breaker tripped")]
    CircuitBreakerTripped,

    #[error("Trading halted for {0}")]
    Halted(String),

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),
}

/// Everything outside the gate that a decision depends on, captured at one instant.
#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    /// Net signed position across every symbol sharing the intent's base token.
    pub token_position: Decimal,
    /// Unfilled quantity already resting on the intent's side.
    pub resting_same_side: Decimal,
    /// Current gross notional across all symbols.
    pub gross_notional: Decimal,
    pub market: Option<MarketSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BreakerState {
    Armed,
    Tripped {
        at: Timestamp,
        equity: Amount,
        high_water_mark: Amount,
        drawdown: Decimal,
    },
}

/// Returned by `on_equity` the moment the breaker trips.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerTrip {
    pub equity: Amount,
    pub high_water_mark: Amount,
    pub drawdown: Decimal,
    pub flatten: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub token: Token,
    pub symbols: Vec<Symbol>,
    pub reason: String,
}

#[derive(Debug)]
pub struct RiskGate {
    config: RiskConfig,
    breaker: BreakerState,
    curve: EquityCurve,
    halted_tokens: BTreeSet<Token>,
    halted_symbols: BTreeSet<Symbol>,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        let curve = EquityCurve::new(config.hwm_window_ms);
        Self {
            config,
            breaker: BreakerState::Armed,
            curve,
            halted_tokens: BTreeSet::new(),
            halted_symbols: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn breaker(&self) -> &BreakerState {
        &self.breaker
    }

    pub fn is_tripped(&self) -> bool {
        matches!(self.breaker, BreakerState::Tripped { .. })
    }

    pub fn equity_curve(&self) -> &EquityCurve {
        &self.curve
    }

    pub fn is_halted(&self, market: &MarketSpec) -> bool {
        self.halted_symbols.contains(&market.symbol)
            || self.halted_tokens.contains(&market.base_token)
            || self.halted_tokens.contains(&market.settlement_token)
    }

    /// Accept or reject an intent. Pure.
    pub fn evaluate(&self, intent: &OrderIntent, market: &MarketSpec, snapshot: &RiskSnapshot) -> Result<(), RiskRejection> {
        if self.is_halted(market) {
            return Err(RiskRejection::Halted(market.symbol.to_string()));
        }
        if self.is_tripped() {
            return Err(RiskRejection::CircuitBreakerTripped);
        }
        check_shape(intent, market)?;

        let mid = snapshot.market.as_ref().and_then(|m| m.mid);
        if !intent.reduce_only {
            self.check_position(intent, market, snapshot, mid)?;
        }
        if intent.kind.is_taker() {
            self.check_slippage(intent, snapshot, mid)?;
        }
        Ok(())
    }

    fn check_position(
        &self,
        intent: &OrderIntent,
        market: &MarketSpec,
        snapshot: &RiskSnapshot,
        mid: Option<Price>,
    ) -> Result<(), RiskRejection> {
        let limit = self
            .config
            .per_token_position_limit
            .get(&market.base_token)
            .copied()
            .unwrap_or(Decimal::ZERO);

        let added = snapshot.resting_same_side + intent.quantity;
        let projected = snapshot.token_position + intent.side.sign() * added;
        let increases = projected.abs() > snapshot.token_position.abs();

        // a reducing intent is always allowed through, even past a lowered limit
        if increases && projected.abs() > limit {
            return Err(RiskRejection::PositionLimitExceeded {
                symbol: intent.symbol.clone(),
                scope: LimitScope::Token(market.base_token.clone()),
                projected,
                limit,
            });
        }

        if increases {
            let price = intent.price.or(mid);
            if let Some(price) = price {
                let projected_gross = snapshot.gross_notional + added * price.value();
                if projected_gross > self.config.global_position_limit {
                    return Err(RiskRejection::PositionLimitExceeded {
                        symbol: intent.symbol.clone(),
                        scope: LimitScope::GlobalNotional,
                        projected: projected_gross,
                        limit: self.config.global_position_limit,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_slippage(&self, intent: &OrderIntent, snapshot: &RiskSnapshot, mid: Option<Price>) -> Result<(), RiskRejection> {
        let Some(mid) = mid else {
            return Err(RiskRejection::NoReferencePrice(intent.symbol.clone()));
        };
        let estimated = estimated_execution_price(intent, snapshot.market.as_ref()).unwrap_or(mid);
        let deviation = ((estimated.value() - mid.value()) / mid.value()).abs();
        if deviation > self.config.max_slippage_pct {
            return Err(RiskRejection::SlippageExceeded {
                symbol: intent.symbol.clone(),
                estimated,
                deviation,
                limit: self.config.max_slippage_pct,
            });
        }
        Ok(())
    }

    /// Feed a fresh equity mark. Returns the trip the moment the breaker fires.
    pub fn on_equity(&mut self, equity: Amount, now: Timestamp) -> Option<BreakerTrip> {
        let drawdown = self.curve.record(equity, now);
        if self.is_tripped() || drawdown <= self.config.max_drawdown_pct {
            return None;
        }

        let high_water_mark = self.curve.high_water_mark().unwrap_or(equity);
        error!(%equity, %high_water_mark, %drawdown, "drawdown breaker tripped");
        self.breaker = BreakerState::Tripped {
            at: now,
            equity,
            high_water_mark,
            drawdown,
        };
        Some(BreakerTrip {
            equity,
            high_water_mark,
            drawdown,
            flatten: self.config.flatten_on_trip,
        })
    }

    /// Deposits and withdrawals move equity without being drawdown.
    pub fn on_transfer(&mut self, delta: Amount) {
        self.curve.shift(delta);
    }

    /// Manual re-arm. The high-water mark restarts at current equity.
    pub fn reset(&mut self, equity: Amount, now: Timestamp) -> bool {
        let was_tripped = self.is_tripped();
        self.breaker = BreakerState::Armed;
        self.curve.rebase(equity, now);
        if was_tripped {
            info!(%equity, "breaker reset");
        }
        was_tripped
    }

    pub fn halt(&mut self, halt: &Halt) {
        warn!(token = %halt.token, symbols = ?halt.symbols, reason = %halt.reason, "halting");
        self.halted_tokens.insert(halt.token.clone());
        self.halted_symbols.extend(halt.symbols.iter().cloned());
    }

    /// Clears a token halt and the symbols it took down with it.
    pub fn clear_halt(&mut self, token: &Token, symbols: &[Symbol]) -> bool {
        let cleared = self.halted_tokens.remove(token);
        for symbol in symbols {
            self.halted_symbols.remove(symbol);
        }
        cleared
    }

    pub fn halted_tokens(&self) -> impl Iterator<Item = &Token> {
        self.halted_tokens.iter()
    }
}

/// Limit price if any, else the best opposite quote, else nothing (caller falls back to mid).
pub fn estimated_execution_price(intent: &OrderIntent, market: Option<&MarketSnapshot>) -> Option<Price> {
    intent
        .price
        .or_else(|| market.and_then(|m| m.best_opposite(intent.side)))
}

// structural checks that don't depend on market state
fn check_shape(intent: &OrderIntent, market: &MarketSpec) -> Result<(), RiskRejection> {
    if intent.symbol != market.symbol {
        return Err(RiskRejection::InvalidIntent(format!(
            "intent for {} evaluated against {}",
            intent.symbol, market.symbol
        )));
    }
    if intent.quantity <= Decimal::ZERO {
        return Err(RiskRejection::InvalidIntent("quantity must be positive".to_string()));
    }
    if intent.quantity < market.min_order_size {
        return Err(RiskRejection::InvalidIntent(format!(
            "quantity {} below minimum {}",
            intent.quantity, market.min_order_size
        )));
    }
    match (intent.kind, intent.price) {
        (OrderKind::Market, Some(_)) => Err(RiskRejection::InvalidIntent("market order with a price".to_string())),
        (OrderKind::Limit(_), None) => Err(RiskRejection::InvalidIntent("limit order without a price".to_string())),
        _ => Ok(()),
    }
}

/// Side a flattening order must take to close `position`.
pub fn flatten_side(position: Decimal) -> Option<Side> {
    if position > Decimal::ZERO {
        Some(Side::Sell)
    } else if position < Decimal::ZERO {
        Some(Side::Buy)
    } else {
        None
    }
}
