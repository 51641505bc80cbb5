// 7.0 config.rs: all settings in one place. markets, risk limits, quoting, timing.
// 7.1 risk thresholds and tolerances have no defaults: a config that omits them does not load.
// timing knobs under execution/reconciliation default sensibly.

use crate::types::{Bps, Symbol, Timestamp, Token};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // the single settlement currency every market quotes in (e.g. "USDC")
    pub reference_token: Token,
    pub markets: Vec<MarketSpec>,
    pub risk: RiskConfig,
    pub quoting: QuotingConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

// one perp market
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSpec {
    pub symbol: Symbol,
    // what the position is denominated in (e.g. "BTC")
    pub base_token: Token,
    // what margin and pnl settle in. must equal the reference token
    pub settlement_token: Token,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_order_size: Decimal,
    // fraction of notional locked per order. 1 = fully funded
    #[serde(default = "one")]
    pub initial_margin_fraction: Decimal,
    #[serde(default)]
    pub taker_fee_bps: i32,
    // negative = rebate
    #[serde(default)]
    pub maker_fee_bps: i32,
    #[serde(default = "yes")]
    pub quoting_enabled: bool,
}

impl MarketSpec {
    pub fn taker_fee(&self) -> Bps {
        Bps::new(self.taker_fee_bps)
    }

    pub fn maker_fee(&self) -> Bps {
        Bps::new(self.maker_fee_bps)
    }
}

/** 7.2: risk limits. fractions, not percent: 0.20 = 20% */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    // max |position| per base token, in base units
    pub per_token_position_limit: BTreeMap<Token, Decimal>,
    // max gross notional across all symbols, in the reference token
    pub global_position_limit: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_slippage_pct: Decimal,
    // allowed |local total - exchange total| before reconciliation flags a divergence
    pub inventory_tolerance: Decimal,
    // None = high-water mark since the last breaker reset
    #[serde(default)]
    pub hwm_window_ms: Option<u64>,
    #[serde(default)]
    pub flatten_on_trip: bool,
}

// time horizon used by the quote model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    // infinite-horizon style: fixed tau in seconds
    Stationary { tau_secs: Decimal },
    // tau shrinks to zero at session end
    Session { end: Timestamp },
}

impl Horizon {
    pub fn tau_secs(&self, now: Timestamp) -> Decimal {
        match self {
            Horizon::Stationary { tau_secs } => *tau_secs,
            // nothing left to hold once the session is over
            Horizon::Session { end } => Decimal::new(end.millis_since(now), 3).max(Decimal::ZERO),
        }
    }
}

/** 7.3: quote model parameters */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotingConfig {
    // gamma
    pub risk_aversion: Decimal,
    // k, order arrival intensity
    pub arrival_intensity: Decimal,
    // mid samples in the volatility window
    pub vol_lookback: usize,
    pub horizon: Horizon,
    pub base_order_size: Decimal,
    // |q| at which the quote stops adding exposure
    pub max_inventory: Decimal,
    pub quote_refresh_interval_ms: u64,
    pub min_spread_ticks: u32,
    #[serde(default = "one")]
    pub size_skew_factor: Decimal,
    // mid move (in ticks) that forces an early refresh
    #[serde(default = "default_refresh_ticks")]
    pub refresh_tick_threshold: u32,
    // resting quotes further than this from target get replaced
    #[serde(default = "default_drift_ticks")]
    pub drift_tolerance_ticks: u32,
    #[serde(default = "default_quote_validity_ms")]
    pub quote_validity_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub balance_recon_interval_ms: u64,
    // consecutive snapshots a divergence must survive before it is corrected
    pub confirm_after: u32,
    // orders younger than this are not judged against a snapshot
    pub order_grace_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            balance_recon_interval_ms: 30_000,
            confirm_after: 2,
            order_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub request_timeout_ms: u64,
    pub max_place_attempts: u32,
    pub read_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_reorder_wait_ms: u64,
    pub max_buffered_events: usize,
    pub input_channel_capacity: usize,
    // housekeeping timer: sequencer expiry, quote cadence checks
    pub timer_interval_ms: u64,
    pub max_events: usize,
    pub max_archived_orders: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_place_attempts: 3,
            read_retry_attempts: 3,
            retry_base_delay_ms: 100,
            max_reorder_wait_ms: 2_000,
            max_buffered_events: 256,
            input_channel_capacity: 1_024,
            timer_interval_ms: 250,
            max_events: 10_000,
            max_archived_orders: 10_000,
        }
    }
}

fn one() -> Decimal {
    Decimal::ONE
}

fn yes() -> bool {
    true
}

fn default_refresh_ticks() -> u32 {
    2
}

fn default_drift_ticks() -> u32 {
    1
}

fn default_quote_validity_ms() -> u64 {
    5_000
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Config read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid market {symbol}: {reason}")]
    InvalidMarket { symbol: Symbol, reason: String },

    #[error("Invalid risk config: {reason}")]
    InvalidRisk { reason: String },

    #[error("Invalid quoting config: {reason}")]
    InvalidQuoting { reason: String },

    #[error("Invalid execution config: {reason}")]
    InvalidExecution { reason: String },
}

fn market_err(symbol: &Symbol, reason: &str) -> ConfigError {
    ConfigError::InvalidMarket {
        symbol: symbol.clone(),
        reason: reason.to_string(),
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn market(&self, symbol: &Symbol) -> Option<&MarketSpec> {
        self.markets.iter().find(|m| &m.symbol == symbol)
    }

    pub fn position_limit(&self, base_token: &Token) -> Option<Decimal> {
        self.risk.per_token_position_limit.get(base_token).copied()
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for market in &self.markets {
            let symbol = &market.symbol;
            if !seen.insert(symbol.clone()) {
                return Err(market_err(symbol, "listed twice"));
            }
            if market.settlement_token != self.reference_token {
                return Err(market_err(symbol, "settlement token must be the reference token"));
            }
            if market.tick_size <= Decimal::ZERO || market.lot_size <= Decimal::ZERO {
                return Err(market_err(symbol, "tick and lot size must be positive"));
            }
            if market.min_order_size < Decimal::ZERO {
                return Err(market_err(symbol, "min order size cannot be negative"));
            }
            if market.initial_margin_fraction <= Decimal::ZERO {
                return Err(market_err(symbol, "initial margin fraction must be positive"));
            }
            if market.taker_fee_bps > 100 || market.maker_fee_bps > 100 {
                return Err(market_err(symbol, "fee too high (>1%)"));
            }
            if self.position_limit(&market.base_token).is_none() {
                return Err(market_err(symbol, "no position limit for base token"));
            }
        }

        let risk = &self.risk;
        if risk.max_drawdown_pct <= Decimal::ZERO || risk.max_drawdown_pct >= Decimal::ONE {
            return Err(ConfigError::InvalidRisk {
                reason: "max_drawdown_pct must be between 0 and 1".to_string(),
            });
        }
        if risk.max_slippage_pct < Decimal::ZERO || risk.max_slippage_pct >= Decimal::ONE {
            return Err(ConfigError::InvalidRisk {
                reason: "max_slippage_pct must be in [0, 1)".to_string(),
            });
        }
        if risk.inventory_tolerance < Decimal::ZERO || risk.global_position_limit <= Decimal::ZERO {
            return Err(ConfigError::InvalidRisk {
                reason: "tolerance cannot be negative and the global limit must be positive".to_string(),
            });
        }
        if risk.per_token_position_limit.values().any(|l| *l < Decimal::ZERO) {
            return Err(ConfigError::InvalidRisk {
                reason: "position limits cannot be negative".to_string(),
            });
        }

        let q = &self.quoting;
        if q.risk_aversion <= Decimal::ZERO || q.arrival_intensity <= Decimal::ZERO {
            return Err(ConfigError::InvalidQuoting {
                reason: "risk aversion and arrival intensity must be positive".to_string(),
            });
        }
        if q.vol_lookback < 2 {
            return Err(ConfigError::InvalidQuoting {
                reason: "vol_lookback needs at least 2 samples".to_string(),
            });
        }
        if q.base_order_size <= Decimal::ZERO || q.max_inventory <= Decimal::ZERO {
            return Err(ConfigError::InvalidQuoting {
                reason: "base order size and max inventory must be positive".to_string(),
            });
        }
        if let Horizon::Stationary { tau_secs } = q.horizon {
            if tau_secs <= Decimal::ZERO {
                return Err(ConfigError::InvalidQuoting {
                    reason: "stationary horizon needs a positive tau".to_string(),
                });
            }
        }

        let exec = &self.execution;
        if exec.input_channel_capacity == 0 || exec.max_buffered_events == 0 || exec.max_place_attempts == 0 {
            return Err(ConfigError::InvalidExecution {
                reason: "capacities and attempts must be at least 1".to_string(),
            });
        }
        if self.reconciliation.confirm_after == 0 {
            return Err(ConfigError::InvalidExecution {
                reason: "confirm_after must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    // preset used by the simulator binary and the integration tests.
    // one BTC market settled in USDC, 20% drawdown breaker
    pub fn simulation() -> Self {
        let usdc = Token::new("USDC");
        let btc = Token::new("BTC");
        Self {
            reference_token: usdc.clone(),
            markets: vec![MarketSpec {
                symbol: Symbol::new("BTC-PERP"),
                base_token: btc.clone(),
                settlement_token: usdc,
                tick_size: dec!(0.5),
                lot_size: dec!(0.001),
                min_order_size: dec!(0.001),
                initial_margin_fraction: Decimal::ONE,
                taker_fee_bps: 5,
                maker_fee_bps: 2,
                quoting_enabled: true,
            }],
            risk: RiskConfig {
                per_token_position_limit: BTreeMap::from([(btc, dec!(5))]),
                global_position_limit: dec!(1_000_000),
                max_drawdown_pct: dec!(0.20),
                max_slippage_pct: dec!(0.01),
                inventory_tolerance: dec!(0.01),
                hwm_window_ms: None,
                flatten_on_trip: false,
            },
            quoting: QuotingConfig {
                risk_aversion: dec!(0.1),
                arrival_intensity: dec!(1.5),
                vol_lookback: 20,
                horizon: Horizon::Stationary { tau_secs: dec!(60) },
                base_order_size: dec!(0.1),
                max_inventory: dec!(1),
                quote_refresh_interval_ms: 1_000,
                min_spread_ticks: 2,
                size_skew_factor: Decimal::ONE,
                refresh_tick_threshold: 2,
                drift_tolerance_ticks: 1,
                quote_validity_ms: 5_000,
            },
            reconciliation: ReconciliationConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}
