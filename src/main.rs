//! Market-making engine simulation.
//!
//! Runs the full engine against the simulated exchange: quotes a BTC perpetual through a
//! scripted price walk, lets trades print through the quotes, settles funding, sends one
//! taker order and prints where everything ended up.
//!
//! Pass a JSON config path as the first argument to run with it instead of the built-in
//! simulation preset. The script expects a BTC-PERP market settled in USDC.

use perps_mm::logging::{self, LogFormat};
use perps_mm::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

const STEPS: i64 = 120;
const STEP_MS: i64 = 250;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    logging::init("info,perps_mm=info", LogFormat::Compact);

    println!("Perpetual Market-Making Engine Simulation");
    println!("BTC-PERP, Avellaneda-Stoikov quotes, simulated exchange\n");

    // optional JSON config path; the built-in simulation preset otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::simulation(),
    };
    let symbol = Symbol::new("BTC-PERP");
    let usdc = Token::new("USDC");

    let exchange = Arc::new(SimulatedExchange::new(config.markets.clone()));
    exchange.deposit(&usdc, Amount::new(dec!(100_000))).await;

    let coordinator = ExecutionCoordinator::new(config)?;
    let (handle, task) = EngineRuntime::start(coordinator, exchange.clone()).await?;
    println!("  Deposited 100,000 USDC, engine bootstrapped\n");

    // scripted walk: deterministic pseudo-random ticks around 50,000
    let mut mid = dec!(50_000);
    let mut seed: u64 = 7;
    for step in 0..STEPS {
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        let ticks = ((seed >> 33) % 21) as i64 - 10;
        mid += Decimal::from(ticks) * dec!(0.5);

        let now = Timestamp::from_millis(step * STEP_MS);
        let snapshot = MarketSnapshot::new(
            symbol.clone(),
            Price::new(mid - dec!(0.5)),
            Price::new(mid + dec!(0.5)),
            now,
        );
        exchange.set_book(snapshot.clone()).await;
        handle.push_market(snapshot).await?;

        // every tenth step a trade prints through one side of the quotes
        if step % 10 == 5 {
            let through = if (seed >> 40) % 2 == 0 { mid - dec!(25) } else { mid + dec!(25) };
            if let Some(price) = Price::new(through) {
                let filled = exchange.trade_through(&symbol, price, dec!(0.05)).await;
                if filled > Decimal::ZERO {
                    println!("  step {step:>3}: trade at {price} filled {filled} of our quotes");
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    if let Some(paid) = exchange.apply_funding(&symbol, dec!(0.0001)).await {
        println!("\n  Funding settled at 0.01%: {paid} USDC");
    }

    let taker = OrderIntent::market(symbol.clone(), Side::Buy, dec!(0.01));
    match handle.submit(taker).await {
        Ok(id) => println!("  Taker buy 0.01 BTC accepted as order {id}"),
        Err(e) => println!("  Taker buy refused: {e}"),
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let summary = handle.summary().await?;
    println!("\nSummary");
    println!("  Equity: {} USDC", summary.equity);
    for (token, balance) in &summary.balances {
        println!("  {token}: free {} locked {}", balance.free, balance.locked);
    }
    for position in &summary.positions {
        println!(
            "  {}: size {} entry {:?} realized {} unrealized {} funding {}",
            position.symbol,
            position.size,
            position.entry_price.map(|p| p.value()),
            position.realized_pnl,
            position.unrealized_pnl,
            position.cumulative_funding,
        );
    }
    println!("  Live orders: {}", summary.live_orders.len());
    println!("  Breaker: {:?}", summary.breaker);
    println!("  Exchange position: {} BTC", exchange.position(&symbol).await);

    let stats = exchange.stats().await;
    println!(
        "  Exchange stats: {} placed, {} cancelled, {} rejected, {} fills",
        stats.orders_placed, stats.orders_cancelled, stats.orders_rejected, stats.fills
    );

    handle.shutdown().await?;
    let coordinator = task.await.map_err(|_| EngineError::Stopped)?;
    println!("\n  Shutdown complete, {} orders still live", coordinator.registry().live_count());
    Ok(())
}
