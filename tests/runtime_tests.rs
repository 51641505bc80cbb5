//! Runtime tests: the tokio loop driving the coordinator against the simulated exchange.

use perps_mm::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn btc() -> Symbol {
    Symbol::new("BTC-PERP")
}

fn usdc() -> Token {
    Token::new("USDC")
}

fn px(value: Decimal) -> Price {
    Price::new_unchecked(value)
}

fn book() -> MarketSnapshot {
    MarketSnapshot::new(btc(), Some(px(dec!(49_999.5))), Some(px(dec!(50_000.5))), Timestamp::now())
}

async fn start() -> (Arc<SimulatedExchange>, EngineHandle, JoinHandle<ExecutionCoordinator>) {
    let mut config = EngineConfig::simulation();
    config.markets[0].quoting_enabled = false;

    let sim = Arc::new(SimulatedExchange::new(config.markets.clone()));
    sim.deposit(&usdc(), Amount::new(dec!(100_000))).await;
    sim.set_book(book()).await;

    let coordinator = ExecutionCoordinator::new(config).unwrap();
    let (handle, task) = EngineRuntime::start(coordinator, sim.clone()).await.unwrap();
    handle.push_market(book()).await.unwrap();
    (sim, handle, task)
}

/// Poll the summary until `check` passes or two seconds go by.
async fn wait_for(handle: &EngineHandle, check: impl Fn(&EngineSummary) -> bool) -> EngineSummary {
    for _ in 0..200 {
        let summary = handle.summary().await.unwrap();
        if check(&summary) {
            return summary;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {:?}", handle.summary().await.unwrap());
}

fn locked(summary: &EngineSummary) -> Amount {
    summary
        .balances
        .iter()
        .find(|(token, _)| *token == usdc())
        .map(|(_, b)| b.locked)
        .unwrap_or_default()
}

fn resting_bid() -> OrderIntent {
    OrderIntent::limit(btc(), Side::Buy, dec!(0.1), px(dec!(49_000)), Liquidity::Maker)
}

#[tokio::test]
async fn bootstrap_seeds_balances_from_exchange() {
    let (_sim, handle, _task) = start().await;
    let summary = handle.summary().await.unwrap();
    assert_eq!(summary.equity.value(), dec!(100_000));
    assert!(summary.live_orders.is_empty());
}

#[tokio::test]
async fn submitted_order_is_acknowledged() {
    let (sim, handle, _task) = start().await;
    let id = handle.submit(resting_bid()).await.unwrap();

    let summary = wait_for(&handle, |s| {
        s.live_orders
            .iter()
            .any(|o| o.correlation_id == id && o.status == OrderStatus::Open)
    })
    .await;
    let order = summary.live_orders.iter().find(|o| o.correlation_id == id).unwrap();
    assert_eq!(order.exchange_order_id, sim.exchange_id_for(id).await);
    assert_eq!(locked(&summary).value(), dec!(4_900));
    assert_eq!(sim.stats().await.orders_placed, 1);
}

#[tokio::test]
async fn lost_place_response_binds_without_resending() {
    let (sim, handle, _task) = start().await;
    sim.inject_fault(SimFault::TimeoutAfterAccept).await;

    let id = handle.submit(resting_bid()).await.unwrap();
    let summary = wait_for(&handle, |s| {
        s.live_orders
            .iter()
            .any(|o| o.correlation_id == id && o.exchange_order_id.is_some())
    })
    .await;

    assert_eq!(summary.live_orders.len(), 1);
    assert_eq!(sim.stats().await.orders_placed, 1);
    assert_eq!(sim.query_open_orders().await.unwrap().len(), 1);
}

#[tokio::test]
async fn exchange_rejection_frees_inventory() {
    let (sim, handle, _task) = start().await;
    sim.inject_fault(SimFault::RejectPlace("margin".into())).await;

    handle.submit(resting_bid()).await.unwrap();
    let summary = wait_for(&handle, |s| s.live_orders.is_empty()).await;
    assert!(locked(&summary).is_zero());
}

#[tokio::test]
async fn risk_rejection_is_returned_to_caller() {
    let (sim, handle, _task) = start().await;
    let too_big = OrderIntent::limit(btc(), Side::Buy, dec!(6), px(dec!(49_000)), Liquidity::Maker);

    let err = handle.submit(too_big).await.unwrap_err();
    assert!(matches!(err, EngineError::Risk(RiskRejection::PositionLimitExceeded { .. })));
    assert_eq!(sim.stats().await.orders_placed, 0);
}

#[tokio::test]
async fn taker_fill_moves_position() {
    let (sim, handle, _task) = start().await;
    handle.submit(OrderIntent::market(btc(), Side::Buy, dec!(0.01))).await.unwrap();

    let summary = wait_for(&handle, |s| {
        s.positions
            .iter()
            .any(|p| p.symbol == btc() && p.size.value() == dec!(0.01))
    })
    .await;
    assert_eq!(sim.position(&btc()).await, dec!(0.01));
    assert!(summary.live_orders.is_empty());
}

#[tokio::test]
async fn cancel_round_trip() {
    let (sim, handle, _task) = start().await;
    let id = handle.submit(resting_bid()).await.unwrap();
    wait_for(&handle, |s| s.live_orders.iter().any(|o| o.status == OrderStatus::Open)).await;

    handle.cancel(id).await.unwrap();
    let summary = wait_for(&handle, |s| s.live_orders.is_empty()).await;
    assert!(locked(&summary).is_zero());
    assert!(sim.query_open_orders().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_cancels_and_returns_coordinator() {
    let (sim, handle, task) = start().await;
    let id = handle.submit(resting_bid()).await.unwrap();
    wait_for(&handle, |s| s.live_orders.iter().any(|o| o.status == OrderStatus::Open)).await;

    handle.shutdown().await.unwrap();
    let coordinator = task.await.unwrap();

    assert!(sim.query_open_orders().await.unwrap().is_empty());
    assert!(coordinator.order(id).is_some());
    assert!(matches!(handle.summary().await, Err(EngineError::Stopped)));
}
