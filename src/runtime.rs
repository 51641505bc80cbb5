//! Async shell around the coordinator.
//!
//! One task owns the `ExecutionCoordinator` and applies inputs in arrival order from a
//! bounded channel. Everything else is a producer: the exchange event forwarder, callers
//! holding an `EngineHandle`, and the spawned tasks that run exchange commands and send
//! their outcomes back in. Exchange calls run under a deadline. Reads retry with
//! exponential backoff; a timed-out place is re-queried by client id before it is ever
//! sent again.

use crate::config::ExecutionConfig;
use crate::engine::{CommandOutcome, EngineError, EngineSummary, ExchangeCommand, ExecutionCoordinator};
use crate::events::{ExchangeEvent, TransferSettled};
use crate::exchange::{ExchangeClient, ExchangeError, ExchangeSnapshot, PlaceAck, PlaceOrderRequest};
use crate::market::MarketSnapshot;
use crate::order::OrderIntent;
use crate::types::{CorrelationId, Symbol, Timestamp};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Everything the engine task consumes.
#[derive(Debug)]
pub enum EngineInput {
    Submit {
        intent: OrderIntent,
        reply: oneshot::Sender<Result<CorrelationId, EngineError>>,
    },
    Cancel {
        correlation_id: CorrelationId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Market(MarketSnapshot),
    Exchange(ExchangeEvent),
    Transfer(TransferSettled),
    Outcome(CommandOutcome),
    Snapshot(ExchangeSnapshot),
    ResyncFailed(ExchangeError),
    ResetBreaker {
        reply: oneshot::Sender<bool>,
    },
    StartQuoting(Symbol),
    StopQuoting(Symbol),
    Summary {
        reply: oneshot::Sender<EngineSummary>,
    },
    Shutdown,
}

/// Cheap, cloneable sender side of the engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineInput>,
}

impl EngineHandle {
    async fn send(&self, input: EngineInput) -> Result<(), EngineError> {
        self.tx.send(input).await.map_err(|_| EngineError::Stopped)
    }

    pub async fn submit(&self, intent: OrderIntent) -> Result<CorrelationId, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Submit { intent, reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub async fn cancel(&self, correlation_id: CorrelationId) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Cancel { correlation_id, reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub async fn push_market(&self, snapshot: MarketSnapshot) -> Result<(), EngineError> {
        self.send(EngineInput::Market(snapshot)).await
    }

    pub async fn push_exchange_event(&self, event: ExchangeEvent) -> Result<(), EngineError> {
        self.send(EngineInput::Exchange(event)).await
    }

    pub async fn push_transfer(&self, transfer: TransferSettled) -> Result<(), EngineError> {
        self.send(EngineInput::Transfer(transfer)).await
    }

    pub async fn reset_breaker(&self) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::ResetBreaker { reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn start_quoting(&self, symbol: Symbol) -> Result<(), EngineError> {
        self.send(EngineInput::StartQuoting(symbol)).await
    }

    pub async fn stop_quoting(&self, symbol: Symbol) -> Result<(), EngineError> {
        self.send(EngineInput::StopQuoting(symbol)).await
    }

    pub async fn summary(&self) -> Result<EngineSummary, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Summary { reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Cancels everything live, then stops the loop. Await the task to get the coordinator back.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(EngineInput::Shutdown).await
    }
}

pub struct EngineRuntime {
    coordinator: ExecutionCoordinator,
    client: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    inputs: mpsc::Receiver<EngineInput>,
    // outcomes and snapshots come back in through the same channel
    feedback: mpsc::Sender<EngineInput>,
    resync_in_flight: bool,
}

impl EngineRuntime {
    /// Subscribe, bootstrap against a fresh exchange snapshot, then run the loop on its own task.
    pub async fn start(
        mut coordinator: ExecutionCoordinator,
        client: Arc<dyn ExchangeClient>,
    ) -> Result<(EngineHandle, JoinHandle<ExecutionCoordinator>), EngineError> {
        let config = coordinator.config().execution.clone();
        let (tx, inputs) = mpsc::channel(config.input_channel_capacity);

        // subscribe first so nothing between the snapshot and the stream is missed
        let mut stream = read_with_retry(&config, || client.subscribe()).await?;
        let snapshot = fetch_snapshot(client.as_ref(), &config).await?;
        coordinator.set_time(Timestamp::now());
        coordinator.bootstrap(&snapshot)?;

        let forward = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if forward.send(EngineInput::Exchange(event)).await.is_err() {
                    break;
                }
            }
            debug!("exchange stream closed");
        });

        let runtime = EngineRuntime {
            coordinator,
            client,
            config,
            inputs,
            feedback: tx.clone(),
            resync_in_flight: false,
        };
        let task = tokio::spawn(runtime.run());
        info!("engine runtime started");
        Ok((EngineHandle { tx }, task))
    }

    async fn run(mut self) -> ExecutionCoordinator {
        let mut timer = tokio::time::interval(Duration::from_millis(self.config.timer_interval_ms));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.dispatch();

        loop {
            tokio::select! {
                input = self.inputs.recv() => {
                    let Some(input) = input else {
                        break;
                    };
                    self.coordinator.set_time(Timestamp::now());
                    if !self.handle(input) {
                        self.drain_on_shutdown().await;
                        break;
                    }
                }
                _ = timer.tick() => {
                    self.coordinator.set_time(Timestamp::now());
                    if let Err(e) = self.coordinator.on_tick() {
                        error!(error = %e, "tick failed");
                    }
                }
            }
            self.dispatch();
        }
        info!("engine runtime stopped");
        self.coordinator
    }

    // false once the loop should stop
    fn handle(&mut self, input: EngineInput) -> bool {
        let coordinator = &mut self.coordinator;
        match input {
            EngineInput::Submit { intent, reply } => {
                let _ = reply.send(coordinator.submit(intent));
            }
            EngineInput::Cancel { correlation_id, reply } => {
                let _ = reply.send(coordinator.cancel(correlation_id));
            }
            EngineInput::Market(snapshot) => {
                if let Err(e) = coordinator.on_market(snapshot) {
                    warn!(error = %e, "market update failed");
                }
            }
            EngineInput::Exchange(event) => {
                if let Err(e) = coordinator.on_exchange_event(event) {
                    error!(error = %e, "exchange event failed");
                }
            }
            EngineInput::Transfer(transfer) => {
                if let Err(e) = coordinator.on_transfer(transfer) {
                    error!(error = %e, "transfer failed");
                }
            }
            EngineInput::Outcome(outcome) => {
                if let Err(e) = coordinator.on_command_outcome(outcome) {
                    warn!(error = %e, "command outcome failed");
                }
            }
            EngineInput::Snapshot(snapshot) => {
                self.resync_in_flight = false;
                if let Err(e) = coordinator.reconcile(&snapshot) {
                    error!(error = %e, "reconciliation failed");
                }
            }
            EngineInput::ResyncFailed(e) => {
                self.resync_in_flight = false;
                warn!(error = %e, "re-sync failed");
            }
            EngineInput::ResetBreaker { reply } => {
                let _ = reply.send(coordinator.reset_breaker());
            }
            EngineInput::StartQuoting(symbol) => {
                if let Err(e) = coordinator.start_market_making(&symbol) {
                    warn!(%symbol, error = %e, "start quoting failed");
                }
            }
            EngineInput::StopQuoting(symbol) => {
                if let Err(e) = coordinator.stop_market_making(&symbol) {
                    warn!(%symbol, error = %e, "stop quoting failed");
                }
            }
            EngineInput::Summary { reply } => {
                let _ = reply.send(coordinator.summary());
            }
            EngineInput::Shutdown => return false,
        }
        true
    }

    fn dispatch(&mut self) {
        for command in self.coordinator.take_commands() {
            let client = Arc::clone(&self.client);
            let config = self.config.clone();
            let feedback = self.feedback.clone();
            match command {
                ExchangeCommand::Place(request) => {
                    tokio::spawn(async move {
                        let correlation_id = request.client_id;
                        let result = place_with_requery(client.as_ref(), request, &config).await;
                        let _ = feedback
                            .send(EngineInput::Outcome(CommandOutcome::Placed { correlation_id, result }))
                            .await;
                    });
                }
                ExchangeCommand::Cancel {
                    correlation_id,
                    symbol,
                    exchange_order_id,
                } => {
                    tokio::spawn(async move {
                        let result = with_deadline(config.request_timeout_ms, client.cancel_order(&symbol, exchange_order_id)).await;
                        let _ = feedback
                            .send(EngineInput::Outcome(CommandOutcome::Cancelled {
                                correlation_id,
                                exchange_order_id,
                                result,
                            }))
                            .await;
                    });
                }
                ExchangeCommand::QueryOrder(correlation_id) => {
                    tokio::spawn(async move {
                        let result = read_with_retry(&config, || client.query_order(correlation_id)).await;
                        let _ = feedback
                            .send(EngineInput::Outcome(CommandOutcome::StatusQueried { correlation_id, result }))
                            .await;
                    });
                }
                ExchangeCommand::Resync => {
                    if self.resync_in_flight {
                        continue;
                    }
                    self.resync_in_flight = true;
                    tokio::spawn(async move {
                        let input = match fetch_snapshot(client.as_ref(), &config).await {
                            Ok(snapshot) => EngineInput::Snapshot(snapshot),
                            Err(e) => EngineInput::ResyncFailed(e),
                        };
                        let _ = feedback.send(input).await;
                    });
                }
            }
        }
    }

    // cancels go out inline so they land before the process exits
    async fn drain_on_shutdown(&mut self) {
        let requested = self.coordinator.cancel_all(None);
        info!(requested, "shutting down; cancelling live orders");
        for command in self.coordinator.take_commands() {
            if let ExchangeCommand::Cancel {
                symbol,
                exchange_order_id,
                ..
            } = command
            {
                let result = with_deadline(
                    self.config.request_timeout_ms,
                    self.client.cancel_order(&symbol, exchange_order_id),
                )
                .await;
                if let Err(e) = result {
                    warn!(%symbol, %exchange_order_id, error = %e, "shutdown cancel failed");
                }
            }
        }
    }
}

/// Open orders and balances, each read retried on its own.
pub async fn fetch_snapshot(client: &dyn ExchangeClient, config: &ExecutionConfig) -> Result<ExchangeSnapshot, ExchangeError> {
    let open_orders = read_with_retry(config, || client.query_open_orders()).await?;
    let balances = read_with_retry(config, || client.query_balances()).await?;
    Ok(ExchangeSnapshot {
        open_orders,
        balances,
        taken_at: Timestamp::now(),
    })
}

/// Place, and on a transient failure ask the exchange whether it has the order before
/// trying again. The client id is reused on every attempt.
pub async fn place_with_requery(
    client: &dyn ExchangeClient,
    request: PlaceOrderRequest,
    config: &ExecutionConfig,
) -> Result<PlaceAck, ExchangeError> {
    let attempts = config.max_place_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match with_deadline(config.request_timeout_ms, client.place_order(request.clone())).await {
            Ok(ack) => return Ok(ack),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        match read_with_retry(config, || client.query_order(request.client_id)).await {
            Ok(Some(report)) => {
                info!(client_id = %request.client_id, exchange_order_id = %report.exchange_order_id, "place landed despite error");
                return Ok(PlaceAck {
                    exchange_order_id: report.exchange_order_id,
                });
            }
            Ok(None) if attempt < attempts => {
                let delay = backoff_delay(config.retry_base_delay_ms, attempt);
                warn!(client_id = %request.client_id, attempt, error = %error, ?delay, "place not seen by exchange; retrying");
                tokio::time::sleep(delay).await;
            }
            Ok(None) => return Err(error),
            Err(e) => return Err(e),
        }
    }
}

pub async fn read_with_retry<T, F, Fut>(config: &ExecutionConfig, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let attempts = config.read_retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_deadline(config.request_timeout_ms, op()).await {
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff_delay(config.retry_base_delay_ms, attempt);
                debug!(attempt, error = %e, ?delay, "read failed; backing off");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

async fn with_deadline<T>(timeout_ms: u64, call: impl Future<Output = Result<T, ExchangeError>>) -> Result<T, ExchangeError> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout),
    }
}

/// base, 2x base, 4x base ... capped at 2^10 x base.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_ms.saturating_mul(1 << exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(50, 1), Duration::from_millis(50));
        assert_eq!(backoff_delay(50, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(50, 4), Duration::from_millis(400));
        assert_eq!(backoff_delay(50, 40), Duration::from_millis(50 * 1024));
    }
}
