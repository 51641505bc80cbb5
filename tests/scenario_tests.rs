//! End-to-end scenarios against the coordinator.
//!
//! Exchange events are built by hand so each test controls sequencing exactly.

use perps_mm::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn btc() -> Symbol {
    Symbol::new("BTC-PERP")
}

fn usdc() -> Token {
    Token::new("USDC")
}

fn px(value: Decimal) -> Price {
    Price::new_unchecked(value)
}

fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::simulation();
    config.markets[0].quoting_enabled = false;
    config
}

fn coordinator(config: EngineConfig) -> ExecutionCoordinator {
    let mut engine = ExecutionCoordinator::new(config).unwrap();
    engine.set_time(Timestamp::from_millis(1_000));
    engine.seed_balance(&usdc(), Amount::new(dec!(100_000))).unwrap();
    engine
}

fn book(mid: Decimal, ts: i64) -> MarketSnapshot {
    MarketSnapshot::new(btc(), Some(px(mid - dec!(0.5))), Some(px(mid + dec!(0.5))), Timestamp::from_millis(ts))
}

fn event(sequence: u64, kind: ExchangeEventKind) -> ExchangeEvent {
    ExchangeEvent {
        symbol: btc(),
        sequence: Sequence(sequence),
        timestamp: Timestamp::from_millis(1_000 + sequence as i64),
        kind,
    }
}

fn ack(id: CorrelationId, eid: u64) -> ExchangeEventKind {
    ExchangeEventKind::OrderAcknowledged {
        order: OrderRef::new(ExchangeOrderId(eid), Some(id)),
    }
}

fn fill(id: Option<CorrelationId>, eid: u64, side: Side, quantity: Decimal, price: Decimal) -> ExchangeEventKind {
    ExchangeEventKind::OrderFilled {
        order: OrderRef {
            exchange_order_id: Some(ExchangeOrderId(eid)),
            client_id: id,
        },
        side,
        quantity,
        price: px(price),
        fee: Amount::zero(),
        liquidity: Liquidity::Maker,
    }
}

fn bid(quantity: Decimal, price: Decimal) -> OrderIntent {
    OrderIntent::limit(btc(), Side::Buy, quantity, px(price), Liquidity::Maker)
}

/// Submit a bid and walk it to Open with exchange id `eid`.
fn open_bid(engine: &mut ExecutionCoordinator, quantity: Decimal, price: Decimal, eid: u64, seq: u64) -> CorrelationId {
    let id = engine.submit(bid(quantity, price)).unwrap();
    engine.on_exchange_event(event(seq, ack(id, eid))).unwrap();
    id
}

fn assert_books_consistent(engine: &ExecutionCoordinator) {
    let balance = engine.balance(&usdc());
    assert_eq!(balance.locked, engine.ledger().reserved_total(&usdc()));
    assert!(!balance.free.is_negative());
}

mod lifecycle {
    use super::*;

    #[test]
    fn partial_fill_then_cancel() {
        let mut engine = coordinator(quiet_config());

        let id = engine.submit(bid(dec!(1), dec!(50_000))).unwrap();
        assert_eq!(engine.balance(&usdc()).locked.value(), dec!(50_000));
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Pending);
        let commands = engine.take_commands();
        assert!(matches!(&commands[..], [ExchangeCommand::Place(req)] if req.client_id == id));

        engine.on_exchange_event(event(1, ack(id, 11))).unwrap();
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Open);

        engine
            .on_exchange_event(event(2, fill(Some(id), 11, Side::Buy, dec!(0.4), dec!(50_000))))
            .unwrap();
        assert_eq!(engine.balance(&usdc()).locked.value(), dec!(30_000));
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::PartiallyFilled);
        assert_books_consistent(&engine);

        engine.cancel(id).unwrap();
        let commands = engine.take_commands();
        assert!(matches!(
            &commands[..],
            [ExchangeCommand::Cancel { correlation_id: Some(c), exchange_order_id: ExchangeOrderId(11), .. }] if *c == id
        ));

        engine
            .on_exchange_event(event(
                3,
                ExchangeEventKind::OrderCancelled {
                    order: OrderRef::new(ExchangeOrderId(11), Some(id)),
                },
            ))
            .unwrap();
        assert_eq!(engine.balance(&usdc()).locked, Amount::zero());
        assert_eq!(engine.balance(&usdc()).total().value(), dec!(100_000));
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(engine.position_size(&btc()), dec!(0.4));
    }

    #[test]
    fn cancel_before_ack_waits_for_ack() {
        let mut engine = coordinator(quiet_config());
        let id = engine.submit(bid(dec!(1), dec!(50_000))).unwrap();
        engine.take_commands();

        engine.cancel(id).unwrap();
        assert!(engine.take_commands().is_empty());
        // asking again changes nothing
        engine.cancel(id).unwrap();
        assert!(engine.take_commands().is_empty());

        engine.on_exchange_event(event(1, ack(id, 11))).unwrap();
        let commands = engine.take_commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], ExchangeCommand::Cancel { exchange_order_id: ExchangeOrderId(11), .. }));
    }

    #[test]
    fn duplicate_intent_rejected_while_live() {
        let mut engine = coordinator(quiet_config());
        engine.submit(bid(dec!(1), dec!(50_000))).unwrap();
        let err = engine.submit(bid(dec!(1), dec!(50_000))).unwrap_err();
        assert!(matches!(err, EngineError::Registry(RegistryError::DuplicateIntent(_))));
        assert!(err.is_rejection());
    }

    #[test]
    fn insufficient_free_never_reaches_exchange() {
        let mut engine = coordinator(quiet_config());
        let err = engine.submit(bid(dec!(3), dec!(50_000))).unwrap_err();
        assert!(matches!(err, EngineError::Ledger(LedgerError::InsufficientFree { .. })));
        assert_eq!(engine.pending_commands(), 0);
        assert_eq!(engine.registry().live_count(), 0);
    }

    #[test]
    fn rejected_place_releases_lock() {
        let mut engine = coordinator(quiet_config());
        let id = engine.submit(bid(dec!(1), dec!(50_000))).unwrap();
        engine
            .on_command_outcome(CommandOutcome::Placed {
                correlation_id: id,
                result: Err(ExchangeError::Rejected("post only would cross".into())),
            })
            .unwrap();
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Rejected);
        assert_eq!(engine.balance(&usdc()).locked, Amount::zero());
    }

    #[test]
    fn status_query_without_order_closes_locally() {
        let mut engine = coordinator(quiet_config());
        let id = engine.submit(bid(dec!(1), dec!(50_000))).unwrap();
        engine
            .on_command_outcome(CommandOutcome::StatusQueried {
                correlation_id: id,
                result: Ok(None),
            })
            .unwrap();
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Rejected);
        assert_eq!(engine.balance(&usdc()).free.value(), dec!(100_000));
    }

    #[test]
    fn failed_cancel_can_be_requested_again() {
        let mut engine = coordinator(quiet_config());
        let id = open_bid(&mut engine, dec!(1), dec!(50_000), 11, 1);
        engine.take_commands();

        engine.cancel(id).unwrap();
        assert_eq!(engine.take_commands().len(), 1);
        engine
            .on_command_outcome(CommandOutcome::Cancelled {
                correlation_id: Some(id),
                exchange_order_id: ExchangeOrderId(11),
                result: Err(ExchangeError::Transport("reset".into())),
            })
            .unwrap();
        assert!(!engine.order(id).unwrap().cancel_in_flight());

        engine.cancel(id).unwrap();
        assert_eq!(engine.take_commands().len(), 1);
    }
}

mod ingestion {
    use super::*;

    #[test]
    fn replayed_fill_is_ignored() {
        let mut engine = coordinator(quiet_config());
        let id = open_bid(&mut engine, dec!(1), dec!(50_000), 11, 1);
        let filled = event(2, fill(Some(id), 11, Side::Buy, dec!(0.4), dec!(50_000)));

        assert_eq!(engine.on_exchange_event(filled.clone()).unwrap(), 1);
        assert_eq!(engine.on_exchange_event(filled).unwrap(), 0);

        assert_eq!(engine.position_size(&btc()), dec!(0.4));
        assert_eq!(engine.order(id).unwrap().filled_quantity, dec!(0.4));
        assert!(engine.events().any(|e| matches!(
            e.kind,
            EngineEventKind::StaleEvent { reason: StaleReason::Duplicate, .. }
        )));
    }

    #[test]
    fn out_of_order_events_wait_for_the_gap() {
        let mut engine = coordinator(quiet_config());
        // first event fixes where the stream starts
        open_bid(&mut engine, dec!(0.1), dec!(40_000), 10, 1);
        let id = engine.submit(bid(dec!(1), dec!(50_000))).unwrap();

        let early_fill = event(3, fill(Some(id), 11, Side::Buy, dec!(1), dec!(50_000)));
        assert_eq!(engine.on_exchange_event(early_fill).unwrap(), 0);
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Pending);

        assert_eq!(engine.on_exchange_event(event(2, ack(id, 11))).unwrap(), 2);
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Filled);
        assert!(engine.ledger().reservation(id).is_none());
        assert_eq!(engine.balance(&usdc()).locked.value(), dec!(4_000));
    }

    #[test]
    fn lost_gap_applies_buffer_and_requests_resync() {
        let mut engine = coordinator(quiet_config());
        let id = open_bid(&mut engine, dec!(1), dec!(50_000), 11, 1);
        engine.take_commands();

        let late = event(4, fill(Some(id), 11, Side::Buy, dec!(0.5), dec!(50_000)));
        assert_eq!(engine.on_exchange_event(late).unwrap(), 0);

        engine.advance_time(10_000);
        assert_eq!(engine.expire_sequence_gaps().unwrap(), 1);
        assert_eq!(engine.position_size(&btc()), dec!(0.5));
        assert!(engine.take_commands().contains(&ExchangeCommand::Resync));
        assert!(engine.events().any(|e| matches!(
            e.kind,
            EngineEventKind::StaleEvent { reason: StaleReason::GapLost { .. }, .. }
        )));

        // the lost sequence turning up later is discarded
        let stale = event(2, fill(Some(id), 11, Side::Buy, dec!(0.5), dec!(50_000)));
        assert_eq!(engine.on_exchange_event(stale).unwrap(), 0);
        assert_eq!(engine.position_size(&btc()), dec!(0.5));
    }

    #[test]
    fn fill_sequenced_before_first_event_is_applied() {
        let mut engine = coordinator(quiet_config());
        let id = engine.submit(bid(dec!(1), dec!(50_000))).unwrap();
        engine.take_commands();

        assert_eq!(engine.on_exchange_event(event(2, ack(id, 11))).unwrap(), 1);
        let early = event(1, fill(Some(id), 11, Side::Buy, dec!(0.4), dec!(50_000)));
        assert_eq!(engine.on_exchange_event(early.clone()).unwrap(), 1);

        assert_eq!(engine.position_size(&btc()), dec!(0.4));
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::PartiallyFilled);
        assert!(engine.take_commands().contains(&ExchangeCommand::Resync));
        assert!(engine.events().any(|e| matches!(
            e.kind,
            EngineEventKind::StaleEvent { reason: StaleReason::BeforeBaseline, .. }
        )));

        // a redelivery is still a duplicate
        assert_eq!(engine.on_exchange_event(early).unwrap(), 0);
        assert_eq!(engine.position_size(&btc()), dec!(0.4));
        assert_books_consistent(&engine);
    }

    /// Accepts `accept` appends, then fails every one after.
    struct FailingJournal {
        inner: MemoryJournal,
        accept: usize,
    }

    impl Journal for FailingJournal {
        fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
            if self.inner.len() >= self.accept {
                return Err(JournalError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            self.inner.append(entry)
        }

        fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
            self.inner.entries()
        }
    }

    #[test]
    fn journal_failure_mid_batch_applies_everything_and_halts() {
        // seed, submit and the first ack are journaled; nothing after
        let journal = FailingJournal {
            inner: MemoryJournal::new(),
            accept: 3,
        };
        let mut engine = ExecutionCoordinator::with_journal(quiet_config(), Box::new(journal)).unwrap();
        engine.set_time(Timestamp::from_millis(1_000));
        engine.seed_balance(&usdc(), Amount::new(dec!(100_000))).unwrap();
        let id = open_bid(&mut engine, dec!(1), dec!(50_000), 11, 1);
        engine.take_commands();

        let later = event(3, fill(Some(id), 11, Side::Buy, dec!(0.5), dec!(50_000)));
        assert_eq!(engine.on_exchange_event(later.clone()).unwrap(), 0);

        let err = engine
            .on_exchange_event(event(2, fill(Some(id), 11, Side::Buy, dec!(0.2), dec!(50_000))))
            .unwrap_err();
        assert!(matches!(err, EngineError::Journal(_)));
        assert_eq!(err.class(), ErrorClass::Fatal);

        // both fills landed even though neither made it into the journal
        assert_eq!(engine.position_size(&btc()), dec!(0.7));
        assert_eq!(engine.order(id).unwrap().filled_quantity, dec!(0.7));
        assert_eq!(engine.journal_entries().unwrap().len(), 3);

        assert!(engine.summary().halted_tokens.contains(&usdc()));
        assert!(engine.take_commands().contains(&ExchangeCommand::Resync));
        let blocked = engine.submit(bid(dec!(0.1), dec!(49_000))).unwrap_err();
        assert!(matches!(blocked, EngineError::Risk(RiskRejection::Halted(_))));

        // a redelivery after the failure does not double count
        assert_eq!(engine.on_exchange_event(later).unwrap(), 0);
        assert_eq!(engine.position_size(&btc()), dec!(0.7));
    }

    #[test]
    fn unmatched_fill_moves_position_and_alerts() {
        let mut engine = coordinator(quiet_config());
        engine
            .on_exchange_event(event(1, fill(None, 999, Side::Sell, dec!(0.2), dec!(50_000))))
            .unwrap();

        assert_eq!(engine.position_size(&btc()), dec!(-0.2));
        assert!(engine
            .events()
            .any(|e| matches!(e.kind, EngineEventKind::UnmatchedFill { .. })));
        assert!(engine.take_commands().contains(&ExchangeCommand::Resync));
    }

    #[test]
    fn overfill_is_refused() {
        let mut engine = coordinator(quiet_config());
        let id = open_bid(&mut engine, dec!(1), dec!(50_000), 11, 1);
        engine
            .on_exchange_event(event(2, fill(Some(id), 11, Side::Buy, dec!(1.5), dec!(50_000))))
            .unwrap();

        assert_eq!(engine.position_size(&btc()), Decimal::ZERO);
        assert_eq!(engine.order(id).unwrap().filled_quantity, Decimal::ZERO);
        assert!(engine.events().any(|e| matches!(e.kind, EngineEventKind::Overfill { .. })));
    }

    #[test]
    fn funding_moves_cash_and_realized() {
        let mut engine = coordinator(quiet_config());
        let id = open_bid(&mut engine, dec!(1), dec!(50_000), 11, 1);
        engine
            .on_exchange_event(event(2, fill(Some(id), 11, Side::Buy, dec!(1), dec!(50_000))))
            .unwrap();
        engine
            .on_exchange_event(event(
                3,
                ExchangeEventKind::FundingApplied {
                    rate: dec!(0.0001),
                    amount: Amount::new(dec!(-5)),
                },
            ))
            .unwrap();

        assert_eq!(engine.balance(&usdc()).total().value(), dec!(99_995));
        let position = engine.positions().get(&btc()).unwrap();
        assert_eq!(position.cumulative_funding.value(), dec!(-5));
        assert_eq!(position.realized_pnl.value(), dec!(-5));
    }

    #[test]
    fn funding_that_would_overdraw_halts_the_token() {
        let mut engine = coordinator(quiet_config());
        engine
            .on_exchange_event(event(
                1,
                ExchangeEventKind::FundingApplied {
                    rate: dec!(0.5),
                    amount: Amount::new(dec!(-200_000)),
                },
            ))
            .unwrap();

        assert_eq!(engine.balance(&usdc()).total().value(), dec!(100_000));
        let err = engine.submit(bid(dec!(0.1), dec!(50_000))).unwrap_err();
        assert!(matches!(err, EngineError::Risk(RiskRejection::Halted(_))));

        assert!(engine.clear_halt(&usdc()));
        engine.submit(bid(dec!(0.1), dec!(50_000))).unwrap();
    }
}

mod breaker {
    use super::*;

    fn long_one_btc(engine: &mut ExecutionCoordinator) {
        engine.on_market(book(dec!(50_000), 1_000)).unwrap();
        let id = open_bid(engine, dec!(1), dec!(50_000), 11, 1);
        engine
            .on_exchange_event(event(2, fill(Some(id), 11, Side::Buy, dec!(1), dec!(50_000))))
            .unwrap();
        engine.take_commands();
    }

    #[test]
    fn drawdown_past_threshold_trips_and_blocks() {
        let mut engine = coordinator(quiet_config());
        long_one_btc(&mut engine);
        assert_eq!(engine.equity().value(), dec!(100_000));

        engine.on_market(book(dec!(29_000), 2_000)).unwrap();
        assert_eq!(engine.equity().value(), dec!(79_000));
        assert!(engine.risk().is_tripped());

        let err = engine.submit(bid(dec!(0.1), dec!(29_000))).unwrap_err();
        assert!(matches!(err, EngineError::Risk(RiskRejection::CircuitBreakerTripped)));
    }

    #[test]
    fn exactly_at_threshold_does_not_trip() {
        let mut engine = coordinator(quiet_config());
        long_one_btc(&mut engine);
        engine.on_market(book(dec!(30_000), 2_000)).unwrap();
        assert_eq!(engine.equity().value(), dec!(80_000));
        assert!(!engine.risk().is_tripped());
    }

    #[test]
    fn trip_cancels_open_orders() {
        let mut engine = coordinator(quiet_config());
        long_one_btc(&mut engine);
        let resting = open_bid(&mut engine, dec!(0.1), dec!(40_000), 12, 3);
        engine.take_commands();

        engine.on_market(book(dec!(29_000), 2_000)).unwrap();
        let commands = engine.take_commands();
        assert!(commands.iter().any(|c| matches!(
            c,
            ExchangeCommand::Cancel { correlation_id: Some(id), .. } if *id == resting
        )));
    }

    #[test]
    fn trip_flattens_when_configured() {
        let mut config = quiet_config();
        config.risk.flatten_on_trip = true;
        let mut engine = coordinator(config);
        long_one_btc(&mut engine);

        engine.on_market(book(dec!(29_000), 2_000)).unwrap();
        let commands = engine.take_commands();
        let flatten = commands.iter().find_map(|c| match c {
            ExchangeCommand::Place(req) => Some(req.clone()),
            _ => None,
        });
        let flatten = flatten.expect("flatten order");
        assert_eq!(flatten.side, Side::Sell);
        assert_eq!(flatten.quantity, dec!(1));
        assert!(flatten.reduce_only);
        assert_eq!(flatten.kind, OrderKind::Market);
    }

    #[test]
    fn reset_rearms_at_current_equity() {
        let mut engine = coordinator(quiet_config());
        long_one_btc(&mut engine);
        engine.on_market(book(dec!(29_000), 2_000)).unwrap();
        assert!(engine.reset_breaker());
        assert!(!engine.risk().is_tripped());

        // 79,000 is the new peak; a further 10% drop is fine
        engine.on_market(book(dec!(21_100), 3_000)).unwrap();
        assert!(!engine.risk().is_tripped());
        engine.submit(bid(dec!(0.1), dec!(21_000))).unwrap();
    }

    #[test]
    fn withdrawal_is_not_drawdown() {
        let mut engine = coordinator(quiet_config());
        engine.on_market(book(dec!(50_000), 1_000)).unwrap();
        engine
            .on_transfer(TransferSettled {
                token: usdc(),
                amount: Amount::new(dec!(40_000)),
                direction: TransferDirection::Withdrawal,
                tx_hash: "0xabc".into(),
            })
            .unwrap();
        engine.on_market(book(dec!(50_000), 2_000)).unwrap();

        assert_eq!(engine.equity().value(), dec!(60_000));
        assert!(!engine.risk().is_tripped());
    }
}

mod quoting {
    use super::*;

    #[test]
    fn quotes_symmetric_at_zero_inventory() {
        let mut engine = coordinator(EngineConfig::simulation());
        let plan = engine.on_market(book(dec!(50_000), 1_000)).unwrap().expect("quote cycle ran");

        assert_eq!(plan.places.len(), 2);
        let bid = plan.places.iter().find(|i| i.side == Side::Buy).unwrap();
        let ask = plan.places.iter().find(|i| i.side == Side::Sell).unwrap();
        let mid = dec!(50_000);
        assert_eq!(mid - bid.price.unwrap().value(), ask.price.unwrap().value() - mid);
        assert_eq!(bid.quantity, ask.quantity);
        assert_eq!(engine.registry().live_count(), 2);
    }

    #[test]
    fn long_inventory_leans_quotes_down() {
        let mut engine = coordinator(EngineConfig::simulation());
        engine
            .on_exchange_event(event(1, fill(None, 900, Side::Buy, dec!(0.5), dec!(50_000))))
            .unwrap();
        for (i, mid) in [dec!(50_000), dec!(50_010), dec!(49_990), dec!(50_005)].into_iter().enumerate() {
            engine.set_time(Timestamp::from_millis(2_000 + i as i64 * 1_000));
            engine.on_market(book(mid, 2_000 + i as i64 * 1_000)).unwrap();
        }
        let quote = engine.quotes().last_quote(&btc()).unwrap();
        assert!(quote.reservation_price < quote.mid.value());
        let (bid, ask) = (quote.bid.unwrap(), quote.ask.unwrap());
        assert!(bid.size < ask.size);
    }

    #[test]
    fn stop_cancels_maker_orders() {
        let mut engine = coordinator(EngineConfig::simulation());
        engine.on_market(book(dec!(50_000), 1_000)).unwrap();
        let ids: Vec<CorrelationId> = engine.registry().live_orders().map(|o| o.correlation_id).collect();
        for (i, id) in ids.iter().enumerate() {
            engine.on_exchange_event(event(i as u64 + 1, ack(*id, 100 + i as u64))).unwrap();
        }
        engine.take_commands();

        assert_eq!(engine.stop_market_making(&btc()).unwrap(), 2);
        assert_eq!(engine.take_commands().len(), 2);
        assert!(!engine.quotes().is_enabled(&btc()));
        assert!(engine.run_quote_cycle(&btc()).unwrap().is_empty());
    }
}

mod recovery {
    use super::*;

    #[test]
    fn orphan_sweep_cancels_exactly_once() {
        let mut engine = coordinator(quiet_config());
        let acked = open_bid(&mut engine, dec!(0.1), dec!(49_000), 11, 1);
        let pending = engine.submit(bid(dec!(0.1), dec!(48_000))).unwrap();
        let kept = open_bid(&mut engine, dec!(0.1), dec!(47_000), 13, 2);
        engine.take_commands();

        let still_open = OpenOrderSnapshot {
            exchange_order_id: ExchangeOrderId(13),
            client_id: Some(kept),
            symbol: btc(),
            side: Side::Buy,
            quantity: dec!(0.1),
            filled_quantity: Decimal::ZERO,
            price: Some(px(dec!(47_000))),
        };
        let swept = engine.orphan_sweep(std::slice::from_ref(&still_open));
        assert_eq!(swept, vec![acked, pending]);

        let commands = engine.take_commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0],
            ExchangeCommand::Cancel { correlation_id: Some(id), .. } if id == acked
        ));
        assert_eq!(engine.order(pending).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(engine.order(kept).unwrap().status, OrderStatus::Open);

        // a second sweep finds nothing new
        assert!(engine.orphan_sweep(std::slice::from_ref(&still_open)).is_empty());
        assert!(engine.take_commands().is_empty());
    }

    #[test]
    fn reconciliation_confirms_before_correcting() {
        let mut engine = coordinator(quiet_config());
        let id = open_bid(&mut engine, dec!(0.1), dec!(49_000), 11, 1);
        let snapshot = |at: i64| ExchangeSnapshot {
            open_orders: vec![],
            balances: vec![BalanceSnapshot {
                token: usdc(),
                total: Amount::new(dec!(100_050)),
            }],
            taken_at: Timestamp::from_millis(at),
        };

        let first = engine.reconcile(&snapshot(10_000)).unwrap();
        assert!(first.expire_local.is_empty());
        assert!(first.adjust_balances.is_empty());
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Open);

        let second = engine.reconcile(&snapshot(20_000)).unwrap();
        assert_eq!(second.expire_local, vec![id]);
        assert_eq!(engine.order(id).unwrap().status, OrderStatus::Expired);
        assert_eq!(engine.balance(&usdc()).total().value(), dec!(100_050));
        assert_eq!(engine.balance(&usdc()).locked, Amount::zero());
    }

    #[test]
    fn unknown_exchange_order_is_cancelled() {
        let mut engine = coordinator(quiet_config());
        let foreign = OpenOrderSnapshot {
            exchange_order_id: ExchangeOrderId(77),
            client_id: None,
            symbol: btc(),
            side: Side::Sell,
            quantity: dec!(1),
            filled_quantity: Decimal::ZERO,
            price: Some(px(dec!(60_000))),
        };
        let snapshot = ExchangeSnapshot {
            open_orders: vec![foreign],
            balances: vec![],
            taken_at: Timestamp::from_millis(5_000),
        };
        engine.reconcile(&snapshot).unwrap();
        engine.reconcile(&snapshot).unwrap();

        let cancels: Vec<_> = engine
            .take_commands()
            .into_iter()
            .filter(|c| matches!(c, ExchangeCommand::Cancel { correlation_id: None, .. }))
            .collect();
        assert_eq!(cancels.len(), 1);
    }

    #[test]
    fn journal_replay_rebuilds_state() {
        let mut engine = coordinator(quiet_config());
        let filled = open_bid(&mut engine, dec!(1), dec!(50_000), 11, 1);
        engine
            .on_exchange_event(event(2, fill(Some(filled), 11, Side::Buy, dec!(0.4), dec!(50_000))))
            .unwrap();
        let resting = open_bid(&mut engine, dec!(0.2), dec!(49_000), 12, 3);
        engine.cancel(resting).unwrap();
        engine
            .on_command_outcome(CommandOutcome::Placed {
                correlation_id: resting,
                result: Ok(PlaceAck {
                    exchange_order_id: ExchangeOrderId(12),
                }),
            })
            .unwrap();
        engine
            .on_transfer(TransferSettled {
                token: usdc(),
                amount: Amount::new(dec!(1_000)),
                direction: TransferDirection::Deposit,
                tx_hash: "0xdef".into(),
            })
            .unwrap();
        // a duplicate changes nothing, live or replayed
        engine
            .on_exchange_event(event(2, fill(Some(filled), 11, Side::Buy, dec!(0.4), dec!(50_000))))
            .unwrap();

        let journal = MemoryJournal::from_entries(engine.journal_entries().unwrap());
        let rebuilt = ExecutionCoordinator::replay(quiet_config(), Box::new(journal)).unwrap();

        assert_eq!(rebuilt.balance(&usdc()), engine.balance(&usdc()));
        assert_eq!(rebuilt.position_size(&btc()), dec!(0.4));
        assert_eq!(rebuilt.order(filled), engine.order(filled));
        assert_eq!(rebuilt.order(resting).unwrap().status, OrderStatus::Open);
        assert!(rebuilt.order(resting).unwrap().cancel_in_flight());
        assert_eq!(rebuilt.ledger().reservation_count(), engine.ledger().reservation_count());
        // the cancel that may not have gone out before the restart is sent again
        assert_eq!(rebuilt.pending_commands(), 1);
    }
}
