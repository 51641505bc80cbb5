//! Per-symbol ordering of the exchange event stream.
//!
//! Events are released strictly in sequence order. Anything ahead of the expected sequence
//! waits in a buffer until the gap closes; a gap that stays open past the reorder window, or
//! a buffer that grows past its bound, is declared lost so the stream can keep moving. The
//! caller is told about every duplicate, lost range and late arrival so it can raise
//! diagnostics and ask for a re-sync.
//!
//! A stream with no baseline from the exchange starts at the first sequence it sees. Lower
//! sequences that turn up afterwards were never applied, so they are released once with a
//! `BeforeBaseline` diagnostic instead of being dropped as duplicates.

use crate::events::ExchangeEvent;
use crate::types::{Sequence, Symbol, Timestamp};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

// lost ranges remembered per symbol for late-arrival detection
const MAX_LOST_RANGES: usize = 64;
// pre-baseline sequences remembered per symbol so a redelivery is caught as a duplicate
const MAX_EARLY_SEEN: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct SequencerConfig {
    pub max_reorder_wait_ms: u64,
    pub max_buffered_events: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceDiagnostic {
    Duplicate {
        symbol: Symbol,
        sequence: Sequence,
    },
    /// Inclusive range the stream stopped waiting for.
    GapLost {
        symbol: Symbol,
        from: Sequence,
        to: Sequence,
    },
    LateArrival {
        symbol: Symbol,
        sequence: Sequence,
    },
    /// Arrived below the sequence the stream started at. Released for application, but
    /// anything else that came before the stream started is unknown.
    BeforeBaseline {
        symbol: Symbol,
        sequence: Sequence,
    },
}

impl SequenceDiagnostic {
    /// Lost gaps and pre-baseline arrivals leave state unknown; the caller must re-sync.
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            SequenceDiagnostic::GapLost { .. } | SequenceDiagnostic::BeforeBaseline { .. }
        )
    }
}

/// Events ready to apply, in order, plus whatever the sequencer had to say about them.
#[derive(Debug, Default)]
pub struct Released {
    pub ready: Vec<ExchangeEvent>,
    pub diagnostics: Vec<SequenceDiagnostic>,
}

impl Released {
    fn merge(&mut self, other: Released) {
        self.ready.extend(other.ready);
        self.diagnostics.extend(other.diagnostics);
    }
}

#[derive(Debug)]
struct Stream {
    next_expected: Sequence,
    buffer: BTreeMap<Sequence, ExchangeEvent>,
    gap_opened_at: Option<Timestamp>,
    lost: VecDeque<(Sequence, Sequence)>,
    // first sequence seen, when the exchange never told us where the stream starts
    implicit_start: Option<Sequence>,
    early_seen: BTreeSet<Sequence>,
}

impl Stream {
    fn starting_at(sequence: Sequence) -> Self {
        Self {
            next_expected: sequence,
            buffer: BTreeMap::new(),
            gap_opened_at: None,
            lost: VecDeque::new(),
            implicit_start: Some(sequence),
            early_seen: BTreeSet::new(),
        }
    }

    fn before_start(&self, sequence: Sequence) -> bool {
        self.implicit_start.map_or(false, |start| sequence < start)
    }

    /// True the first time a pre-baseline sequence is seen.
    fn mark_early(&mut self, sequence: Sequence) -> bool {
        let fresh = self.early_seen.insert(sequence);
        while self.early_seen.len() > MAX_EARLY_SEEN {
            self.early_seen.pop_first();
        }
        fresh
    }

    fn was_lost(&self, sequence: Sequence) -> bool {
        self.lost.iter().any(|(from, to)| *from <= sequence && sequence <= *to)
    }

    // release everything contiguous from next_expected
    fn drain(&mut self, out: &mut Released) {
        while let Some(event) = self.buffer.remove(&self.next_expected) {
            self.next_expected = self.next_expected.next();
            out.ready.push(event);
        }
    }

    // give up on the gap in front of the first buffered event
    fn declare_lost(&mut self, symbol: &Symbol, now: Timestamp, out: &mut Released) {
        let first = match self.buffer.keys().next() {
            Some(first) => *first,
            None => return,
        };
        let from = self.next_expected;
        let to = Sequence(first.0 - 1);
        warn!(%symbol, from = from.0, to = to.0, "sequence gap declared lost");

        self.lost.push_back((from, to));
        while self.lost.len() > MAX_LOST_RANGES {
            self.lost.pop_front();
        }
        out.diagnostics.push(SequenceDiagnostic::GapLost {
            symbol: symbol.clone(),
            from,
            to,
        });

        self.next_expected = first;
        self.drain(out);
        self.gap_opened_at = if self.buffer.is_empty() { None } else { Some(now) };
    }
}

#[derive(Debug)]
pub struct EventSequencer {
    config: SequencerConfig,
    streams: HashMap<Symbol, Stream>,
}

impl EventSequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            streams: HashMap::new(),
        }
    }

    /// Sets the sequence the stream expects next. Anything below it is already reflected in
    /// exchange state. Without a baseline the first event seen becomes the start.
    pub fn set_baseline(&mut self, symbol: &Symbol, next_expected: Sequence) {
        let stream = self
            .streams
            .entry(symbol.clone())
            .or_insert_with(|| Stream::starting_at(next_expected));
        stream.next_expected = next_expected;
        stream.implicit_start = None;
        stream.early_seen.clear();
    }

    /// Marks a sequence as applied without going through the buffer. Replay uses this.
    pub fn observe_applied(&mut self, symbol: &Symbol, sequence: Sequence) {
        let stream = self
            .streams
            .entry(symbol.clone())
            .or_insert_with(|| Stream::starting_at(sequence));
        if stream.before_start(sequence) {
            stream.mark_early(sequence);
        } else if sequence >= stream.next_expected {
            stream.next_expected = sequence.next();
        }
    }

    pub fn next_expected(&self, symbol: &Symbol) -> Option<Sequence> {
        self.streams.get(symbol).map(|s| s.next_expected)
    }

    pub fn buffered(&self, symbol: &Symbol) -> usize {
        self.streams.get(symbol).map_or(0, |s| s.buffer.len())
    }

    pub fn offer(&mut self, event: ExchangeEvent, now: Timestamp) -> Released {
        let mut out = Released::default();
        let symbol = event.symbol.clone();
        let sequence = event.sequence;
        let max_buffered = self.config.max_buffered_events;

        let stream = self
            .streams
            .entry(symbol.clone())
            .or_insert_with(|| Stream::starting_at(sequence));

        if stream.before_start(sequence) {
            if stream.mark_early(sequence) {
                warn!(%symbol, sequence = sequence.0, "event from before the stream baseline released");
                out.diagnostics.push(SequenceDiagnostic::BeforeBaseline { symbol, sequence });
                out.ready.push(event);
            } else {
                debug!(%symbol, sequence = sequence.0, "duplicate event dropped");
                out.diagnostics.push(SequenceDiagnostic::Duplicate { symbol, sequence });
            }
            return out;
        }

        if sequence < stream.next_expected {
            if stream.was_lost(sequence) {
                warn!(%symbol, sequence = sequence.0, "late arrival of lost sequence discarded");
                out.diagnostics.push(SequenceDiagnostic::LateArrival { symbol, sequence });
            } else {
                debug!(%symbol, sequence = sequence.0, "duplicate event dropped");
                out.diagnostics.push(SequenceDiagnostic::Duplicate { symbol, sequence });
            }
            return out;
        }

        if sequence == stream.next_expected {
            stream.next_expected = sequence.next();
            out.ready.push(event);
            stream.drain(&mut out);
            stream.gap_opened_at = if stream.buffer.is_empty() { None } else { Some(now) };
            return out;
        }

        if stream.buffer.contains_key(&sequence) {
            out.diagnostics.push(SequenceDiagnostic::Duplicate { symbol, sequence });
            return out;
        }

        debug!(%symbol, sequence = sequence.0, expected = stream.next_expected.0, "event buffered behind gap");
        stream.buffer.insert(sequence, event);
        stream.gap_opened_at.get_or_insert(now);

        while stream.buffer.len() > max_buffered {
            stream.declare_lost(&symbol, now, &mut out);
        }
        out
    }

    /// Called on the timer. Gaps open longer than the reorder window are given up on.
    pub fn expire(&mut self, now: Timestamp) -> Released {
        let mut out = Released::default();
        let wait = self.config.max_reorder_wait_ms as i64;

        let mut symbols: Vec<&Symbol> = self.streams.keys().collect();
        symbols.sort();
        let symbols: Vec<Symbol> = symbols.into_iter().cloned().collect();

        for symbol in symbols {
            let Some(stream) = self.streams.get_mut(&symbol) else {
                continue;
            };
            if let Some(opened) = stream.gap_opened_at {
                if now.millis_since(opened) >= wait {
                    let mut released = Released::default();
                    stream.declare_lost(&symbol, now, &mut released);
                    out.merge(released);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ExchangeEventKind;
    use crate::types::Amount;
    use rust_decimal_macros::dec;

    fn seq(config: SequencerConfig) -> EventSequencer {
        EventSequencer::new(config)
    }

    fn cfg() -> SequencerConfig {
        SequencerConfig {
            max_reorder_wait_ms: 500,
            max_buffered_events: 4,
        }
    }

    fn ev(n: u64) -> ExchangeEvent {
        ExchangeEvent {
            symbol: Symbol::new("BTC-PERP"),
            sequence: Sequence(n),
            timestamp: Timestamp::from_millis(0),
            kind: ExchangeEventKind::FundingApplied {
                rate: dec!(0.0001),
                amount: Amount::new(dec!(1)),
            },
        }
    }

    fn seqs(released: &Released) -> Vec<u64> {
        released.ready.iter().map(|e| e.sequence.0).collect()
    }

    #[test]
    fn in_order_passes_through() {
        let mut s = seq(cfg());
        let t = Timestamp::from_millis(0);
        assert_eq!(seqs(&s.offer(ev(1), t)), vec![1]);
        assert_eq!(seqs(&s.offer(ev(2), t)), vec![2]);
        assert_eq!(s.next_expected(&Symbol::new("BTC-PERP")), Some(Sequence(3)));
    }

    #[test]
    fn gap_buffers_then_releases_in_order() {
        let mut s = seq(cfg());
        let t = Timestamp::from_millis(0);
        s.offer(ev(1), t);
        assert!(s.offer(ev(3), t).ready.is_empty());
        assert!(s.offer(ev(4), t).ready.is_empty());
        assert_eq!(seqs(&s.offer(ev(2), t)), vec![2, 3, 4]);
        assert_eq!(s.buffered(&Symbol::new("BTC-PERP")), 0);
    }

    #[test]
    fn replayed_sequence_is_duplicate() {
        let mut s = seq(cfg());
        let t = Timestamp::from_millis(0);
        s.offer(ev(1), t);
        s.offer(ev(2), t);
        let again = s.offer(ev(2), t);
        assert!(again.ready.is_empty());
        assert!(matches!(again.diagnostics[0], SequenceDiagnostic::Duplicate { .. }));
    }

    #[test]
    fn timeout_declares_gap_lost() {
        let mut s = seq(cfg());
        s.offer(ev(1), Timestamp::from_millis(0));
        s.offer(ev(4), Timestamp::from_millis(10));

        // window not elapsed yet
        assert!(s.expire(Timestamp::from_millis(400)).ready.is_empty());

        let released = s.expire(Timestamp::from_millis(510));
        assert_eq!(seqs(&released), vec![4]);
        assert_eq!(
            released.diagnostics,
            vec![SequenceDiagnostic::GapLost {
                symbol: Symbol::new("BTC-PERP"),
                from: Sequence(2),
                to: Sequence(3),
            }]
        );
        assert!(released.diagnostics[0].needs_resync());

        // 3 shows up after we gave up on it
        let late = s.offer(ev(3), Timestamp::from_millis(600));
        assert!(late.ready.is_empty());
        assert!(matches!(late.diagnostics[0], SequenceDiagnostic::LateArrival { .. }));
    }

    #[test]
    fn overflow_declares_gap_lost() {
        let mut s = seq(cfg());
        let t = Timestamp::from_millis(0);
        s.offer(ev(1), t);
        for n in 3..=6 {
            assert!(s.offer(ev(n), t).ready.is_empty());
        }
        // fifth buffered event overflows the bound of four
        let released = s.offer(ev(7), t);
        assert_eq!(seqs(&released), vec![3, 4, 5, 6, 7]);
        assert_eq!(released.diagnostics.len(), 1);
    }

    #[test]
    fn earlier_sequence_after_first_event_is_released_once() {
        let mut s = seq(cfg());
        let t = Timestamp::from_millis(0);
        assert_eq!(seqs(&s.offer(ev(2), t)), vec![2]);

        let early = s.offer(ev(1), t);
        assert_eq!(seqs(&early), vec![1]);
        assert_eq!(
            early.diagnostics,
            vec![SequenceDiagnostic::BeforeBaseline {
                symbol: Symbol::new("BTC-PERP"),
                sequence: Sequence(1),
            }]
        );
        assert!(early.diagnostics[0].needs_resync());
        assert_eq!(s.next_expected(&Symbol::new("BTC-PERP")), Some(Sequence(3)));

        let again = s.offer(ev(1), t);
        assert!(again.ready.is_empty());
        assert!(matches!(again.diagnostics[0], SequenceDiagnostic::Duplicate { .. }));
    }

    #[test]
    fn explicit_baseline_treats_lower_sequences_as_applied() {
        let mut s = seq(cfg());
        let t = Timestamp::from_millis(0);
        s.set_baseline(&Symbol::new("BTC-PERP"), Sequence(5));

        let old = s.offer(ev(3), t);
        assert!(old.ready.is_empty());
        assert!(matches!(old.diagnostics[0], SequenceDiagnostic::Duplicate { .. }));
        assert_eq!(seqs(&s.offer(ev(5), t)), vec![5]);
    }

    #[test]
    fn replayed_early_sequence_is_not_released_again() {
        let mut s = seq(cfg());
        let btc = Symbol::new("BTC-PERP");
        s.observe_applied(&btc, Sequence(2));
        s.observe_applied(&btc, Sequence(1));
        assert_eq!(s.next_expected(&btc), Some(Sequence(3)));

        let again = s.offer(ev(1), Timestamp::from_millis(0));
        assert!(again.ready.is_empty());
        assert!(matches!(again.diagnostics[0], SequenceDiagnostic::Duplicate { .. }));
    }

    #[test]
    fn symbols_are_independent() {
        let mut s = seq(cfg());
        let t = Timestamp::from_millis(0);
        s.offer(ev(1), t);
        let mut eth = ev(10);
        eth.symbol = Symbol::new("ETH-PERP");
        assert_eq!(seqs(&s.offer(eth, t)), vec![10]);
        assert!(s.offer(ev(3), t).ready.is_empty());
    }
}
