// 6.4: rolling equity curve. tracks the high-water mark over an optional window and the
// drawdown from it: (hwm - equity) / hwm.
// windowed peaks use a monotonic deque so each sample is pushed and popped at most once.

use crate::types::{Amount, Timestamp};
use rust_decimal::Decimal;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct EquityCurve {
    // None = peak since the last reset
    window_ms: Option<u64>,
    // equity strictly decreasing front to back
    peaks: VecDeque<(Timestamp, Amount)>,
    current: Option<Amount>,
    max_drawdown_seen: Decimal,
}

impl EquityCurve {
    pub fn new(window_ms: Option<u64>) -> Self {
        Self {
            window_ms,
            peaks: VecDeque::new(),
            current: None,
            max_drawdown_seen: Decimal::ZERO,
        }
    }

    pub fn record(&mut self, equity: Amount, now: Timestamp) -> Decimal {
        while self.peaks.back().is_some_and(|(_, e)| *e <= equity) {
            self.peaks.pop_back();
        }
        self.peaks.push_back((now, equity));

        if let Some(window) = self.window_ms {
            let cutoff = now.plus_millis(-(window as i64));
            // never empty the deque: the latest sample always survives
            while self.peaks.len() > 1 && self.peaks.front().is_some_and(|(t, _)| *t < cutoff) {
                self.peaks.pop_front();
            }
        }

        self.current = Some(equity);
        let drawdown = self.drawdown();
        self.max_drawdown_seen = self.max_drawdown_seen.max(drawdown);
        drawdown
    }

    pub fn high_water_mark(&self) -> Option<Amount> {
        self.peaks.front().map(|(_, e)| *e)
    }

    pub fn current(&self) -> Option<Amount> {
        self.current
    }

    pub fn drawdown(&self) -> Decimal {
        match (self.high_water_mark(), self.current) {
            (Some(hwm), Some(equity)) if hwm.value() > Decimal::ZERO => {
                ((hwm.value() - equity.value()) / hwm.value()).max(Decimal::ZERO)
            }
            _ => Decimal::ZERO,
        }
    }

    pub fn max_drawdown_seen(&self) -> Decimal {
        self.max_drawdown_seen
    }

    /// Move the whole curve by an external cash flow so deposits and withdrawals never read
    /// as performance.
    pub fn shift(&mut self, delta: Amount) {
        for (_, equity) in self.peaks.iter_mut() {
            *equity = equity.add(delta);
        }
        self.current = self.current.map(|c| c.add(delta));
    }

    /// Forget history and start the peak from `equity`.
    pub fn rebase(&mut self, equity: Amount, now: Timestamp) {
        self.peaks.clear();
        self.peaks.push_back((now, equity));
        self.current = Some(equity);
        self.max_drawdown_seen = Decimal::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn amt(v: Decimal) -> Amount {
        Amount::new(v)
    }

    #[test]
    fn drawdown_from_peak() {
        let mut curve = EquityCurve::new(None);
        curve.record(amt(dec!(100000)), Timestamp::from_millis(0));
        curve.record(amt(dec!(90000)), Timestamp::from_millis(1));
        assert_eq!(curve.drawdown(), dec!(0.1));

        let dd = curve.record(amt(dec!(79000)), Timestamp::from_millis(2));
        assert_eq!(dd, dec!(0.21));
        assert_eq!(curve.high_water_mark(), Some(amt(dec!(100000))));
    }

    #[test]
    fn new_peak_resets_drawdown() {
        let mut curve = EquityCurve::new(None);
        curve.record(amt(dec!(100)), Timestamp::from_millis(0));
        curve.record(amt(dec!(90)), Timestamp::from_millis(1));
        curve.record(amt(dec!(120)), Timestamp::from_millis(2));
        assert_eq!(curve.drawdown(), Decimal::ZERO);
        assert_eq!(curve.max_drawdown_seen(), dec!(0.1));
    }

    #[test]
    fn window_drops_old_peaks() {
        let mut curve = EquityCurve::new(Some(1_000));
        curve.record(amt(dec!(200)), Timestamp::from_millis(0));
        curve.record(amt(dec!(150)), Timestamp::from_millis(500));
        assert_eq!(curve.high_water_mark(), Some(amt(dec!(200))));

        // the 200 peak ages out, 150 is now the best in window
        curve.record(amt(dec!(140)), Timestamp::from_millis(1_400));
        assert_eq!(curve.high_water_mark(), Some(amt(dec!(150))));
    }

    #[test]
    fn rebase_starts_fresh() {
        let mut curve = EquityCurve::new(None);
        curve.record(amt(dec!(100000)), Timestamp::from_millis(0));
        curve.record(amt(dec!(79000)), Timestamp::from_millis(1));
        curve.rebase(amt(dec!(79000)), Timestamp::from_millis(2));
        assert_eq!(curve.drawdown(), Decimal::ZERO);
        assert_eq!(curve.high_water_mark(), Some(amt(dec!(79000))));
    }

    #[test]
    fn withdrawal_shift_is_not_drawdown() {
        let mut curve = EquityCurve::new(None);
        curve.record(Amount::new(dec!(100000)), Timestamp::from_millis(0));
        curve.shift(Amount::new(dec!(-30000)));
        assert_eq!(curve.high_water_mark(), Some(Amount::new(dec!(70000))));
        let dd = curve.record(Amount::new(dec!(63000)), Timestamp::from_millis(1));
        assert_eq!(dd, dec!(0.1));
    }
}
