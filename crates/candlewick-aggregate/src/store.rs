//! Per-symbol candle store.
//!
//! For every (symbol, timeframe) the store holds at most one open candle and
//! the last candle that was sealed. A timeframe cycles between having no open
//! candle and having one: [`CandleStore::create_open_candle`] opens it,
//! [`CandleStore::aggregate`] merges base bars into it and seals it once the
//! merged bar closes with it.

use candlewick_types::{Candle, Decimal, Timeframe};
use rust_decimal::RoundingStrategy;
use std::collections::{BTreeMap, HashMap};

use crate::StoreError;

/// A base bar waiting to be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationTask {
    /// Base bar.
    pub candle: Candle,
    /// Whether the base bar is final.
    pub is_close: bool,
}

/// Result of [`CandleStore::aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregated {
    /// Open candle with the input merged in.
    pub candle: Candle,
    /// Whether the merge sealed the candle.
    pub is_close: bool,
}

#[derive(Debug, Default)]
struct SymbolState {
    is_active: bool,
    open_candles: BTreeMap<Timeframe, Candle>,
    last_close_candles: BTreeMap<Timeframe, Candle>,
    last_inputs: BTreeMap<Timeframe, Candle>,
    queue: BTreeMap<(i64, u64), AggregationTask>,
    arrivals: u64,
}

/// Aggregation state of every tracked symbol.
#[derive(Debug, Default)]
pub struct CandleStore {
    symbols: HashMap<String, SymbolState>,
}

impl CandleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `symbol` with fresh, inactive state, replacing any
    /// existing state.
    pub fn create(&mut self, symbol: &str) {
        self.symbols.insert(symbol.to_string(), SymbolState::default());
    }

    /// Returns true if `symbol` is tracked.
    #[must_use]
    pub fn has(&self, symbol: &str) -> bool {
        self.symbols.contains_key(symbol)
    }

    /// Drops the state of `symbol`, including queued work.
    pub fn remove(&mut self, symbol: &str) -> bool {
        self.symbols.remove(symbol).is_some()
    }

    /// Drops every symbol.
    pub fn clear(&mut self) {
        self.symbols.clear();
    }

    /// Number of tracked symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Returns true if no symbol is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Returns true once `symbol` has been activated.
    #[must_use]
    pub fn is_active(&self, symbol: &str) -> bool {
        self.symbols.get(symbol).is_some_and(|state| state.is_active)
    }

    /// Returns the open candle of `symbol` in `timeframe`.
    #[must_use]
    pub fn open_candle(&self, symbol: &str, timeframe: Timeframe) -> Option<&Candle> {
        self.symbols.get(symbol)?.open_candles.get(&timeframe)
    }

    /// Returns the last sealed candle of `symbol` in `timeframe`.
    #[must_use]
    pub fn last_close_candle(&self, symbol: &str, timeframe: Timeframe) -> Option<&Candle> {
        self.symbols.get(symbol)?.last_close_candles.get(&timeframe)
    }

    /// Returns true if `symbol` has an open candle in `timeframe`.
    #[must_use]
    pub fn has_open_candle(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.open_candle(symbol, timeframe).is_some()
    }

    /// Opens a flat candle at `open_price`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyOpen`] if a candle is open, or
    /// [`StoreError::NotContinuous`] if it would not follow the last sealed
    /// candle.
    pub fn create_open_candle(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        open_time: i64,
        close_time: i64,
        open_price: Decimal,
    ) -> Result<Candle, StoreError> {
        let candle = Candle::flat(open_time, close_time, open_price);
        self.set_open_candle(symbol, timeframe, candle)?;
        Ok(candle)
    }

    /// Seeds the open candle from externally known state.
    ///
    /// # Errors
    ///
    /// Same as [`CandleStore::create_open_candle`], plus
    /// [`StoreError::UnknownSymbol`].
    pub fn set_open_candle(&mut self, symbol: &str, timeframe: Timeframe, candle: Candle) -> Result<(), StoreError> {
        let state = self.state_mut(symbol)?;

        if state.open_candles.contains_key(&timeframe) {
            return Err(StoreError::AlreadyOpen { symbol: symbol.to_string(), timeframe });
        }
        check_follows(symbol, timeframe, state.last_close_candles.get(&timeframe), &candle)?;

        state.open_candles.insert(timeframe, candle);
        Ok(())
    }

    /// Merges a base bar into the open candle of `timeframe`.
    ///
    /// `high`, `low` and `close` follow the input, volume adds up and is
    /// rounded to `precision` decimal places. The merged state is kept only
    /// when `is_close`; partial inputs yield a preview. A closing input that
    /// ends with the open candle seals it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotContinuous`] if the input neither repeats nor
    /// follows the previous input, [`StoreError::MissingOpenCandle`] if no
    /// candle is open, or [`StoreError::BeforeOpen`] if the input opens
    /// before the open candle.
    pub fn aggregate(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        input: &Candle,
        is_close: bool,
        precision: u32,
    ) -> Result<Aggregated, StoreError> {
        let state = self.state_mut(symbol)?;

        if let Some(last) = state.last_inputs.get(&timeframe) {
            if last.open_time != input.open_time && !last.is_continuous_with(input) {
                return Err(StoreError::NotContinuous {
                    symbol: symbol.to_string(),
                    timeframe,
                    expected: last.close_time + 1,
                    actual: input.open_time,
                });
            }
        }

        let Some(open) = state.open_candles.get(&timeframe).copied() else {
            return Err(StoreError::MissingOpenCandle {
                symbol: symbol.to_string(),
                timeframe,
                open_time: input.open_time,
            });
        };

        if input.open_time < open.open_time {
            return Err(StoreError::BeforeOpen {
                symbol: symbol.to_string(),
                timeframe,
                open_time: input.open_time,
                candle_open: open.open_time,
            });
        }

        let merged = Candle {
            high: open.high.max(input.high),
            low: open.low.min(input.low),
            close: input.close,
            volume: (open.volume + input.volume)
                .round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero),
            ..open
        };
        let sealed = is_close && input.close_time == merged.close_time;
        if sealed {
            check_follows(symbol, timeframe, state.last_close_candles.get(&timeframe), &merged)?;
        }

        state.last_inputs.insert(timeframe, *input);
        if sealed {
            state.last_close_candles.insert(timeframe, merged);
            state.open_candles.remove(&timeframe);
        } else if is_close {
            state.open_candles.insert(timeframe, merged);
        }

        Ok(Aggregated { candle: merged, is_close: sealed })
    }

    /// Buffers a task for `symbol`, ordered by open time then arrival.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownSymbol`] if `symbol` is not tracked.
    pub fn add_to_queue(&mut self, symbol: &str, task: AggregationTask) -> Result<(), StoreError> {
        let state = self.state_mut(symbol)?;
        state.arrivals += 1;
        let key = (task.candle.open_time, state.arrivals);
        state.queue.insert(key, task);
        Ok(())
    }

    /// Marks `symbol` active and returns its queued tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownSymbol`] if `symbol` is not tracked.
    pub fn activate(&mut self, symbol: &str) -> Result<Vec<AggregationTask>, StoreError> {
        let state = self.state_mut(symbol)?;
        state.is_active = true;
        Ok(std::mem::take(&mut state.queue).into_values().collect())
    }

    /// Returns the queued tasks of an active symbol, oldest first. Inactive
    /// symbols keep their queue.
    pub fn drain_ready(&mut self, symbol: &str) -> Vec<AggregationTask> {
        match self.symbols.get_mut(symbol) {
            Some(state) if state.is_active => std::mem::take(&mut state.queue).into_values().collect(),
            _ => Vec::new(),
        }
    }

    /// Number of tasks queued for `symbol`.
    #[must_use]
    pub fn queued(&self, symbol: &str) -> usize {
        self.symbols.get(symbol).map_or(0, |state| state.queue.len())
    }

    fn state_mut(&mut self, symbol: &str) -> Result<&mut SymbolState, StoreError> {
        self.symbols
            .get_mut(symbol)
            .ok_or_else(|| StoreError::UnknownSymbol(symbol.to_string()))
    }
}

fn check_follows(symbol: &str, timeframe: Timeframe, last: Option<&Candle>, next: &Candle) -> Result<(), StoreError> {
    match last {
        Some(last) if !last.is_continuous_with(next) => Err(StoreError::NotContinuous {
            symbol: symbol.to_string(),
            timeframe,
            expected: last.close_time + 1,
            actual: next.open_time,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINUTE: i64 = 60_000;
    const FIVE: i64 = 5 * MINUTE;

    fn tf(s: &str) -> Timeframe {
        s.parse().unwrap()
    }

    fn bar(open_time: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> Candle {
        Candle::new(open_time, open_time + MINUTE - 1, open, high, low, close, volume)
    }

    fn store_with_open(symbol: &str) -> CandleStore {
        let mut store = CandleStore::new();
        store.create(symbol);
        store.create_open_candle(symbol, tf("5m"), 0, FIVE - 1, dec!(10)).unwrap();
        store
    }

    #[test]
    fn test_merge_and_seal() {
        let mut store = store_with_open("BTC");
        let five = tf("5m");

        for i in 0..5 {
            let price = dec!(10) + Decimal::from(i);
            let result = store
                .aggregate("BTC", five, &bar(i * MINUTE, price, price + dec!(1), price - dec!(1), price, dec!(0.123)), true, 3)
                .unwrap();
            assert_eq!(result.is_close, i == 4);
        }

        assert!(!store.has_open_candle("BTC", five));
        let sealed = store.last_close_candle("BTC", five).copied().unwrap();
        assert_eq!(sealed.open_time, 0);
        assert_eq!(sealed.close_time, FIVE - 1);
        assert_eq!(sealed.open, dec!(10));
        assert_eq!(sealed.high, dec!(15));
        assert_eq!(sealed.low, dec!(9));
        assert_eq!(sealed.close, dec!(14));
        assert_eq!(sealed.volume, dec!(0.615));
    }

    #[test]
    fn test_partial_is_not_persisted() {
        let mut store = store_with_open("BTC");
        let five = tf("5m");

        let preview = store
            .aggregate("BTC", five, &bar(0, dec!(10), dec!(20), dec!(5), dec!(12), dec!(3)), false, 8)
            .unwrap();
        assert_eq!(preview.candle.high, dec!(20));
        assert_eq!(preview.candle.volume, dec!(3));
        assert!(!preview.is_close);

        let open = store.open_candle("BTC", five).copied().unwrap();
        assert_eq!(open.high, dec!(10));
        assert_eq!(open.volume, dec!(0));

        // The same bar may be repeated, now as its close.
        let closed = store
            .aggregate("BTC", five, &bar(0, dec!(10), dec!(11), dec!(9), dec!(10.5), dec!(2)), true, 8)
            .unwrap();
        assert_eq!(closed.candle.high, dec!(11));
        assert_eq!(store.open_candle("BTC", five).unwrap().volume, dec!(2));
    }

    #[test]
    fn test_volume_rounding() {
        let mut store = store_with_open("BTC");
        let result = store
            .aggregate("BTC", tf("5m"), &bar(0, dec!(10), dec!(10), dec!(10), dec!(10), dec!(1.2345)), true, 3)
            .unwrap();
        assert_eq!(result.candle.volume, dec!(1.235));
    }

    #[test]
    fn test_gap_in_inputs_is_rejected() {
        let mut store = store_with_open("BTC");
        let five = tf("5m");

        store.aggregate("BTC", five, &bar(0, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)), true, 8).unwrap();
        let err = store
            .aggregate("BTC", five, &bar(2 * MINUTE, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)), true, 8)
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::NotContinuous { symbol: "BTC".into(), timeframe: five, expected: MINUTE, actual: 2 * MINUTE }
        );
    }

    #[test]
    fn test_rejected_input_leaves_state_untouched() {
        let mut store = store_with_open("BTC");
        let five = tf("5m");

        store.aggregate("BTC", five, &bar(0, dec!(10), dec!(11), dec!(9), dec!(10), dec!(1)), true, 8).unwrap();
        let before = store.open_candle("BTC", five).copied();

        let gap = bar(3 * MINUTE, dec!(10), dec!(50), dec!(1), dec!(40), dec!(7));
        assert!(store.aggregate("BTC", five, &gap, true, 8).is_err());
        assert_eq!(store.open_candle("BTC", five).copied(), before);
        assert!(store.last_close_candle("BTC", five).is_none());

        // the rejected bar did not become the continuity reference
        for i in 1..5 {
            store
                .aggregate("BTC", five, &bar(i * MINUTE, dec!(10), dec!(12), dec!(8), dec!(11), dec!(1)), true, 8)
                .unwrap();
        }
        let sealed = store.last_close_candle("BTC", five).copied().unwrap();
        assert_eq!(sealed.high, dec!(12));
        assert_eq!(sealed.low, dec!(8));
        assert_eq!(sealed.volume, dec!(5));
        assert!(!store.has_open_candle("BTC", five));
    }

    #[test]
    fn test_missing_and_before_open() {
        let mut store = CandleStore::new();
        store.create("BTC");
        let five = tf("5m");

        let err = store.aggregate("BTC", five, &bar(0, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)), true, 8);
        assert!(matches!(err, Err(StoreError::MissingOpenCandle { open_time: 0, .. })));

        store.create_open_candle("BTC", five, FIVE, 2 * FIVE - 1, dec!(1)).unwrap();
        let err = store.aggregate("BTC", five, &bar(MINUTE, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)), true, 8);
        assert!(matches!(err, Err(StoreError::BeforeOpen { open_time: MINUTE, candle_open: FIVE, .. })));
    }

    #[test]
    fn test_open_candle_checks() {
        let mut store = store_with_open("BTC");
        let five = tf("5m");

        let err = store.create_open_candle("BTC", five, 0, FIVE - 1, dec!(1)).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyOpen { .. }));

        for i in 0..5 {
            store.aggregate("BTC", five, &bar(i * MINUTE, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)), true, 8).unwrap();
        }

        let err = store.create_open_candle("BTC", five, 2 * FIVE, 3 * FIVE - 1, dec!(1)).unwrap_err();
        assert!(matches!(err, StoreError::NotContinuous { expected: FIVE, .. }));
        store.create_open_candle("BTC", five, FIVE, 2 * FIVE - 1, dec!(1)).unwrap();

        assert!(matches!(
            store.set_open_candle("ETH", five, Candle::flat(0, 1, dec!(1))),
            Err(StoreError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_sealed_candles_are_continuous() {
        let mut store = CandleStore::new();
        store.create("BTC");
        let five = tf("5m");

        for window in 0..3 {
            let open_time = window * FIVE;
            store.create_open_candle("BTC", five, open_time, open_time + FIVE - 1, dec!(1)).unwrap();
            let previous = store.last_close_candle("BTC", five).copied();
            for i in 0..5 {
                store
                    .aggregate("BTC", five, &bar(open_time + i * MINUTE, dec!(1), dec!(2), dec!(1), dec!(1), dec!(1)), true, 8)
                    .unwrap();
            }
            let sealed = store.last_close_candle("BTC", five).copied().unwrap();
            if let Some(previous) = previous {
                assert!(previous.is_continuous_with(&sealed));
            }
            assert_eq!(sealed.volume, dec!(5));
        }
    }

    #[test]
    fn test_queue_waits_for_activation() {
        let mut store = CandleStore::new();
        store.create("BTC");

        let task = |open_time: i64| AggregationTask { candle: Candle::flat(open_time, open_time + MINUTE - 1, dec!(1)), is_close: true };
        store.add_to_queue("BTC", task(2 * MINUTE)).unwrap();
        store.add_to_queue("BTC", task(MINUTE)).unwrap();
        store.add_to_queue("BTC", task(2 * MINUTE)).unwrap();

        assert!(store.drain_ready("BTC").is_empty());
        assert_eq!(store.queued("BTC"), 3);

        let tasks = store.activate("BTC").unwrap();
        let opens: Vec<i64> = tasks.iter().map(|t| t.candle.open_time).collect();
        assert_eq!(opens, vec![MINUTE, 2 * MINUTE, 2 * MINUTE]);
        assert!(store.is_active("BTC"));

        store.add_to_queue("BTC", task(3 * MINUTE)).unwrap();
        assert_eq!(store.drain_ready("BTC").len(), 1);
        assert_eq!(store.queued("BTC"), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut store = store_with_open("BTC");
        store.create("ETH");
        assert_eq!(store.len(), 2);

        assert!(store.remove("BTC"));
        assert!(!store.has("BTC"));
        assert!(!store.remove("BTC"));

        store.clear();
        assert!(store.is_empty());
    }
}
