//! Aggregator configuration.

use candlewick_types::{Candle, Timeframe, Weekday, sort_timeframes};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Open candles known from a previous run, applied when the base bar opening
/// at `apply_at` is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownCandles {
    /// Base bar open time at which the candles are seeded.
    pub apply_at: i64,
    /// Open candle per timeframe.
    pub candles: BTreeMap<Timeframe, Candle>,
}

/// Configuration for the [`Aggregator`](crate::Aggregator).
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Symbols to aggregate. Every active pair when unset.
    pub symbols: Option<Vec<String>>,
    /// Timeframes to produce. The lowest one is streamed from the venue.
    pub timeframes: Vec<Timeframe>,
    /// React to pair listings, changes and delistings.
    pub handle_pair_updates: bool,
    /// Stop streaming a pair once it becomes inactive.
    pub unwatch_on_pair_disabled: bool,
    /// Start aggregating newly listed pairs.
    pub auto_add_new_pairs: bool,
    /// Symbols backfilled concurrently.
    pub init_concurrency: usize,
    /// Fail a symbol when emitted bars are not continuous.
    pub validate_emit: bool,
    /// Earliest open time emitted per symbol and timeframe.
    pub emit_from: HashMap<String, BTreeMap<Timeframe, i64>>,
    /// Open candles to resume from, per symbol.
    pub known_candles: HashMap<String, KnownCandles>,
    /// Boundary anchors for timeframes that need one.
    pub anchors: BTreeMap<Timeframe, i64>,
    /// Symbol sampled for anchors that are not configured. The first pair
    /// when unset.
    pub sample_symbol: Option<String>,
    /// First day of calendar weeks.
    pub week_start: Weekday,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            symbols: None,
            timeframes: Timeframe::standard(),
            handle_pair_updates: true,
            unwatch_on_pair_disabled: true,
            auto_add_new_pairs: true,
            init_concurrency: 1,
            validate_emit: true,
            emit_from: HashMap::new(),
            known_candles: HashMap::new(),
            anchors: BTreeMap::new(),
            sample_symbol: None,
            week_start: Weekday::Mon,
        }
    }
}

impl AggregatorConfig {
    /// Restricts aggregation to `symbols`.
    #[must_use]
    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }

    /// Replaces the timeframes.
    #[must_use]
    pub fn with_timeframes(mut self, timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        self.timeframes = timeframes.into_iter().collect();
        self
    }

    /// Sets how many symbols backfill at once.
    #[must_use]
    pub const fn with_init_concurrency(mut self, init_concurrency: usize) -> Self {
        self.init_concurrency = init_concurrency;
        self
    }

    /// Anchors the boundaries of `timeframe` at `base_time`.
    #[must_use]
    pub fn with_anchor(mut self, timeframe: Timeframe, base_time: i64) -> Self {
        self.anchors.insert(timeframe, base_time);
        self
    }

    /// Sets the earliest emitted open time of `symbol` in `timeframe`.
    #[must_use]
    pub fn with_emit_from(mut self, symbol: impl Into<String>, timeframe: Timeframe, open_time: i64) -> Self {
        self.emit_from.entry(symbol.into()).or_default().insert(timeframe, open_time);
        self
    }

    /// Resumes `symbol` from known open candles.
    #[must_use]
    pub fn with_known_candles(mut self, symbol: impl Into<String>, known: KnownCandles) -> Self {
        self.known_candles.insert(symbol.into(), known);
        self
    }

    /// Returns the timeframes sorted lowest first, without duplicates.
    #[must_use]
    pub fn sorted_timeframes(&self) -> Vec<Timeframe> {
        let mut timeframes = self.timeframes.clone();
        sort_timeframes(&mut timeframes);
        timeframes
    }

    /// Returns the lowest configured timeframe.
    #[must_use]
    pub fn base_timeframe(&self) -> Option<Timeframe> {
        self.timeframes.iter().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AggregatorConfig::default();
        assert!(config.symbols.is_none());
        assert_eq!(config.init_concurrency, 1);
        assert!(config.handle_pair_updates);
        assert!(config.validate_emit);
        assert_eq!(config.base_timeframe(), Some(Timeframe::MINUTE));
    }

    #[test]
    fn test_sorted_timeframes() {
        let config = AggregatorConfig::default().with_timeframes(
            ["1h", "5m", "1M", "1m", "5m"].iter().map(|s| s.parse().unwrap()),
        );
        let sorted: Vec<String> = config.sorted_timeframes().iter().map(ToString::to_string).collect();
        assert_eq!(sorted, ["1m", "5m", "1h", "1M"]);
        assert_eq!(config.base_timeframe(), Some(Timeframe::MINUTE));
    }

    #[test]
    fn test_builders() {
        let config = AggregatorConfig::default()
            .with_symbols(["BTCUSDT"])
            .with_init_concurrency(4)
            .with_anchor("3d".parse().unwrap(), 0)
            .with_emit_from("BTCUSDT", Timeframe::HOUR, 3_600_000);
        assert_eq!(config.symbols.as_deref(), Some(&["BTCUSDT".to_string()][..]));
        assert_eq!(config.init_concurrency, 4);
        assert_eq!(config.emit_from["BTCUSDT"][&Timeframe::HOUR], 3_600_000);
    }
}
