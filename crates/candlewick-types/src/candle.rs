//! OHLCV bar type.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar.
///
/// Times are UTC milliseconds, `close_time` is inclusive. Prices and volume
/// are exact decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Open time in UTC milliseconds.
    pub open_time: i64,
    /// Close time in UTC milliseconds, inclusive.
    pub close_time: i64,
    /// Open price.
    pub open: Decimal,
    /// Highest traded price.
    pub high: Decimal,
    /// Lowest traded price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded base volume.
    pub volume: Decimal,
}

impl Candle {
    /// Creates a new bar.
    #[must_use]
    pub const fn new(
        open_time: i64,
        close_time: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self { open_time, close_time, open, high, low, close, volume }
    }

    /// Creates a bar where all prices equal `price` and volume is zero.
    #[must_use]
    pub const fn flat(open_time: i64, close_time: i64, price: Decimal) -> Self {
        Self::new(open_time, close_time, price, price, price, price, Decimal::ZERO)
    }

    /// Returns true if `next` opens one millisecond after this bar closes.
    #[must_use]
    pub const fn is_continuous_with(&self, next: &Self) -> bool {
        self.close_time + 1 == next.open_time
    }

    /// Returns the bar length in milliseconds.
    #[must_use]
    pub const fn duration(&self) -> i64 {
        self.close_time - self.open_time + 1
    }

    /// Returns true if `ts` lies within the bar.
    #[must_use]
    pub const fn contains(&self, ts: i64) -> bool {
        self.open_time <= ts && ts <= self.close_time
    }
}

/// Gap between two consecutive bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discontinuity {
    /// Index of the bar that does not follow its predecessor.
    pub index: usize,
    /// Open time the bar was expected to have.
    pub expected: i64,
    /// Open time the bar actually has.
    pub actual: i64,
}

/// Checks that every bar in `candles` opens right after its predecessor.
///
/// # Errors
///
/// Returns the first [`Discontinuity`] found.
pub fn ensure_continuous(candles: &[Candle]) -> Result<(), Discontinuity> {
    candles.windows(2).enumerate().try_for_each(|(i, pair)| {
        if pair[0].is_continuous_with(&pair[1]) {
            Ok(())
        } else {
            Err(Discontinuity {
                index: i + 1,
                expected: pair[0].close_time + 1,
                actual: pair[1].open_time,
            })
        }
    })
}
