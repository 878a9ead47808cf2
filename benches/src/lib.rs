//! Benchmark utilities for candlewick.

use candlewick_types::{Candle, Decimal};

/// One minute in milliseconds.
pub const MINUTE: i64 = 60_000;

/// Generates `count` continuous one-minute bars starting at `first_open`.
///
/// Prices walk up and down in a fixed saw pattern so high and low change
/// across bars.
pub fn minute_bars(first_open: i64, count: usize) -> Vec<Candle> {
    (0..count as i64)
        .map(|i| {
            let open_time = first_open + i * MINUTE;
            let base = Decimal::from(100 + (i % 17) - 8);
            Candle::new(
                open_time,
                open_time + MINUTE - 1,
                base,
                base + Decimal::ONE,
                base - Decimal::ONE,
                base + Decimal::new(5, 1),
                Decimal::new(1234 + i % 100, 3),
            )
        })
        .collect()
}

/// Instants spread over several years, one every 7 hours 13 minutes.
pub fn spread_instants(count: usize) -> Vec<i64> {
    const STEP: i64 = (7 * 60 + 13) * MINUTE;
    (0..count as i64).map(|i| 1_600_000_000_000 + i * STEP).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_bars_are_continuous() {
        let bars = minute_bars(0, 100);
        assert!(bars.windows(2).all(|w| w[0].is_continuous_with(&w[1])));
        assert!(bars.iter().all(|b| b.low < b.high));
    }
}
