//! Tradable pair metadata.

use serde::{Deserialize, Serialize};

/// Number of decimal places a venue accepts for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Precision {
    /// Price decimal places.
    pub price: u32,
    /// Quantity decimal places. Aggregated volume is rounded to this.
    pub quantity: u32,
}

impl Precision {
    /// Creates a precision descriptor.
    #[must_use]
    pub const fn new(price: u32, quantity: u32) -> Self {
        Self { price, quantity }
    }
}

/// A tradable instrument on a venue.
///
/// Pairs are refreshed when the venue's instrument list changes. A delisted
/// pair is kept with `is_active` set to false.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pair {
    /// Venue symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Base asset.
    pub base: String,
    /// Quote asset.
    pub quote: String,
    /// Whether the pair is currently trading.
    pub is_active: bool,
    /// Decimal precision.
    pub precision: Precision,
}

impl Pair {
    /// Creates an active pair.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        base: impl Into<String>,
        quote: impl Into<String>,
        precision: Precision,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            base: base.into(),
            quote: quote.into(),
            is_active: true,
            precision,
        }
    }

    /// Returns a copy with `is_active` replaced.
    #[must_use]
    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{})", self.symbol, self.base, self.quote)
    }
}
