//! Timeframe definitions.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::InvalidTimeframe;

/// Calendar unit of a [`Timeframe`].
///
/// Variants are declared in granularity order, so the derived `Ord` sorts
/// the lowest granularity first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeUnit {
    /// Seconds (`s`).
    Second,
    /// Minutes (`m`).
    Minute,
    /// Hours (`h`).
    Hour,
    /// Days (`d`).
    Day,
    /// Weeks (`w`).
    Week,
    /// Calendar months (`M`).
    Month,
    /// Calendar years (`y`).
    Year,
}

impl TimeUnit {
    /// Returns the single-character symbol of the unit.
    #[must_use]
    pub const fn symbol(&self) -> char {
        match self {
            Self::Second => 's',
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'd',
            Self::Week => 'w',
            Self::Month => 'M',
            Self::Year => 'y',
        }
    }

    /// Parses a unit from its symbol. Symbols are case-sensitive.
    #[must_use]
    pub const fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            's' => Some(Self::Second),
            'm' => Some(Self::Minute),
            'h' => Some(Self::Hour),
            'd' => Some(Self::Day),
            'w' => Some(Self::Week),
            'M' => Some(Self::Month),
            'y' => Some(Self::Year),
            _ => None,
        }
    }

    /// Returns the length of one unit in milliseconds for units that have a
    /// fixed length regardless of calendar and timezone.
    #[must_use]
    pub const fn fixed_millis(&self) -> Option<i64> {
        match self {
            Self::Second => Some(1_000),
            Self::Minute => Some(60_000),
            Self::Hour => Some(3_600_000),
            _ => None,
        }
    }

    /// Returns the length of the parent cycle for sub-day units
    /// (60 seconds, 60 minutes, 24 hours).
    #[must_use]
    pub const fn parent_cycle(&self) -> Option<u32> {
        match self {
            Self::Second | Self::Minute => Some(60),
            Self::Hour => Some(24),
            _ => None,
        }
    }

    /// Returns all units, lowest granularity first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Second,
            Self::Minute,
            Self::Hour,
            Self::Day,
            Self::Week,
            Self::Month,
            Self::Year,
        ]
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Bar aggregation timeframe, e.g. `1m`, `4h`, `3d`, `1M`.
///
/// Ordering follows the unit first and the value second, so sorting a list
/// of timeframes puts the lowest granularity first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    unit: TimeUnit,
    value: u32,
}

impl Timeframe {
    /// One second.
    pub const SECOND: Self = Self::from_parts(TimeUnit::Second, 1);
    /// One minute.
    pub const MINUTE: Self = Self::from_parts(TimeUnit::Minute, 1);
    /// One hour.
    pub const HOUR: Self = Self::from_parts(TimeUnit::Hour, 1);
    /// One day.
    pub const DAY: Self = Self::from_parts(TimeUnit::Day, 1);
    /// One week.
    pub const WEEK: Self = Self::from_parts(TimeUnit::Week, 1);
    /// One calendar month.
    pub const MONTH: Self = Self::from_parts(TimeUnit::Month, 1);
    /// One calendar year.
    pub const YEAR: Self = Self::from_parts(TimeUnit::Year, 1);

    /// Creates a timeframe, validating its invariants.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is zero, or if `unit` is a week and
    /// `value` is not 1.
    pub fn new(unit: TimeUnit, value: u32) -> Result<Self, InvalidTimeframe> {
        if value == 0 {
            return Err(InvalidTimeframe::new(
                format!("{value}{unit}"),
                "value must be a positive integer",
            ));
        }

        if unit == TimeUnit::Week && value != 1 {
            return Err(InvalidTimeframe::new(
                format!("{value}{unit}"),
                "week timeframes only support a value of 1",
            ));
        }

        Ok(Self { unit, value })
    }

    const fn from_parts(unit: TimeUnit, value: u32) -> Self {
        Self { unit, value }
    }

    /// Returns the calendar unit.
    #[must_use]
    pub const fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// Returns the number of units per bar.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.value
    }

    /// Returns the fixed bar length in milliseconds, or `None` for
    /// calendar units whose length depends on the bar's open time.
    #[must_use]
    pub const fn fixed_millis(&self) -> Option<i64> {
        match self.unit.fixed_millis() {
            Some(ms) => Some(ms * self.value as i64),
            None => None,
        }
    }

    /// Returns true if boundaries of this timeframe can only be derived
    /// relative to an anchor instant.
    ///
    /// This is the case for multi-unit day/week/month/year timeframes and
    /// for sub-day timeframes whose value does not divide the parent cycle.
    #[must_use]
    pub const fn requires_anchor(&self) -> bool {
        if self.value == 1 {
            return false;
        }

        match self.unit.parent_cycle() {
            Some(cycle) => cycle % self.value != 0,
            None => true,
        }
    }

    /// Returns the timeframes offered by most venues, lowest first.
    #[must_use]
    pub fn standard() -> Vec<Self> {
        [
            (TimeUnit::Minute, 1),
            (TimeUnit::Minute, 3),
            (TimeUnit::Minute, 5),
            (TimeUnit::Minute, 15),
            (TimeUnit::Minute, 30),
            (TimeUnit::Hour, 1),
            (TimeUnit::Hour, 2),
            (TimeUnit::Hour, 4),
            (TimeUnit::Hour, 6),
            (TimeUnit::Hour, 8),
            (TimeUnit::Hour, 12),
            (TimeUnit::Day, 1),
            (TimeUnit::Day, 3),
            (TimeUnit::Week, 1),
            (TimeUnit::Month, 1),
        ]
        .into_iter()
        .map(|(unit, value)| Self::from_parts(unit, value))
        .collect()
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

impl FromStr for Timeframe {
    type Err = InvalidTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();

        let Some(symbol) = chars.next_back() else {
            return Err(InvalidTimeframe::new(s, "timeframe is empty"));
        };

        let unit = TimeUnit::from_symbol(symbol)
            .ok_or_else(|| InvalidTimeframe::new(s, "unknown unit, expected one of s, m, h, d, w, M, y"))?;

        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidTimeframe::new(s, "value must be a positive integer"));
        }

        let value = digits
            .parse::<u32>()
            .map_err(|_| InvalidTimeframe::new(s, "value is out of range"))?;

        Self::new(unit, value).map_err(|e| InvalidTimeframe::new(s, e.reason()))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = InvalidTimeframe;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.to_string()
    }
}

/// Sorts timeframes lowest granularity first and removes duplicates.
pub fn sort_timeframes(timeframes: &mut Vec<Timeframe>) {
    timeframes.sort_unstable();
    timeframes.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parse() {
        let tf: Timeframe = "5m".parse().unwrap();
        assert_eq!(tf.unit(), TimeUnit::Minute);
        assert_eq!(tf.value(), 5);

        assert_eq!("1M".parse::<Timeframe>().unwrap(), Timeframe::MONTH);
        assert_eq!("1w".parse::<Timeframe>().unwrap(), Timeframe::WEEK);
        assert_eq!("12h".parse::<Timeframe>().unwrap().to_string(), "12h");
    }

    #[test]
    fn test_timeframe_parse_rejects_invalid() {
        assert!("".parse::<Timeframe>().is_err());
        assert!("m".parse::<Timeframe>().is_err());
        assert!("0m".parse::<Timeframe>().is_err());
        assert!("-1m".parse::<Timeframe>().is_err());
        assert!("1.5h".parse::<Timeframe>().is_err());
        assert!("5x".parse::<Timeframe>().is_err());
        assert!("2w".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_timeframe_ordering() {
        let mut tfs: Vec<Timeframe> = ["1M", "1d", "5m", "1h", "1m", "3d", "1w", "1s", "1y", "1m"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        sort_timeframes(&mut tfs);

        let sorted: Vec<String> = tfs.iter().map(ToString::to_string).collect();
        assert_eq!(sorted, ["1s", "1m", "5m", "1h", "1d", "3d", "1w", "1M", "1y"]);
    }

    #[test]
    fn test_requires_anchor() {
        assert!(!Timeframe::DAY.requires_anchor());
        assert!(!"15m".parse::<Timeframe>().unwrap().requires_anchor());
        assert!(!"4h".parse::<Timeframe>().unwrap().requires_anchor());
        assert!("3d".parse::<Timeframe>().unwrap().requires_anchor());
        assert!("7m".parse::<Timeframe>().unwrap().requires_anchor());
        assert!("5h".parse::<Timeframe>().unwrap().requires_anchor());
    }

    #[test]
    fn test_timeframe_serde() {
        let tf: Timeframe = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(tf.fixed_millis(), Some(4 * 3_600_000));
        assert_eq!(serde_json::to_string(&tf).unwrap(), "\"4h\"");
        assert!(serde_json::from_str::<Timeframe>("\"4q\"").is_err());
    }
}
