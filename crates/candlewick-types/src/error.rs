//! Error types for candlewick core types.

use thiserror::Error;

use crate::Timeframe;

/// Error returned when a timeframe specification is malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid timeframe '{input}': {reason}")]
pub struct InvalidTimeframe {
    input: String,
    reason: &'static str,
}

impl InvalidTimeframe {
    pub(crate) fn new(input: impl Into<String>, reason: &'static str) -> Self {
        Self {
            input: input.into(),
            reason,
        }
    }

    /// Returns the rejected input.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Returns why the input was rejected.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        self.reason
    }
}

/// Errors raised by calendar boundary computations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    /// The timeframe needs an anchor instant to derive its boundaries.
    #[error("timeframe {0} requires a base time to compute its boundaries")]
    MissingBaseTime(Timeframe),

    /// The timestamp cannot be represented as a date.
    #[error("timestamp {0} is out of the supported range")]
    InvalidTimestamp(i64),

    /// A local time has no UTC counterpart in the configured timezone.
    #[error("local time {0} does not exist in timezone {1}")]
    NonexistentLocalTime(String, String),

    /// The timezone name is not a known IANA timezone.
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}
