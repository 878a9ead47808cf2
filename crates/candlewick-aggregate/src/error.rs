//! Aggregation errors.

use candlewick_exchange::ExchangeError;
use candlewick_types::{CalendarError, Timeframe};
use thiserror::Error;

/// Candle store invariant violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A bar does not follow the previous one.
    #[error("{symbol} {timeframe}: bar at {actual} is not continuous, expected {expected}")]
    NotContinuous {
        /// Symbol.
        symbol: String,
        /// Timeframe.
        timeframe: Timeframe,
        /// Expected open time.
        expected: i64,
        /// Actual open time.
        actual: i64,
    },

    /// An open candle already exists.
    #[error("{symbol} {timeframe}: open candle already exists")]
    AlreadyOpen {
        /// Symbol.
        symbol: String,
        /// Timeframe.
        timeframe: Timeframe,
    },

    /// No open candle to merge into.
    #[error("{symbol} {timeframe}: no open candle for bar at {open_time}")]
    MissingOpenCandle {
        /// Symbol.
        symbol: String,
        /// Timeframe.
        timeframe: Timeframe,
        /// Open time of the rejected input.
        open_time: i64,
    },

    /// The input opens before the open candle.
    #[error("{symbol} {timeframe}: bar at {open_time} precedes open candle at {candle_open}")]
    BeforeOpen {
        /// Symbol.
        symbol: String,
        /// Timeframe.
        timeframe: Timeframe,
        /// Open time of the rejected input.
        open_time: i64,
        /// Open time of the open candle.
        candle_open: i64,
    },

    /// The symbol has no state in the store.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

/// Where a continuity check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Base bars received from the exchange.
    Receive,
    /// Bars emitted downstream.
    Emit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Receive => write!(f, "received"),
            Self::Emit => write!(f, "emitted"),
        }
    }
}

/// Errors raised by the aggregation controller.
#[derive(Error, Debug, Clone)]
pub enum AggregateError {
    /// Store invariant violated.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Boundary computation failed.
    #[error(transparent)]
    Calendar(#[from] CalendarError),

    /// Exchange call failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Consecutive bars of a channel are not continuous.
    #[error("{stage} {symbol} {timeframe} bars are not continuous: expected {expected}, got {actual}")]
    NotContinuous {
        /// Where the check failed.
        stage: Stage,
        /// Symbol.
        symbol: String,
        /// Timeframe.
        timeframe: Timeframe,
        /// Expected open time.
        expected: i64,
        /// Actual open time.
        actual: i64,
    },

    /// A configured symbol is not listed by the exchange.
    #[error("pair {0} is not supported by the exchange")]
    UnknownPair(String),

    /// The configuration cannot be run.
    #[error("invalid configuration: {0}")]
    Config(String),
}
