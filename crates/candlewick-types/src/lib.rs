//! Core types for the candlewick bar aggregator.
//!
//! This crate provides the data structures and boundary math shared by every
//! other candlewick crate:
//!
//! - [`Timeframe`] - Bar timeframe such as `1m`, `4h` or `1M`
//! - [`Calendar`] - Timezone-aware bar boundaries with optional anchors
//! - [`Candle`] - A single OHLCV bar with decimal prices
//! - [`Pair`] - Tradable instrument metadata

#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/candlewick/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod calendar;
mod candle;
mod error;
mod pair;
mod timeframe;

pub use calendar::{Calendar, candle_times, close_time, duration, is_open_time, open_time};
pub use candle::{Candle, Discontinuity, ensure_continuous};
pub use chrono::Weekday;
pub use chrono_tz::Tz;
pub use error::{CalendarError, InvalidTimeframe};
pub use pair::{Pair, Precision};
pub use rust_decimal::Decimal;
pub use timeframe::{TimeUnit, Timeframe, sort_timeframes};
