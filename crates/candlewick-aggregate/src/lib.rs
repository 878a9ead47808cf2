//! Candle aggregation for candlewick.
//!
//! - [`CandleStore`] - Open and last sealed candles per symbol and timeframe
//! - [`Aggregator`] - Backfills, replays and merges live base bars
//! - [`EmitGate`] - Watermarks and continuity of emitted bars

#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/candlewick/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod controller;
mod emit;
mod error;
mod store;

pub use config::{AggregatorConfig, KnownCandles};
pub use controller::{Aggregator, AggregatorEvent};
pub use emit::EmitGate;
pub use error::{AggregateError, Stage, StoreError};
pub use store::{Aggregated, AggregationTask, CandleStore};
