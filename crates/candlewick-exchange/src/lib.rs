//! Venue collaborators for candlewick.
//!
//! This crate provides everything the aggregator needs from a trading venue:
//!
//! - [`Exchange`] - Historical bars, live bar streams and pair listings
//! - [`RateLimiter`] - Weighted per-second limiter with venue-driven pauses
//! - [`fetch_candles_range`] - Paged, continuity-checked history
//! - [`PairCache`] - Pair cache sharing one pending refresh
//! - [`BinanceExchange`] - Binance spot, USD-M and COIN-M adapter

#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/candlewick/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod binance;
mod client;
mod error;
mod exchange;
mod history;
mod limiter;
mod pairs;
mod parse;
pub mod url;

pub use binance::{BinanceConfig, BinanceExchange, Market};
pub use client::{ClientConfig, RestClient};
pub use error::ExchangeError;
pub use exchange::{CandleQuery, EventHub, Exchange, ExchangeEvent, WatchHandle};
pub use history::fetch_candles_range;
pub use limiter::{CallError, RateLimitExceeded, RateLimitSignal, RateLimiter};
pub use pairs::{PairCache, PairMap};
