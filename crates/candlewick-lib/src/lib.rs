//! Multi-timeframe OHLCV bar aggregation.
//!
//! This is a facade crate that re-exports functionality from the candlewick
//! workspace crates for convenient access.
//!
//! # Quick Start
//!
//! ```no_run
//! use candlewick_lib::prelude::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let exchange = Arc::new(BinanceExchange::new(BinanceConfig::new(Market::Spot))?);
//! let config = AggregatorConfig::default()
//!     .with_symbols(["ETHUSDT"])
//!     .with_timeframes([Timeframe::MINUTE, Timeframe::HOUR]);
//!
//! let (aggregator, mut events) = Aggregator::new(exchange, config);
//! tokio::spawn(aggregator.run(CancellationToken::new()));
//!
//! while let Some(event) = events.recv().await {
//!     if let AggregatorEvent::Candle { pair, timeframe, candle, is_close } = event {
//!         println!("{} {timeframe} {} closed={is_close}", pair.symbol, candle.close);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/candlewick/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Re-export core types
pub use candlewick_types::*;

// Re-export stream multiplexing
#[cfg(feature = "stream")]
pub use candlewick_stream::{
    ConnectionId, Connector, MultiplexerConfig, StreamData, StreamError, StreamEvent, StreamMultiplexer,
    WsConnector,
};

// Re-export venue collaborators
#[cfg(feature = "exchange")]
pub use candlewick_exchange::{
    BinanceConfig, BinanceExchange, CandleQuery, ClientConfig, Exchange, ExchangeError, ExchangeEvent,
    Market, PairCache, RateLimitExceeded, RateLimiter, WatchHandle, fetch_candles_range,
};

// Re-export aggregation
#[cfg(feature = "aggregate")]
pub use candlewick_aggregate::{
    AggregateError, Aggregator, AggregatorConfig, AggregatorEvent, CandleStore, EmitGate, KnownCandles,
    StoreError,
};

/// Prelude module for convenient imports.
///
/// ```
/// use candlewick_lib::prelude::*;
/// ```
pub mod prelude {
    pub use candlewick_types::{Calendar, CalendarError, Candle, Decimal, Pair, Precision, Timeframe, Tz};

    #[cfg(feature = "exchange")]
    pub use candlewick_exchange::{BinanceConfig, BinanceExchange, CandleQuery, Exchange, ExchangeEvent, Market};

    #[cfg(feature = "aggregate")]
    pub use candlewick_aggregate::{Aggregator, AggregatorConfig, AggregatorEvent};
}
