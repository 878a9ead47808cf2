//! Watch command implementation.
//!
//! Runs the aggregator against a Binance market and prints derived bars until
//! interrupted.

use anyhow::{Context, Result, bail};
use candlewick_lib::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::display::{Format, render_candle};

/// Parses and validates the requested timeframes for `market`.
pub(crate) fn parse_timeframes(market: Market, timeframes: &[String]) -> Result<Vec<Timeframe>> {
    let mut parsed = Vec::with_capacity(timeframes.len());
    for raw in timeframes {
        let timeframe: Timeframe = raw.trim().parse().with_context(|| format!("Invalid timeframe: {raw}"))?;
        if !market.supports(timeframe) {
            bail!("{market} does not serve {timeframe} bars");
        }
        parsed.push(timeframe);
    }
    if parsed.is_empty() {
        bail!("At least one timeframe is required");
    }
    Ok(parsed)
}

/// Aggregate live bars and print them.
pub(crate) async fn watch(
    market: &str,
    symbols: Vec<String>,
    timeframes: &[String],
    init_concurrency: usize,
    closed_only: bool,
    format: Format,
) -> Result<()> {
    let market: Market = market.parse().with_context(|| format!("Unknown market: {market}"))?;
    let timeframes = parse_timeframes(market, timeframes)?;

    let exchange = Arc::new(BinanceExchange::new(BinanceConfig::new(market)).context("Failed to create exchange")?);

    let mut config = AggregatorConfig::default()
        .with_timeframes(timeframes)
        .with_init_concurrency(init_concurrency);
    if !symbols.is_empty() {
        config = config.with_symbols(symbols.iter().map(|s| s.to_uppercase()));
    }

    let (aggregator, mut events) = Aggregator::new(Arc::clone(&exchange), config);
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(aggregator.run(shutdown.clone()));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            ctrl_c.cancel();
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            AggregatorEvent::Candle { pair, timeframe, candle, is_close } => {
                if is_close || !closed_only {
                    println!("{}", render_candle(format, &pair.symbol, timeframe, &candle, is_close));
                }
            }
            AggregatorEvent::Started => info!(%market, "streaming"),
            AggregatorEvent::PairInit { pair, trigger } => {
                info!(symbol = %pair.symbol, trigger = trigger.open_time, "backfilling");
            }
            AggregatorEvent::PairInitialized(pair) => info!(symbol = %pair.symbol, "live"),
            AggregatorEvent::SymbolFailed { symbol, error } => warn!(%symbol, %error, "symbol restarted"),
            _ => {}
        }
    }

    let outcome = run.await.context("Aggregator task panicked")?;
    exchange.close().await;
    outcome.context("Aggregation failed")
}
