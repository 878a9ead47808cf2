//! Paged historical bar fetching.

use candlewick_types::{Candle, Timeframe, ensure_continuous};
use tracing::debug;

use crate::{CandleQuery, Exchange, ExchangeError};

/// Fetches every bar of `timeframe` opening within `[since, until]`.
///
/// Pages forward from `since` until the last fetched bar closes at or after
/// `until`, or the venue returns an empty page.
///
/// # Errors
///
/// Returns an error if a request fails, or [`ExchangeError::Validation`] if
/// the fetched bars are not continuous.
pub async fn fetch_candles_range<E>(
    exchange: &E,
    symbol: &str,
    timeframe: Timeframe,
    since: i64,
    until: i64,
) -> Result<Vec<Candle>, ExchangeError>
where
    E: Exchange + ?Sized,
{
    let limit = exchange.max_candles_per_request();
    let mut candles: Vec<Candle> = Vec::new();
    let mut cursor = since;
    let mut pages = 0usize;

    while cursor <= until {
        let page = exchange
            .candles(symbol, timeframe, CandleQuery::range(cursor, until).with_limit(limit))
            .await?;
        pages += 1;

        let Some(last) = page.last().copied() else {
            break;
        };

        candles.extend(page.into_iter().filter(|c| c.open_time >= cursor && c.open_time <= until));

        if last.close_time >= until || last.close_time < cursor {
            break;
        }
        cursor = last.close_time + 1;
    }

    ensure_continuous(&candles).map_err(|gap| {
        ExchangeError::Validation(format!(
            "{symbol} {timeframe} history is not continuous: expected open {} but got {}",
            gap.expected, gap.actual
        ))
    })?;

    debug!(symbol, %timeframe, since, until, pages, candles = candles.len(), "fetched history");
    Ok(candles)
}
