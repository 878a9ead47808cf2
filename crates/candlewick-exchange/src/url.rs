//! Binance REST and stream URL construction.

use candlewick_types::Timeframe;

/// Spot REST base URL.
pub const SPOT_REST: &str = "https://api.binance.com/api/v3";
/// USD-M futures REST base URL.
pub const USDM_REST: &str = "https://fapi.binance.com/fapi/v1";
/// COIN-M futures REST base URL.
pub const COINM_REST: &str = "https://dapi.binance.com/dapi/v1";

/// Spot combined-stream endpoint.
pub const SPOT_STREAM: &str = "wss://stream.binance.com:9443/stream";
/// USD-M futures combined-stream endpoint.
pub const USDM_STREAM: &str = "wss://fstream.binance.com/stream";
/// COIN-M futures combined-stream endpoint.
pub const COINM_STREAM: &str = "wss://dstream.binance.com/stream";

/// Futures channel reporting contract listings and status changes.
pub const CONTRACT_INFO_CHANNEL: &str = "!contractInfo";

/// Builds the `exchangeInfo` URL.
///
/// # Example
///
/// ```
/// use candlewick_exchange::url::{exchange_info_url, SPOT_REST};
///
/// assert_eq!(exchange_info_url(SPOT_REST), "https://api.binance.com/api/v3/exchangeInfo");
/// ```
#[must_use]
pub fn exchange_info_url(base: &str) -> String {
    format!("{base}/exchangeInfo")
}

/// Builds the `klines` URL for one page of bars.
///
/// URL format: `{base}/klines?symbol={SYMBOL}&interval={tf}[&startTime][&endTime][&limit]`
#[must_use]
pub fn klines_url(
    base: &str,
    symbol: &str,
    timeframe: Timeframe,
    since: Option<i64>,
    until: Option<i64>,
    limit: Option<usize>,
) -> String {
    let mut url = format!("{}/klines?symbol={}&interval={}", base, symbol.to_uppercase(), timeframe);
    if let Some(since) = since {
        url.push_str(&format!("&startTime={since}"));
    }
    if let Some(until) = until {
        url.push_str(&format!("&endTime={until}"));
    }
    if let Some(limit) = limit {
        url.push_str(&format!("&limit={limit}"));
    }
    url
}

/// Builds the kline channel name for a symbol.
///
/// # Example
///
/// ```
/// use candlewick_exchange::url::kline_channel;
/// use candlewick_types::Timeframe;
///
/// assert_eq!(kline_channel("BTCUSDT", Timeframe::MINUTE), "btcusdt@kline_1m");
/// ```
#[must_use]
pub fn kline_channel(symbol: &str, timeframe: Timeframe) -> String {
    format!("{}@kline_{}", symbol.to_lowercase(), timeframe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_klines_url_range() {
        let url = klines_url(USDM_REST, "btcusdt", Timeframe::MINUTE, Some(600_000), Some(719_999), Some(1500));
        assert_eq!(
            url,
            "https://fapi.binance.com/fapi/v1/klines?symbol=BTCUSDT&interval=1m&startTime=600000&endTime=719999&limit=1500"
        );
    }

    #[test]
    fn test_klines_url_latest() {
        let url = klines_url(SPOT_REST, "ETHUSDT", Timeframe::MONTH, None, None, Some(1));
        assert_eq!(url, "https://api.binance.com/api/v3/klines?symbol=ETHUSDT&interval=1M&limit=1");
    }

    #[test]
    fn test_kline_channel() {
        assert_eq!(kline_channel("ETHUSDT", "4h".parse().unwrap()), "ethusdt@kline_4h");
    }
}
