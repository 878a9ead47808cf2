//! Output formatting for the candlewick CLI.

use candlewick_lib::prelude::*;
use chrono::{DateTime, SecondsFormat};
use clap::ValueEnum;

/// Output format for emitted bars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Format {
    Text,
    Json,
}

/// Formats a millisecond timestamp as an RFC 3339 UTC instant.
pub(crate) fn format_millis(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map_or_else(|| ms.to_string(), |dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Renders one bar.
pub(crate) fn render_candle(
    format: Format,
    symbol: &str,
    timeframe: Timeframe,
    candle: &Candle,
    is_close: bool,
) -> String {
    match format {
        Format::Text => format!(
            "{} {symbol:<12} {:>4} o={} h={} l={} c={} v={}{}",
            format_millis(candle.open_time),
            timeframe.to_string(),
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume,
            if is_close { " closed" } else { "" },
        ),
        Format::Json => serde_json::json!({
            "symbol": symbol,
            "timeframe": timeframe,
            "isClose": is_close,
            "candle": candle,
        })
        .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_millis(1_704_067_200_123), "2024-01-01T00:00:00.123Z");
    }

    #[test]
    fn test_render_text() {
        let candle = Candle::new(0, 59_999, Decimal::ONE, Decimal::TWO, Decimal::ONE, Decimal::TWO, Decimal::TEN);
        let line = render_candle(Format::Text, "BTCUSDT", Timeframe::MINUTE, &candle, true);
        assert_eq!(line, "1970-01-01T00:00:00.000Z BTCUSDT        1m o=1 h=2 l=1 c=2 v=10 closed");
    }

    #[test]
    fn test_render_json() {
        let candle = Candle::flat(0, 59_999, Decimal::ONE);
        let line = render_candle(Format::Json, "BTCUSDT", Timeframe::MINUTE, &candle, false);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["symbol"], "BTCUSDT");
        assert_eq!(value["timeframe"], "1m");
        assert_eq!(value["isClose"], false);
    }
}
