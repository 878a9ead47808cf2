//! Binance payload decoding.
//!
//! REST klines arrive as positional arrays of mixed numbers and decimal
//! strings; stream payloads are JSON objects keyed by single letters.

use candlewick_types::{Candle, Decimal, Pair, Precision, Timeframe};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::{ExchangeError, Market};

static NULL: Value = Value::Null;

/// Decoded `exchangeInfo` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExchangeInfo {
    pub(crate) timezone: String,
    #[serde(default)]
    pub(crate) rate_limits: Vec<RateLimitInfo>,
    #[serde(default)]
    pub(crate) symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RateLimitInfo {
    rate_limit_type: String,
    interval: String,
    interval_num: u32,
    limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SymbolInfo {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_status: Option<String>,
    #[serde(default)]
    price_precision: Option<u32>,
    #[serde(default)]
    quantity_precision: Option<u32>,
    #[serde(default)]
    filters: Vec<Value>,
}

impl SymbolInfo {
    fn is_active(&self, market: Market) -> bool {
        let status = match market {
            Market::CoinM => self.contract_status.as_deref(),
            Market::Spot | Market::UsdM => self.status.as_deref(),
        };
        status == Some("TRADING")
    }

    fn precision(&self, market: Market) -> Result<Precision, ExchangeError> {
        match market {
            Market::Spot => {
                let price = self.filter_value("PRICE_FILTER", "minPrice")?;
                let quantity = self.filter_value("LOT_SIZE", "minQty")?;
                Ok(Precision::new(fraction_digits(price), fraction_digits(quantity)))
            }
            Market::UsdM | Market::CoinM => match (self.price_precision, self.quantity_precision) {
                (Some(price), Some(quantity)) => Ok(Precision::new(price, quantity)),
                _ => Err(ExchangeError::Parse(format!("{} has no precision fields", self.symbol))),
            },
        }
    }

    fn filter_value(&self, filter_type: &str, key: &str) -> Result<&str, ExchangeError> {
        self.filters
            .iter()
            .find(|filter| filter.get("filterType").and_then(Value::as_str) == Some(filter_type))
            .and_then(|filter| filter.get(key))
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Parse(format!("{} has no {filter_type}.{key}", self.symbol)))
    }

    pub(crate) fn to_pair(&self, market: Market) -> Result<Pair, ExchangeError> {
        Ok(Pair::new(&self.symbol, &self.base_asset, &self.quote_asset, self.precision(market)?)
            .with_active(self.is_active(market)))
    }
}

impl ExchangeInfo {
    /// Converts every listed symbol to a [`Pair`].
    pub(crate) fn pairs(&self, market: Market) -> Result<Vec<Pair>, ExchangeError> {
        self.symbols.iter().map(|symbol| symbol.to_pair(market)).collect()
    }

    /// Returns the `REQUEST_WEIGHT` limit converted to weight per second,
    /// floored and at least one.
    pub(crate) fn weight_per_second(&self) -> Result<u32, ExchangeError> {
        let info = self
            .rate_limits
            .iter()
            .find(|limit| limit.rate_limit_type == "REQUEST_WEIGHT")
            .ok_or_else(|| ExchangeError::Parse("exchangeInfo has no REQUEST_WEIGHT limit".into()))?;

        let seconds = match info.interval.as_str() {
            "SECOND" => 1,
            "MINUTE" => 60,
            "HOUR" => 3_600,
            "DAY" => 86_400,
            other => return Err(ExchangeError::Parse(format!("unknown rate limit interval {other}"))),
        };
        let window = u64::from(info.interval_num.max(1)) * seconds;
        let per_second = u64::from(info.limit) / window;
        Ok(u32::try_from(per_second).unwrap_or(u32::MAX).max(1))
    }
}

/// Number of fraction digits in a decimal string, ignoring trailing zeros.
fn fraction_digits(value: &str) -> u32 {
    value
        .split_once('.')
        .map_or(0, |(_, fraction)| fraction.trim_end_matches('0').len() as u32)
}

fn decimal(value: &Value, field: &str) -> Result<Decimal, ExchangeError> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Number(number) => return Decimal::from_str(&number.to_string()).map_err(|e| bad_field(field, e)),
        _ => return Err(ExchangeError::Parse(format!("{field} is not a decimal"))),
    };
    Decimal::from_str(text).map_err(|e| bad_field(field, e))
}

fn millis(value: &Value, field: &str) -> Result<i64, ExchangeError> {
    value
        .as_i64()
        .ok_or_else(|| ExchangeError::Parse(format!("{field} is not a millisecond timestamp")))
}

fn bad_field(field: &str, error: impl std::fmt::Display) -> ExchangeError {
    ExchangeError::Parse(format!("{field}: {error}"))
}

/// Parses one REST kline tuple.
///
/// Layout: `[open time, open, high, low, close, volume, close time, ...]`.
pub(crate) fn parse_kline_row(row: &[Value]) -> Result<Candle, ExchangeError> {
    if row.len() < 7 {
        return Err(ExchangeError::Parse(format!("kline row has {} fields, expected at least 7", row.len())));
    }
    Ok(Candle::new(
        millis(&row[0], "open time")?,
        millis(&row[6], "close time")?,
        decimal(&row[1], "open")?,
        decimal(&row[2], "high")?,
        decimal(&row[3], "low")?,
        decimal(&row[4], "close")?,
        decimal(&row[5], "volume")?,
    ))
}

/// Parses a REST klines response, oldest first.
pub(crate) fn parse_klines(rows: &[Vec<Value>]) -> Result<Vec<Candle>, ExchangeError> {
    rows.iter().map(|row| parse_kline_row(row)).collect()
}

/// A decoded combined-stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamPayload {
    /// A kline update.
    Kline {
        symbol: String,
        timeframe: Timeframe,
        candle: Candle,
        is_close: bool,
    },
    /// A futures contract changed status.
    ContractInfo { symbol: String },
    /// Anything else.
    Other,
}

/// Decodes the `data` object of a combined-stream frame.
pub(crate) fn parse_stream_payload(data: &Value) -> Result<StreamPayload, ExchangeError> {
    match data.get("e").and_then(Value::as_str) {
        Some("kline") => parse_kline_event(data),
        Some("contractInfo") => {
            let symbol = data
                .get("s")
                .and_then(Value::as_str)
                .ok_or_else(|| ExchangeError::Parse("contractInfo event has no symbol".into()))?;
            Ok(StreamPayload::ContractInfo { symbol: symbol.to_string() })
        }
        _ => Ok(StreamPayload::Other),
    }
}

fn parse_kline_event(data: &Value) -> Result<StreamPayload, ExchangeError> {
    let symbol = data
        .get("s")
        .and_then(Value::as_str)
        .ok_or_else(|| ExchangeError::Parse("kline event has no symbol".into()))?;
    let k = data
        .get("k")
        .ok_or_else(|| ExchangeError::Parse("kline event has no payload".into()))?;

    let interval = k.get("i").and_then(Value::as_str).unwrap_or_default();
    let timeframe = interval
        .parse::<Timeframe>()
        .map_err(|e| ExchangeError::Parse(e.to_string()))?;

    let field = |key: &str| k.get(key).unwrap_or(&NULL);
    let candle = Candle::new(
        millis(field("t"), "open time")?,
        millis(field("T"), "close time")?,
        decimal(field("o"), "open")?,
        decimal(field("h"), "high")?,
        decimal(field("l"), "low")?,
        decimal(field("c"), "close")?,
        decimal(field("v"), "volume")?,
    );
    let is_close = field("x").as_bool().unwrap_or(false);

    Ok(StreamPayload::Kline { symbol: symbol.to_string(), timeframe, candle, is_close })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn spot_info() -> ExchangeInfo {
        serde_json::from_value(json!({
            "timezone": "UTC",
            "serverTime": 1_700_000_000_000_i64,
            "rateLimits": [
                {"rateLimitType": "REQUEST_WEIGHT", "interval": "MINUTE", "intervalNum": 1, "limit": 6000},
                {"rateLimitType": "ORDERS", "interval": "SECOND", "intervalNum": 10, "limit": 100}
            ],
            "symbols": [{
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "baseAsset": "BTC",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01000000", "maxPrice": "1000000.00000000"},
                    {"filterType": "LOT_SIZE", "minQty": "0.00001000", "maxQty": "9000.00000000"}
                ]
            }, {
                "symbol": "LUNAUSDT",
                "status": "BREAK",
                "baseAsset": "LUNA",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "1.00000000"},
                    {"filterType": "LOT_SIZE", "minQty": "1.00000000"}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_spot_pairs() {
        let pairs = spot_info().pairs(Market::Spot).unwrap();
        assert_eq!(pairs[0], Pair::new("BTCUSDT", "BTC", "USDT", Precision::new(2, 5)));
        assert!(!pairs[1].is_active);
        assert_eq!(pairs[1].precision, Precision::new(0, 0));
    }

    #[test]
    fn test_coinm_uses_contract_status() {
        let info: ExchangeInfo = serde_json::from_value(json!({
            "timezone": "UTC",
            "rateLimits": [{"rateLimitType": "REQUEST_WEIGHT", "interval": "MINUTE", "intervalNum": 1, "limit": 2400}],
            "symbols": [{
                "symbol": "BTCUSD_PERP",
                "contractStatus": "TRADING",
                "baseAsset": "BTC",
                "quoteAsset": "USD",
                "pricePrecision": 1,
                "quantityPrecision": 0
            }]
        }))
        .unwrap();

        let pair = &info.pairs(Market::CoinM).unwrap()[0];
        assert!(pair.is_active);
        assert_eq!(pair.precision, Precision::new(1, 0));
        assert!(!info.pairs(Market::UsdM).unwrap()[0].is_active);
    }

    #[test]
    fn test_weight_per_second() {
        assert_eq!(spot_info().weight_per_second().unwrap(), 100);

        let info: ExchangeInfo = serde_json::from_value(json!({
            "timezone": "UTC",
            "rateLimits": [{"rateLimitType": "REQUEST_WEIGHT", "interval": "MINUTE", "intervalNum": 1, "limit": 2400}]
        }))
        .unwrap();
        assert_eq!(info.weight_per_second().unwrap(), 40);
    }

    #[test]
    fn test_fraction_digits() {
        assert_eq!(fraction_digits("0.01000000"), 2);
        assert_eq!(fraction_digits("1.00000000"), 0);
        assert_eq!(fraction_digits("10"), 0);
        assert_eq!(fraction_digits("0.00000001"), 8);
    }

    #[test]
    fn test_parse_kline_row() {
        let rows: Vec<Vec<Value>> = serde_json::from_str(
            r#"[[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100","148976.11427815",1499644799999,"2434.19055334",308,"1756.87402397","28.46694368","0"]]"#,
        )
        .unwrap();

        let candles = parse_klines(&rows).unwrap();
        assert_eq!(candles.len(), 1);
        let candle = candles[0];
        assert_eq!(candle.open_time, 1_499_040_000_000);
        assert_eq!(candle.close_time, 1_499_644_799_999);
        assert_eq!(candle.open, dec!(0.01634790));
        assert_eq!(candle.high, dec!(0.8));
        assert_eq!(candle.volume, dec!(148976.11427815));
    }

    #[test]
    fn test_short_kline_row_is_rejected() {
        let row = vec![json!(1), json!("1")];
        assert!(matches!(parse_kline_row(&row), Err(ExchangeError::Parse(_))));
    }

    #[test]
    fn test_parse_kline_event() {
        let data = json!({
            "e": "kline",
            "E": 1_672_515_782_136_i64,
            "s": "BNBBTC",
            "k": {
                "t": 60_000, "T": 119_999, "s": "BNBBTC", "i": "1m",
                "o": "0.0010", "c": "0.0020", "h": "0.0025", "l": "0.0015",
                "v": "1000", "x": true
            }
        });

        let payload = parse_stream_payload(&data).unwrap();
        assert_eq!(
            payload,
            StreamPayload::Kline {
                symbol: "BNBBTC".into(),
                timeframe: Timeframe::MINUTE,
                candle: Candle::new(60_000, 119_999, dec!(0.0010), dec!(0.0025), dec!(0.0015), dec!(0.0020), dec!(1000)),
                is_close: true,
            }
        );
    }

    #[test]
    fn test_parse_contract_info_event() {
        let data = json!({"e": "contractInfo", "E": 1, "s": "BTCUSDT", "ps": "BTCUSDT", "ct": "PERPETUAL", "cs": "TRADING"});
        assert_eq!(
            parse_stream_payload(&data).unwrap(),
            StreamPayload::ContractInfo { symbol: "BTCUSDT".into() }
        );
        assert_eq!(parse_stream_payload(&json!({"e": "aggTrade"})).unwrap(), StreamPayload::Other);
    }
}
