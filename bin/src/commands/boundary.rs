//! Boundary command implementation.

use anyhow::{Context, Result, bail};
use candlewick_lib::prelude::*;
use chrono::{DateTime, Utc};

use crate::display::format_millis;

/// Parses unix milliseconds, an RFC 3339 instant or `now`.
pub(crate) fn parse_timestamp(raw: &str) -> Result<i64> {
    if raw.eq_ignore_ascii_case("now") {
        return Ok(Utc::now().timestamp_millis());
    }
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Ok(dt.timestamp_millis()),
        Err(_) => bail!("Invalid timestamp: {raw} (expected unix milliseconds, RFC 3339 or \"now\")"),
    }
}

/// Print the bar of `timeframe` that contains `timestamp`.
pub(crate) fn boundary(timeframe: &str, timestamp: &str, timezone: &str, base_time: Option<i64>) -> Result<()> {
    let timeframe: Timeframe = timeframe.parse().with_context(|| format!("Invalid timeframe: {timeframe}"))?;
    let ts = parse_timestamp(timestamp)?;
    let timezone = Calendar::parse_timezone(timezone)?;

    let mut calendar = Calendar::new(timezone);
    if let Some(base_time) = base_time {
        calendar.set_anchor(timeframe, base_time);
    }

    let (open, close) = calendar
        .candle_times(timeframe, ts)
        .with_context(|| format!("Cannot place {timeframe} bar around {ts}"))?;

    println!("Timeframe: {timeframe}");
    println!("Timezone:  {timezone}");
    println!("Instant:   {} ({ts})", format_millis(ts));
    println!("Open:      {} ({open})", format_millis(open));
    println!("Close:     {} ({close})", format_millis(close));
    println!("Duration:  {} ms", close - open + 1);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1704067200000").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_timestamp("2024-01-01T01:00:00+01:00").unwrap(), 1_704_067_200_000);
        assert!(parse_timestamp("NOW").unwrap() > 1_704_067_200_000);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_boundary_requires_anchor() {
        assert!(boundary("3d", "0", "UTC", None).is_err());
        assert!(boundary("3d", "0", "UTC", Some(0)).is_ok());
        assert!(boundary("1h", "now", "Mars/Olympus", None).is_err());
    }
}
