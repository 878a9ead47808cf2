//! Calendar-aware bar boundary math.
//!
//! Boundaries of `s` and `m` timeframes are fixed-length steps measured in
//! the local time of the configured timezone. Boundaries of `h`, `d`, `w`,
//! `M` and `y` timeframes are computed on the local wall clock and converted
//! back to UTC, so they follow leap years, variable month lengths and DST
//! days. An hour bar that spans a DST change is one hour longer or shorter,
//! and a repeated local hour belongs to the bar that opened first.

use chrono::{
    DateTime, Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone,
    Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use std::collections::BTreeMap;

use crate::{CalendarError, TimeUnit, Timeframe};

/// Number of 15 minute steps tried when a local midnight falls into a DST gap.
const DST_GAP_STEPS: u32 = 8;

/// Timezone, week start and anchors used to derive bar boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calendar {
    timezone: Tz,
    week_start: Weekday,
    anchors: BTreeMap<Timeframe, i64>,
}

impl Default for Calendar {
    fn default() -> Self {
        Self::utc()
    }
}

impl Calendar {
    /// Creates a calendar for `timezone` with weeks starting on Monday.
    #[must_use]
    pub const fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            week_start: Weekday::Mon,
            anchors: BTreeMap::new(),
        }
    }

    /// Creates a UTC calendar.
    #[must_use]
    pub const fn utc() -> Self {
        Self::new(Tz::UTC)
    }

    /// Parses an IANA timezone name such as `UTC` or `Europe/Berlin`.
    ///
    /// # Errors
    ///
    /// Returns [`CalendarError::UnknownTimezone`] if the name is not known.
    pub fn parse_timezone(name: &str) -> Result<Tz, CalendarError> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("utc") || name == "Z" {
            return Ok(Tz::UTC);
        }
        name.parse::<Tz>().map_err(|_| CalendarError::UnknownTimezone(name.to_string()))
    }

    /// Sets the weekday on which `w` bars open.
    #[must_use]
    pub const fn with_week_start(mut self, week_start: Weekday) -> Self {
        self.week_start = week_start;
        self
    }

    /// Sets the anchor instant for a timeframe.
    #[must_use]
    pub fn with_anchor(mut self, timeframe: Timeframe, base_time: i64) -> Self {
        self.set_anchor(timeframe, base_time);
        self
    }

    /// Sets the anchor instant for a timeframe, replacing any previous one.
    pub fn set_anchor(&mut self, timeframe: Timeframe, base_time: i64) {
        self.anchors.insert(timeframe, base_time);
    }

    /// Returns the anchor instant of a timeframe, if one is set.
    #[must_use]
    pub fn anchor(&self, timeframe: Timeframe) -> Option<i64> {
        self.anchors.get(&timeframe).copied()
    }

    /// Returns the timezone boundaries are computed in.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Returns the weekday on which `w` bars open.
    #[must_use]
    pub const fn week_start(&self) -> Weekday {
        self.week_start
    }

    /// Returns the open time of the bar of `timeframe` that contains `ts`.
    ///
    /// # Errors
    ///
    /// Returns [`CalendarError::MissingBaseTime`] if the timeframe needs an
    /// anchor and none is set, or [`CalendarError::InvalidTimestamp`] if the
    /// instant is out of range.
    pub fn open_time(&self, timeframe: Timeframe, ts: i64) -> Result<i64, CalendarError> {
        boundary(self.timezone, self.week_start, timeframe, ts, self.anchor(timeframe))
    }

    /// Returns the close time (inclusive) of the bar opening at `open_time`.
    ///
    /// # Errors
    ///
    /// Returns an error if the instant is out of range.
    pub fn close_time(&self, timeframe: Timeframe, open_time: i64) -> Result<i64, CalendarError> {
        bar_close(self.timezone, timeframe, open_time, self.anchor(timeframe))
    }

    /// Returns the length in milliseconds of the bar opening at `open_time`.
    ///
    /// # Errors
    ///
    /// Returns an error if the instant is out of range.
    pub fn duration(&self, timeframe: Timeframe, open_time: i64) -> Result<i64, CalendarError> {
        Ok(self.close_time(timeframe, open_time)? - open_time + 1)
    }

    /// Returns `(open_time, close_time)` of the bar that contains `ts`.
    ///
    /// # Errors
    ///
    /// See [`Calendar::open_time`].
    pub fn candle_times(&self, timeframe: Timeframe, ts: i64) -> Result<(i64, i64), CalendarError> {
        let open = self.open_time(timeframe, ts)?;
        Ok((open, self.close_time(timeframe, open)?))
    }

    /// Returns true if `ts` is exactly the open time of a bar.
    ///
    /// # Errors
    ///
    /// See [`Calendar::open_time`].
    pub fn is_open_time(&self, timeframe: Timeframe, ts: i64) -> Result<bool, CalendarError> {
        Ok(self.open_time(timeframe, ts)? == ts)
    }
}

/// Returns the open time of the bar of `timeframe` that contains `from`.
///
/// Weeks start on Monday. `base_time` is only consulted for timeframes whose
/// boundaries depend on an anchor (see [`Timeframe::requires_anchor`]); any
/// anchor congruent to it modulo `value` units yields the same boundaries.
///
/// # Errors
///
/// Returns [`CalendarError::MissingBaseTime`] when an anchor is needed but
/// `base_time` is `None`.
pub fn open_time(
    timeframe: Timeframe,
    from: i64,
    timezone: Tz,
    base_time: Option<i64>,
) -> Result<i64, CalendarError> {
    boundary(timezone, Weekday::Mon, timeframe, from, base_time)
}

/// Returns the inclusive close time of the bar opening at `open_time`.
///
/// Anchored hour timeframes are measured from the local hour of
/// `open_time`; use [`Calendar::close_time`] to honor the anchor when the
/// bar opens inside a DST gap.
///
/// # Errors
///
/// Returns an error if the instant is out of range.
pub fn close_time(timeframe: Timeframe, open_time: i64, timezone: Tz) -> Result<i64, CalendarError> {
    bar_close(timezone, timeframe, open_time, None)
}

/// Returns the length in milliseconds of the bar opening at `open_time`.
///
/// # Errors
///
/// Returns an error if the instant is out of range.
pub fn duration(timeframe: Timeframe, open_time: i64, timezone: Tz) -> Result<i64, CalendarError> {
    Ok(close_time(timeframe, open_time, timezone)? - open_time + 1)
}

/// Returns `(open_time, close_time)` of the bar that contains `ts`.
///
/// # Errors
///
/// See [`open_time`].
pub fn candle_times(
    timeframe: Timeframe,
    ts: i64,
    timezone: Tz,
    base_time: Option<i64>,
) -> Result<(i64, i64), CalendarError> {
    let open = open_time(timeframe, ts, timezone, base_time)?;
    Ok((open, bar_close(timezone, timeframe, open, base_time)?))
}

/// Returns true if `ts` is exactly the open time of a bar.
///
/// # Errors
///
/// See [`open_time`].
pub fn is_open_time(
    timeframe: Timeframe,
    ts: i64,
    timezone: Tz,
    base_time: Option<i64>,
) -> Result<bool, CalendarError> {
    Ok(open_time(timeframe, ts, timezone, base_time)? == ts)
}

fn boundary(
    timezone: Tz,
    week_start: Weekday,
    timeframe: Timeframe,
    from: i64,
    base_time: Option<i64>,
) -> Result<i64, CalendarError> {
    let value = timeframe.value();
    let unit = timeframe.unit();

    if unit == TimeUnit::Hour {
        let start = hour_start(timezone, timeframe, to_local(from, timezone)?, base_time, from)?;
        return from_local(start, timezone);
    }

    if let Some(unit_ms) = unit.fixed_millis() {
        if !timeframe.requires_anchor() {
            // The local epoch is a whole number of parent cycles away from
            // every local midnight, so the remainder is the field offset.
            let local = from + offset_millis(from, timezone)?;
            return Ok(from - local.rem_euclid(unit_ms * i64::from(value)));
        }

        let base = base_time.ok_or(CalendarError::MissingBaseTime(timeframe))?;
        let from_start = from - (from + offset_millis(from, timezone)?).rem_euclid(unit_ms);
        let base_start = base - (base + offset_millis(base, timezone)?).rem_euclid(unit_ms);
        let units = (from_start - base_start).div_euclid(unit_ms);
        let steps = units.div_euclid(i64::from(value)) * i64::from(value);
        return Ok(base_start + steps * unit_ms);
    }

    let from_local = truncate(to_local(from, timezone)?.date(), unit, week_start);
    if value == 1 {
        return from_local_date(from_local, timezone, from);
    }

    let base = base_time.ok_or(CalendarError::MissingBaseTime(timeframe))?;
    let base_local = truncate(to_local(base, timezone)?.date(), unit, week_start);

    let units = match unit {
        TimeUnit::Day => (from_local - base_local).num_days(),
        TimeUnit::Week => (from_local - base_local).num_days() / 7,
        TimeUnit::Month => month_index(from_local) - month_index(base_local),
        _ => i64::from(from_local.year() - base_local.year()),
    };
    let steps = units.div_euclid(i64::from(value)) * i64::from(value);

    let start = match unit {
        TimeUnit::Day => base_local.checked_add_signed(TimeDelta::days(steps)),
        TimeUnit::Week => base_local.checked_add_signed(TimeDelta::days(steps * 7)),
        TimeUnit::Month => add_months(base_local, steps),
        _ => add_months(base_local, steps * 12),
    }
    .ok_or(CalendarError::InvalidTimestamp(from))?;

    from_local_date(start, timezone, from)
}

fn bar_close(
    timezone: Tz,
    timeframe: Timeframe,
    open_time: i64,
    base_time: Option<i64>,
) -> Result<i64, CalendarError> {
    let value = i64::from(timeframe.value());

    if timeframe.unit() == TimeUnit::Hour {
        let local = to_local(open_time, timezone)?;
        let start = if timeframe.requires_anchor() && base_time.is_none() {
            floor_hour(local, open_time)?
        } else {
            hour_start(timezone, timeframe, local, base_time, open_time)?
        };
        let next = start
            .checked_add_signed(TimeDelta::hours(value))
            .ok_or(CalendarError::InvalidTimestamp(open_time))?;
        return Ok(from_local(next, timezone)? - 1);
    }

    if let Some(len) = timeframe.fixed_millis() {
        return Ok(open_time + len - 1);
    }

    let local = to_local(open_time, timezone)?.date().and_time(NaiveTime::MIN);
    let next = match timeframe.unit() {
        TimeUnit::Day => shift_days(local, value),
        TimeUnit::Week => shift_days(local, value * 7),
        TimeUnit::Month => shift_months(local, value),
        _ => shift_months(local, value * 12),
    }
    .ok_or(CalendarError::InvalidTimestamp(open_time))?;

    Ok(from_local(next, timezone)? - 1)
}

/// Returns the local wall-clock start of the hour bar containing `local`.
fn hour_start(
    timezone: Tz,
    timeframe: Timeframe,
    local: NaiveDateTime,
    base_time: Option<i64>,
    ts: i64,
) -> Result<NaiveDateTime, CalendarError> {
    let value = i64::from(timeframe.value());
    let hour = floor_hour(local, ts)?;

    if !timeframe.requires_anchor() {
        let back = i64::from(hour.hour()) % value;
        return hour
            .checked_sub_signed(TimeDelta::hours(back))
            .ok_or(CalendarError::InvalidTimestamp(ts));
    }

    let base = base_time.ok_or(CalendarError::MissingBaseTime(timeframe))?;
    let origin = floor_hour(to_local(base, timezone)?, base)?;
    let steps = (hour - origin).num_hours().div_euclid(value) * value;
    origin.checked_add_signed(TimeDelta::hours(steps)).ok_or(CalendarError::InvalidTimestamp(ts))
}

fn floor_hour(local: NaiveDateTime, ts: i64) -> Result<NaiveDateTime, CalendarError> {
    NaiveTime::from_hms_opt(local.hour(), 0, 0)
        .map(|time| local.date().and_time(time))
        .ok_or(CalendarError::InvalidTimestamp(ts))
}

/// Truncates a local date to the first day of its `unit`.
fn truncate(date: NaiveDate, unit: TimeUnit, week_start: Weekday) -> NaiveDate {
    match unit {
        TimeUnit::Week => {
            let back = (date.weekday().num_days_from_monday() + 7
                - week_start.num_days_from_monday())
                % 7;
            date - TimeDelta::days(i64::from(back))
        }
        TimeUnit::Month => date.with_day(1).unwrap_or(date),
        TimeUnit::Year => date.with_ordinal(1).unwrap_or(date),
        _ => date,
    }
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 { date.checked_add_months(magnitude) } else { date.checked_sub_months(magnitude) }
}

fn shift_days(local: NaiveDateTime, days: i64) -> Option<NaiveDateTime> {
    local.checked_add_signed(TimeDelta::days(days))
}

fn shift_months(local: NaiveDateTime, months: i64) -> Option<NaiveDateTime> {
    add_months(local.date(), months).map(|date| date.and_time(local.time()))
}

fn to_local(ts: i64, timezone: Tz) -> Result<NaiveDateTime, CalendarError> {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|utc| utc.with_timezone(&timezone).naive_local())
        .ok_or(CalendarError::InvalidTimestamp(ts))
}

fn offset_millis(ts: i64, timezone: Tz) -> Result<i64, CalendarError> {
    let utc = DateTime::<Utc>::from_timestamp_millis(ts).ok_or(CalendarError::InvalidTimestamp(ts))?;
    let offset = timezone.offset_from_utc_datetime(&utc.naive_utc()).fix();
    Ok(i64::from(offset.local_minus_utc()) * 1_000)
}

fn from_local_date(date: NaiveDate, timezone: Tz, ts: i64) -> Result<i64, CalendarError> {
    from_local(date.and_time(NaiveTime::MIN), timezone).map_err(|e| match e {
        CalendarError::InvalidTimestamp(_) => CalendarError::InvalidTimestamp(ts),
        other => other,
    })
}

/// Converts a local wall-clock time to UTC milliseconds.
///
/// Ambiguous times resolve to the earliest instant. Times inside a DST gap
/// resolve to the first valid instant after the gap.
fn from_local(local: NaiveDateTime, timezone: Tz) -> Result<i64, CalendarError> {
    let mut candidate = local;
    for _ in 0..=DST_GAP_STEPS {
        if let Some(dt) = timezone.from_local_datetime(&candidate).earliest() {
            return Ok(dt.timestamp_millis());
        }
        let Some(next) = candidate.checked_add_signed(TimeDelta::minutes(15)) else {
            break;
        };
        candidate = next;
    }

    Err(CalendarError::NonexistentLocalTime(local.to_string(), timezone.name().to_string()))
}
