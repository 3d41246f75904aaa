// =============================================================================
// Trading-session clock — IST market-hour predicates
// =============================================================================
//
// NSE cash and derivatives trade 09:15–15:30 IST. The engine stops accepting
// new entries at 15:00, moves live positions to urgent-close at 15:15, and
// force-flattens at 15:20.
//
// Every predicate takes an explicit timestamp so callers (and tests) control
// the clock; nothing in this module reads the wall clock on its own.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};

/// IST is UTC+05:30 with no daylight saving.
pub fn ist_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("IST offset is valid")
}

/// Convert a UTC instant into IST.
pub fn to_ist(ts: DateTime<Utc>) -> DateTime<FixedOffset> {
    ts.with_timezone(&ist_offset())
}

/// Market open, 09:15 IST.
pub fn market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).expect("valid time")
}

/// Market close, 15:30 IST.
pub fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).expect("valid time")
}

/// Last instant at which new entries are accepted, 15:00 IST.
pub fn entry_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).expect("valid time")
}

/// Parse an "HH:MM" string into a `NaiveTime`.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .with_context(|| format!("expected HH:MM, got '{s}'"))
}

/// True while the exchange is open (weekday between 09:15 and 15:30 IST).
/// Exchange holidays are handled upstream by the feed going silent.
pub fn is_market_open(now: DateTime<Utc>) -> bool {
    let ist = to_ist(now);
    if is_weekend(ist) {
        return false;
    }
    let t = ist.time();
    t >= market_open() && t < market_close()
}

/// True while new entry signals may be submitted (09:15–15:00 IST).
pub fn within_entry_window(now: DateTime<Utc>) -> bool {
    let ist = to_ist(now);
    if is_weekend(ist) {
        return false;
    }
    let t = ist.time();
    t >= market_open() && t < entry_cutoff()
}

/// True once the clock has crossed `boundary` (an IST wall time) today.
pub fn past_boundary(now: DateTime<Utc>, boundary: NaiveTime) -> bool {
    to_ist(now).time() >= boundary
}

fn is_weekend(ist: DateTime<FixedOffset>) -> bool {
    use chrono::Datelike;
    matches!(
        ist.weekday(),
        chrono::Weekday::Sat | chrono::Weekday::Sun
    )
}

/// Next weekly index-option expiry (Thursday) on or after the given IST
/// date.
pub fn next_weekly_expiry(from: chrono::NaiveDate) -> chrono::NaiveDate {
    use chrono::Datelike;
    let days_ahead = (chrono::Weekday::Thu.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    from + chrono::Duration::days(days_ahead)
}

/// Build a UTC instant for an IST wall-clock time on a given date. Used by
/// tests and the preload scheduler.
pub fn ist_datetime(year: i32, month: u32, day: u32, hour: u32, min: u32) -> DateTime<Utc> {
    ist_offset()
        .with_ymd_and_hms(year, month, day, hour, min, 0)
        .single()
        .expect("valid IST datetime")
        .with_timezone(&Utc)
}
