//! Refresh timing
//!
//! The control loop wakes far more often than prices change. A cycle does
//! real work only when the local time has crossed the next check-hour
//! boundary and the persisted fetch timestamp predates it, or when no
//! usable timestamp exists at all. Each install also gets a deterministic
//! stagger minute so a fleet of controllers does not hit the price API in
//! the same second.

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use sha2::{Digest, Sha256};

use crate::tariff::floor_offset_to_hours;

/// Stagger minutes fall in 0..=45, leaving the tail of the check hour free
/// for retries.
const STAGGER_WINDOW_MINUTES: u16 = 46;

/// Last hour of the current planning window.
///
/// Daily planning checks at 23:00 (day-ahead prices are out by then);
/// forecast-driven planning re-checks at the end of every period.
pub fn next_check_hour(local_hour: u8, period_hours: u8, forecast_driven: bool) -> u8 {
    let window = if forecast_driven && period_hours > 0 {
        u32::from(period_hours)
    } else {
        24
    };
    let hour = (u32::from(local_hour) + 1)
        .div_ceil(window)
        .saturating_mul(window)
        .saturating_sub(1);
    hour.min(23) as u8
}

/// Whether a cycle should fetch fresh data now.
///
/// True when we are inside the check hour (past the stagger minute) and the
/// stored timestamp was not already taken in it, or when the timestamp is
/// missing or older than yesterday.
pub fn needs_refresh(
    now_epoch: i64,
    last_fetch_epoch: Option<i64>,
    utc_offset_secs: i32,
    stagger_minute: u8,
    period_hours: u8,
    forecast_driven: bool,
) -> bool {
    let Some(now) = local(now_epoch, utc_offset_secs) else {
        return false;
    };
    let Some(last) = last_fetch_epoch.and_then(|ts| local(ts, utc_offset_secs)) else {
        return true;
    };

    let check_hour = next_check_hour(now.hour() as u8, period_hours, forecast_driven);
    let today = now.date_naive();
    let yesterday = today.pred_opt().unwrap_or(today);
    let last_day = last.date_naive();

    let fetched_in_check_window =
        last_day == today && last.hour() as u8 == check_hour;
    let in_check_window = now.hour() as u8 == check_hour
        && now.minute() as u8 >= stagger_minute.min(59);

    let stale = last_day != today && last_day != yesterday;
    (in_check_window && !fetched_in_check_window) || stale
}

/// Deterministic per-install fetch delay minute, 0..=45.
///
/// Hashing the device endpoint spreads a fleet's fetches across the check
/// hour without any stored randomness.
pub fn stagger_minute(device_endpoint: &str) -> u8 {
    let digest = Sha256::digest(device_endpoint.as_bytes());
    log::debug!(
        "stagger source digest {} for {device_endpoint}",
        hex::encode(&digest[..4])
    );
    let word = u16::from_be_bytes([digest[0], digest[1]]);
    (word % STAGGER_WINDOW_MINUTES) as u8
}

fn local(epoch: i64, utc_offset_secs: i32) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(floor_offset_to_hours(utc_offset_secs))?;
    DateTime::from_timestamp(epoch, 0).map(|dt| dt.with_timezone(&offset))
}

/// Epoch seconds for a local date and time, for tests and logs.
pub fn local_epoch(
    utc_offset_secs: i32,
    date: NaiveDate,
    hour: u32,
    minute: u32,
) -> Option<i64> {
    let offset = FixedOffset::east_opt(floor_offset_to_hours(utc_offset_secs))?;
    date.and_hms_opt(hour, minute, 0)
        .and_then(|naive| naive.and_local_timezone(offset).single())
        .map(|dt| dt.timestamp())
}
