//! Transmission-fee tariffs
//!
//! Grid operators add a time-of-use transmission fee on top of the raw
//! market price. Plans differ in how they classify an hour (flat, day/night,
//! or day/night with winter peak windows); the fee itself is a pure function
//! of the local hour, weekday and month.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Weekday};
use serde::{Deserialize, Serialize};

/// Fee classes a plan can charge for one hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    /// Night and weekend hours
    Night,
    /// Ordinary weekday daytime
    Day,
    /// Winter weekday peak windows
    PeakDay,
    /// Winter weekend peak windows
    PeakHoliday,
}

/// Per-plan fee table, EUR/MWh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateTable {
    pub day: f64,
    pub night: f64,
    pub peak_day: f64,
    pub peak_holiday: f64,
}

impl RateTable {
    const fn flat(rate: f64) -> Self {
        Self {
            day: rate,
            night: rate,
            peak_day: rate,
            peak_holiday: rate,
        }
    }

    /// Fee for a classified hour.
    pub fn rate(&self, class: RateClass) -> f64 {
        match class {
            RateClass::Night => self.night,
            RateClass::Day => self.day,
            RateClass::PeakDay => self.peak_day,
            RateClass::PeakHoliday => self.peak_holiday,
        }
    }
}

/// How a plan's operator classifies hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    /// Day/night plus winter peak windows (Elektrilevi network plans)
    PeakWindows,
    /// Day/night with a DST-dependent night boundary (Imatra partner plans)
    DayNight,
    /// No fee
    Flat,
}

/// Closed set of supported transmission plans.
///
/// Resolved from config by name; unknown names fail at deserialization
/// instead of silently billing zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Vork1,
    #[default]
    Vork2,
    Vork4,
    Vork5,
    Partner24,
    Partner24Plus,
    Partner12,
    Partner12Plus,
    None,
}

impl Provider {
    /// Static fee table for this plan, EUR/MWh.
    pub fn rates(&self) -> RateTable {
        match self {
            Provider::Vork1 => RateTable::flat(77.2),
            Provider::Vork2 => RateTable {
                day: 60.7,
                night: 35.1,
                peak_day: 60.7,
                peak_holiday: 35.1,
            },
            Provider::Vork4 => RateTable {
                day: 36.9,
                night: 21.0,
                peak_day: 36.9,
                peak_holiday: 21.0,
            },
            Provider::Vork5 => RateTable {
                day: 52.9,
                night: 30.3,
                peak_day: 81.8,
                peak_holiday: 47.4,
            },
            Provider::Partner24 => RateTable::flat(60.7),
            Provider::Partner24Plus => RateTable::flat(38.6),
            Provider::Partner12 => RateTable {
                day: 72.4,
                night: 42.0,
                peak_day: 72.4,
                peak_holiday: 42.0,
            },
            Provider::Partner12Plus => RateTable {
                day: 46.4,
                night: 27.1,
                peak_day: 46.4,
                peak_holiday: 27.1,
            },
            Provider::None => RateTable::flat(0.0),
        }
    }

    fn family(&self) -> Family {
        match self {
            Provider::Vork1 | Provider::Vork2 | Provider::Vork4 | Provider::Vork5 => {
                Family::PeakWindows
            }
            Provider::Partner24
            | Provider::Partner24Plus
            | Provider::Partner12
            | Provider::Partner12Plus => Family::DayNight,
            Provider::None => Family::Flat,
        }
    }
}

/// Floor a UTC offset to whole hours.
///
/// Schedule timespecs are expressed as `hour:0:0`, so fractional-hour
/// locales must round down consistently everywhere the offset is used.
pub fn floor_offset_to_hours(utc_offset_secs: i32) -> i32 {
    utc_offset_secs.div_euclid(3600) * 3600
}

/// Transmission fee for the hour starting at `epoch_secs`, EUR/MWh.
///
/// Pure and total: any provider/offset combination yields a fee, and
/// `Provider::None` always yields zero. The offset comes from the device
/// clock, resolved once per planning cycle.
pub fn fee(epoch_secs: i64, utc_offset_secs: i32, provider: Provider) -> f64 {
    let class = classify(epoch_secs, utc_offset_secs, provider);
    provider.rates().rate(class)
}

/// Classify the hour starting at `epoch_secs` under the given plan.
pub fn classify(epoch_secs: i64, utc_offset_secs: i32, provider: Provider) -> RateClass {
    let local = match local_time(epoch_secs, utc_offset_secs) {
        Some(dt) => dt,
        // Out-of-range timestamp: treat as ordinary daytime
        None => return RateClass::Day,
    };
    let hour = local.hour();
    let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
    let month = local.month();

    match provider.family() {
        Family::PeakWindows => {
            // Peak windows apply Nov-Mar only
            let winter = month >= 11 || month <= 3;
            let evening_peak = (16..20).contains(&hour);
            let morning_peak = (9..12).contains(&hour);
            if winter && weekend && evening_peak {
                RateClass::PeakHoliday
            } else if winter && (morning_peak || evening_peak) {
                RateClass::PeakDay
            } else if hour < 7 || hour >= 22 || weekend {
                RateClass::Night
            } else {
                RateClass::Day
            }
        }
        Family::DayNight => {
            // The night boundary follows the grid's DST switch: +3h offset
            // in summer, +2h in winter for the Baltic area
            let summer = utc_offset_secs >= 3 * 3600;
            let night = if summer {
                hour < 8 || weekend
            } else {
                hour < 7 || hour >= 23 || weekend
            };
            if night { RateClass::Night } else { RateClass::Day }
        }
        Family::Flat => RateClass::Day,
    }
}

fn local_time(epoch_secs: i64, utc_offset_secs: i32) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(floor_offset_to_hours(utc_offset_secs))?;
    DateTime::from_timestamp(epoch_secs, 0).map(|dt| dt.with_timezone(&offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const WINTER_TZ: i32 = 2 * 3600;
    const SUMMER_TZ: i32 = 3 * 3600;

    /// Epoch seconds for a local wall-clock time at the given offset.
    fn at(offset_secs: i32, y: i32, m: u32, d: u32, h: u32) -> i64 {
        FixedOffset::east_opt(offset_secs)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .timestamp()
    }

    #[test]
    fn test_winter_weekday_morning_peak() {
        // Wednesday 2025-01-15 10:00 local
        let ts = at(WINTER_TZ, 2025, 1, 15, 10);
        assert_eq!(classify(ts, WINTER_TZ, Provider::Vork5), RateClass::PeakDay);
        assert_eq!(fee(ts, WINTER_TZ, Provider::Vork5), 81.8);
    }

    #[test]
    fn test_winter_weekday_evening_peak() {
        // Friday 2025-01-17 17:00 local
        let ts = at(WINTER_TZ, 2025, 1, 17, 17);
        assert_eq!(classify(ts, WINTER_TZ, Provider::Vork5), RateClass::PeakDay);
    }

    #[test]
    fn test_winter_weekend_evening_is_holiday_peak() {
        // Saturday 2025-01-18 17:00 local
        let ts = at(WINTER_TZ, 2025, 1, 18, 17);
        assert_eq!(
            classify(ts, WINTER_TZ, Provider::Vork5),
            RateClass::PeakHoliday
        );
        assert_eq!(fee(ts, WINTER_TZ, Provider::Vork5), 47.4);
    }

    #[test]
    fn test_winter_weekend_outside_peak_is_night() {
        // Saturday 2025-01-18 13:00 local: weekend but no peak window
        let ts = at(WINTER_TZ, 2025, 1, 18, 13);
        assert_eq!(classify(ts, WINTER_TZ, Provider::Vork2), RateClass::Night);
    }

    #[test]
    fn test_summer_has_no_peak_windows() {
        // Tuesday 2025-07-15 17:00 local: evening peak hours, but July
        let ts = at(SUMMER_TZ, 2025, 7, 15, 17);
        assert_eq!(classify(ts, SUMMER_TZ, Provider::Vork5), RateClass::Day);
        assert_eq!(fee(ts, SUMMER_TZ, Provider::Vork5), 52.9);
    }

    #[test]
    fn test_weekday_night_hours() {
        let ts = at(WINTER_TZ, 2025, 1, 15, 5);
        assert_eq!(classify(ts, WINTER_TZ, Provider::Vork2), RateClass::Night);
        let ts = at(WINTER_TZ, 2025, 1, 15, 22);
        assert_eq!(classify(ts, WINTER_TZ, Provider::Vork2), RateClass::Night);
    }

    #[test]
    fn test_weekday_day_hours() {
        let ts = at(WINTER_TZ, 2025, 4, 16, 12);
        assert_eq!(classify(ts, WINTER_TZ, Provider::Vork2), RateClass::Day);
        assert_eq!(fee(ts, WINTER_TZ, Provider::Vork2), 60.7);
    }

    #[test]
    fn test_day_night_plan_summer_boundary() {
        // Monday 2025-06-16 07:30 falls in the 00:00-08:00 summer night
        let ts = at(SUMMER_TZ, 2025, 6, 16, 7);
        assert_eq!(
            classify(ts, SUMMER_TZ, Provider::Partner12),
            RateClass::Night
        );
        let ts = at(SUMMER_TZ, 2025, 6, 16, 8);
        assert_eq!(classify(ts, SUMMER_TZ, Provider::Partner12), RateClass::Day);
    }

    #[test]
    fn test_day_night_plan_winter_boundary() {
        // Monday 2025-01-13: night is 23:00-07:00 in winter
        let ts = at(WINTER_TZ, 2025, 1, 13, 7);
        assert_eq!(classify(ts, WINTER_TZ, Provider::Partner12), RateClass::Day);
        let ts = at(WINTER_TZ, 2025, 1, 13, 23);
        assert_eq!(
            classify(ts, WINTER_TZ, Provider::Partner12),
            RateClass::Night
        );
    }

    #[test]
    fn test_day_night_plan_weekend_is_night() {
        let ts = at(WINTER_TZ, 2025, 1, 18, 12);
        assert_eq!(
            classify(ts, WINTER_TZ, Provider::Partner12),
            RateClass::Night
        );
        assert_eq!(fee(ts, WINTER_TZ, Provider::Partner12), 42.0);
    }

    #[test]
    fn test_none_provider_is_free() {
        let ts = at(WINTER_TZ, 2025, 1, 15, 10);
        assert_eq!(fee(ts, WINTER_TZ, Provider::None), 0.0);
    }

    #[test]
    fn test_flat_plan_same_fee_all_hours() {
        for hour in [0, 7, 10, 17, 23] {
            let ts = at(WINTER_TZ, 2025, 1, 15, hour);
            assert_eq!(fee(ts, WINTER_TZ, Provider::Vork1), 77.2);
            assert_eq!(fee(ts, WINTER_TZ, Provider::Partner24Plus), 38.6);
        }
    }

    #[test]
    fn test_fee_total_on_degenerate_input() {
        // Nonsense offset and epoch still produce a number
        let f = fee(0, 0, Provider::Vork2);
        assert!(f > 0.0);
        let f = fee(i64::MAX, 13 * 3600, Provider::Vork2);
        assert!(f >= 0.0);
    }

    #[test]
    fn test_floor_offset_to_hours() {
        assert_eq!(floor_offset_to_hours(7200), 7200);
        // Fractional-hour locale floors down
        assert_eq!(floor_offset_to_hours(5 * 3600 + 1800), 5 * 3600);
        assert_eq!(floor_offset_to_hours(-(3 * 3600 + 1800)), -4 * 3600);
    }

    #[test]
    fn test_provider_deserializes_from_config_names() {
        let p: Provider = serde_yaml::from_str("vork2").unwrap();
        assert_eq!(p, Provider::Vork2);
        let p: Provider = serde_yaml::from_str("partner12_plus").unwrap();
        assert_eq!(p, Provider::Partner12Plus);
        assert!(serde_yaml::from_str::<Provider>("vork9").is_err());
    }

    #[test]
    fn test_rate_table_lookup() {
        let t = Provider::Vork5.rates();
        assert_eq!(t.rate(RateClass::Night), 30.3);
        assert_eq!(t.rate(RateClass::Day), 52.9);
        assert_eq!(t.rate(RateClass::PeakDay), 81.8);
        assert_eq!(t.rate(RateClass::PeakHoliday), 47.4);
    }
}
