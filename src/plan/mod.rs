//! Schedule planning from day-ahead prices
//!
//! Partitions the day into periods, activates the cheapest hours within
//! each, applies the min/max price overrides, and degrades to a fixed
//! activation pattern when no price data is available.

pub mod forecast;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::HeatingConfig;

/// One hour of the day-ahead price curve with the transmission fee applied.
///
/// Immutable once built: `effective_price` is fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    /// Epoch seconds of the hour start
    pub hour_start: i64,
    /// Raw market price, EUR/MWh
    pub raw_price: f64,
    /// Transmission fee for this hour, EUR/MWh
    pub fee: f64,
    /// Market price plus fee
    pub effective_price: f64,
}

impl PricePoint {
    pub fn new(hour_start: i64, raw_price: f64, fee: f64) -> Self {
        Self {
            hour_start,
            raw_price,
            fee,
            effective_price: raw_price + fee,
        }
    }

    /// Local hour-of-day under the cycle's fixed UTC offset.
    pub fn hour_of_day(&self, utc_offset_secs: i32) -> u8 {
        hour_of_day(self.hour_start, utc_offset_secs)
    }
}

/// Local hour-of-day for an epoch timestamp under a fixed offset.
pub fn hour_of_day(epoch_secs: i64, utc_offset_secs: i32) -> u8 {
    let offset = crate::tariff::floor_offset_to_hours(utc_offset_secs) as i64;
    (epoch_secs + offset).div_euclid(3600).rem_euclid(24) as u8
}

/// Why an hour made it into the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryReason {
    /// Among the cheapest `H` hours of its period
    CheapestInPeriod,
    /// Priced below the always-on threshold
    AlwaysOn,
    /// Degraded plan, no price data
    Fallback,
}

/// One activated hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Hour of day, 0-23
    pub hour: u8,
    pub reason: EntryReason,
    /// Effective price that selected this hour, absent for fallback entries
    pub price: Option<f64>,
}

/// A day's activation plan, ordered by hour.
///
/// Produced fresh every planning cycle; nothing about it survives the cycle
/// except through the dispatcher's reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulePlan {
    pub entries: Vec<ScheduleEntry>,
}

impl SchedulePlan {
    /// Hours of day in ascending order.
    pub fn hours(&self) -> Vec<u8> {
        self.entries.iter().map(|e| e.hour).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sort by hour and drop duplicate hours (a 25-hour DST day can map two
    /// price rows onto one local hour).
    fn normalize(mut self) -> Self {
        self.entries.sort_by(|a, b| a.hour.cmp(&b.hour));
        self.entries.dedup_by_key(|e| e.hour);
        self
    }
}

/// Hour-of-day activation order when no price data is available, cheapest
/// first by long-term Nord Pool averages.
pub const FALLBACK_HOUR_ORDER: [u8; 24] = [
    0, 1, 2, 3, 4, 5, 6, 20, 21, 22, 23, 12, 13, 14, 15, 7, 8, 9, 10, 11, 16, 17, 18, 19,
];

/// Compute the activation plan for one day of prices.
///
/// `prices` is the day's curve in hour order (24 rows, or 23/25 on DST
/// switch days). `required_override` replaces the configured hours-per-period
/// when the forecast adjuster supplies a duration. `now_local_hour` selects
/// the upcoming period in forecast-driven mode; other periods are then left
/// untouched for later cycles.
pub fn plan(
    prices: &[PricePoint],
    config: &HeatingConfig,
    required_override: Option<u8>,
    now_local_hour: u8,
    utc_offset_secs: i32,
) -> SchedulePlan {
    if config.period_hours == 0 {
        return plan_whole_day(prices, config, utc_offset_secs);
    }
    if prices.is_empty() {
        return SchedulePlan::default();
    }

    let period = config.period_hours as usize;
    let period_count = prices.len().div_ceil(period);
    let hours = required_override.unwrap_or(config.hours_per_period);
    let per_period = (hours.min(config.period_hours)) as usize;

    let forecast_driven = config.forecast.enabled;
    let target_period = upcoming_period(now_local_hour, config.period_hours);

    let mut plan = SchedulePlan::default();
    for index in 0..period_count {
        if forecast_driven && index != target_period.min(period_count - 1) {
            continue;
        }
        let start = index * period;
        let end = ((index + 1) * period).min(prices.len());
        select_period(
            &prices[start..end],
            per_period,
            config,
            utc_offset_secs,
            &mut plan,
        );
    }
    plan.normalize()
}

/// Whole-day threshold mode: only hours below the always-on price heat.
/// An empty plan is a valid outcome ("no heating today").
fn plan_whole_day(
    prices: &[PricePoint],
    config: &HeatingConfig,
    utc_offset_secs: i32,
) -> SchedulePlan {
    let mut plan = SchedulePlan::default();
    for point in prices {
        if point.effective_price < config.always_on_below {
            plan.entries.push(ScheduleEntry {
                hour: point.hour_of_day(utc_offset_secs),
                reason: EntryReason::AlwaysOn,
                price: Some(point.effective_price),
            });
        }
    }
    plan.normalize()
}

/// Pick hours within one period: the `per_period` cheapest, plus any hour
/// below the always-on floor, all capped by the always-off ceiling.
fn select_period(
    period: &[PricePoint],
    per_period: usize,
    config: &HeatingConfig,
    utc_offset_secs: i32,
    plan: &mut SchedulePlan,
) {
    let mut ranked: Vec<&PricePoint> = period.iter().collect();
    ranked.sort_by(|a, b| {
        a.effective_price
            .partial_cmp(&b.effective_price)
            .unwrap_or(Ordering::Equal)
            .then(a.hour_start.cmp(&b.hour_start))
    });

    for (rank, point) in ranked.iter().enumerate() {
        let hour = point.hour_of_day(utc_offset_secs);
        let within_ceiling = point.effective_price <= config.always_off_above;

        if rank < per_period && within_ceiling {
            plan.entries.push(ScheduleEntry {
                hour,
                reason: EntryReason::CheapestInPeriod,
                price: Some(point.effective_price),
            });
        } else if point.effective_price < config.always_on_below && within_ceiling {
            plan.entries.push(ScheduleEntry {
                hour,
                reason: EntryReason::AlwaysOn,
                price: Some(point.effective_price),
            });
        } else if rank < per_period {
            // Rank-qualified hour lost only to the ceiling: the operator
            // probably set always_off_above too low
            log::warn!(
                "hour {:02}:00 at {:.2} EUR/MWh exceeds always_off_above {:.2}, not heating",
                hour,
                point.effective_price,
                config.always_off_above
            );
        }
    }
}

/// Period index containing the next upcoming hour.
///
/// Planning runs ahead of the clock: just before a period boundary the
/// result is the period that is about to begin.
pub fn upcoming_period(now_local_hour: u8, period_hours: u8) -> usize {
    if period_hours == 0 {
        return 0;
    }
    let ahead = (now_local_hour % 23) as usize + 2;
    ahead.div_ceil(period_hours as usize).saturating_sub(1)
}

/// Degraded plan used when no price data is available: a fixed permutation
/// of historically cheap hours, price-independent and deterministic.
pub fn fallback_plan(config: &HeatingConfig) -> SchedulePlan {
    let period_count = if config.period_hours == 0 {
        0
    } else {
        24usize.div_ceil(config.period_hours as usize)
    };
    let take = (config.hours_per_period as usize * period_count).min(24);

    let mut plan = SchedulePlan::default();
    for &hour in FALLBACK_HOUR_ORDER.iter().take(take) {
        plan.entries.push(ScheduleEntry {
            hour,
            reason: EntryReason::Fallback,
            price: None,
        });
    }
    plan.normalize()
}
