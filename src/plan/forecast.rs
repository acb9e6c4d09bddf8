//! Forecast-driven heating duration
//!
//! Converts a mean "feels like" outdoor temperature into the number of
//! heating hours one period needs, along a configurable heating curve.

/// Heating hours required in one period for the given mean apparent
/// temperature.
///
/// The curve is anchored at `baseline_temp` (no heat needed at or above it)
/// and steepened by `power_factor`; `curve_shift` moves the whole curve by
/// one hour of heat per step. The result is monotonically non-increasing in
/// temperature and clamped to `[0, period_hours]`; extreme inputs clamp
/// rather than fail.
pub fn required_hours(
    avg_apparent_temp: f64,
    period_hours: u8,
    curve_shift: i8,
    power_factor: f64,
    baseline_temp: f64,
) -> u8 {
    if period_hours == 0 {
        return 0;
    }

    let temp = avg_apparent_temp.ceil();
    if temp > baseline_temp {
        return 0;
    }

    let deficit = baseline_temp - temp;
    let day_hours = deficit * power_factor + 2.0 * f64::from(curve_shift) - 2.0;
    if day_hours <= 0.0 {
        return 0;
    }

    // The curve yields hours for the whole day; split across periods
    let period_count = 24u32.div_ceil(u32::from(period_hours)) as f64;
    let hours = (day_hours / period_count).floor();
    (hours as u32).min(u32::from(period_hours)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve_24h(temp: f64) -> u8 {
        required_hours(temp, 24, 0, 0.5, 16.0)
    }

    fn curve_12h(temp: f64) -> u8 {
        required_hours(temp, 12, 0, 0.5, 16.0)
    }

    #[test]
    fn test_24h_curve_reference_points() {
        // Reference values from the published 24h heating curve table
        assert_eq!(curve_24h(17.0), 0);
        assert_eq!(curve_24h(10.0), 1);
        assert_eq!(curve_24h(5.0), 3);
        assert_eq!(curve_24h(0.0), 6);
        assert_eq!(curve_24h(-5.0), 8);
        assert_eq!(curve_24h(-10.0), 11);
        assert_eq!(curve_24h(-15.0), 13);
        assert_eq!(curve_24h(-20.0), 16);
        assert_eq!(curve_24h(-25.0), 18);
    }

    #[test]
    fn test_12h_curve_reference_points() {
        assert_eq!(curve_12h(10.0), 0);
        assert_eq!(curve_12h(0.0), 3);
        assert_eq!(curve_12h(-10.0), 5);
        assert_eq!(curve_12h(-25.0), 9);
    }

    #[test]
    fn test_curve_shift_adds_heat() {
        // One shift step is worth one hour on the 24h curve
        assert_eq!(required_hours(0.0, 24, 1, 0.5, 16.0), 8);
        assert_eq!(required_hours(0.0, 24, -1, 0.5, 16.0), 4);
    }

    #[test]
    fn test_clamped_to_period_length() {
        assert_eq!(required_hours(-40.0, 12, 6, 1.0, 16.0), 12);
        assert_eq!(required_hours(-60.0, 24, 6, 1.0, 16.0), 24);
    }

    #[test]
    fn test_never_negative_for_extreme_inputs() {
        assert_eq!(required_hours(45.0, 24, -6, 0.5, 16.0), 0);
        assert_eq!(required_hours(15.9, 24, 0, 0.0, 16.0), 0);
        assert_eq!(required_hours(f64::MAX, 24, 0, 0.5, 16.0), 0);
    }

    #[test]
    fn test_zero_period_yields_zero() {
        assert_eq!(required_hours(-10.0, 0, 0, 0.5, 16.0), 0);
    }

    #[test]
    fn test_monotone_non_increasing_in_temperature() {
        let mut last = u8::MAX;
        for t in (-30..=20).map(f64::from) {
            let h = required_hours(t, 24, 0, 0.5, 16.0);
            assert!(h <= last, "hours increased at {t}");
            last = h;
        }
    }

    #[test]
    fn test_mean_is_rounded_up_before_lookup() {
        // -0.5 rounds to 0 on the curve
        assert_eq!(required_hours(-0.5, 24, 0, 0.5, 16.0), curve_24h(0.0));
    }
}
