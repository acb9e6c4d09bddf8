//! Weather forecast source
//!
//! Fetches an hourly "feels like" temperature series for the upcoming
//! planning window and reduces it to the arithmetic mean the heating curve
//! expects.

use std::time::Duration;

use crate::error::{Result, SpotheatError};

/// Fetches apparent-temperature forecasts for the device location.
#[derive(Debug, Clone)]
pub struct ForecastClient {
    http: reqwest::Client,
    url: String,
    latitude: f64,
    longitude: f64,
    timeout: Duration,
}

impl ForecastClient {
    pub fn new(url: &str, latitude: f64, longitude: f64, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            latitude,
            longitude,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Mean apparent temperature over the next `window_hours` hours.
    pub async fn fetch_mean(&self, window_hours: u8) -> Result<f64> {
        let response = self
            .http
            .get(&self.url)
            .timeout(self.timeout)
            .query(&[
                ("hourly", "apparent_temperature".to_string()),
                ("timezone", "auto".to_string()),
                ("forecast_days", "1".to_string()),
                ("forecast_hours", window_hours.to_string()),
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
            ])
            .send()
            .await
            .map_err(|e| SpotheatError::FetchFailed(format!("forecast request: {e}")))?;

        if !response.status().is_success() {
            return Err(SpotheatError::FetchFailed(format!(
                "forecast endpoint returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SpotheatError::FetchFailed(format!("forecast body: {e}")))?;
        mean_apparent_temperature(&body)
    }
}

/// Extract the apparent-temperature series and average it.
///
/// Expected shape: `{"hourly": {"apparent_temperature": [..]}}`. A body
/// carrying an `error` key (the endpoint reports failures in-band) or an
/// empty series is a fetch failure.
pub fn mean_apparent_temperature(body: &str) -> Result<f64> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| SpotheatError::FetchFailed(format!("forecast json: {e}")))?;

    if value.get("error").is_some_and(|e| e.as_bool() == Some(true)) {
        let reason = value
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("unknown");
        return Err(SpotheatError::FetchFailed(format!(
            "forecast endpoint error: {reason}"
        )));
    }

    let temps: Vec<f64> = value
        .get("hourly")
        .and_then(|h| h.get("apparent_temperature"))
        .and_then(|t| t.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_f64()).collect())
        .unwrap_or_default();

    if temps.is_empty() {
        return Err(SpotheatError::FetchFailed(
            "forecast body has no apparent_temperature series".to_string(),
        ));
    }

    Ok(temps.iter().sum::<f64>() / temps.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_of_series() {
        let body = r#"{"hourly": {"apparent_temperature": [-2.0, 0.0, 4.0]}}"#;
        let mean = mean_apparent_temperature(body).unwrap();
        assert!((mean - 0.6666).abs() < 0.001);
    }

    #[test]
    fn test_single_value_series() {
        let body = r#"{"hourly": {"apparent_temperature": [-7.5]}}"#;
        assert_eq!(mean_apparent_temperature(body).unwrap(), -7.5);
    }

    #[test]
    fn test_in_band_error_is_fetch_failure() {
        let body = r#"{"error": true, "reason": "invalid coordinates"}"#;
        match mean_apparent_temperature(body) {
            Err(SpotheatError::FetchFailed(msg)) => assert!(msg.contains("invalid coordinates")),
            other => panic!("expected FetchFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_series_is_fetch_failure() {
        assert!(mean_apparent_temperature(r#"{"hourly": {}}"#).is_err());
        assert!(mean_apparent_temperature(r#"{}"#).is_err());
    }

    #[test]
    fn test_malformed_body_is_fetch_failure() {
        assert!(mean_apparent_temperature("<html>bad gateway</html>").is_err());
    }

    #[test]
    fn test_empty_series_is_fetch_failure() {
        let body = r#"{"hourly": {"apparent_temperature": []}}"#;
        assert!(mean_apparent_temperature(body).is_err());
    }
}
