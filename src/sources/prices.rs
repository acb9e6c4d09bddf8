//! Day-ahead market price source
//!
//! The price endpoint answers either delimited CSV (`"epoch";"price"` rows,
//! locale decimal comma, one header line) or JSON with an `hourly` array.
//! Both normalize into `PricePoint`s with the transmission fee applied.

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Timelike, Utc};
use std::time::Duration as StdDuration;

use crate::error::{Result, SpotheatError};
use crate::plan::PricePoint;
use crate::tariff::{self, Provider};

/// A response with fewer hourly rows than this is a fetch failure, not
/// partial data.
pub const MIN_PRICE_ROWS: usize = 23;

/// Fetches and normalizes the day-ahead price curve.
#[derive(Debug, Clone)]
pub struct PriceClient {
    http: reqwest::Client,
    url: String,
    region: String,
    timeout: StdDuration,
}

impl PriceClient {
    pub fn new(url: &str, region: &str, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            region: region.to_string(),
            timeout: StdDuration::from_secs(timeout_secs),
        }
    }

    /// Fetch raw `(epoch, price)` rows for the given UTC window.
    pub async fn fetch(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<(i64, f64)>> {
        let response = self
            .http
            .get(&self.url)
            .timeout(self.timeout)
            .query(&[
                ("fields", self.region.as_str()),
                ("start", &start.to_rfc3339()),
                ("end", &end.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|e| SpotheatError::FetchFailed(format!("price request: {e}")))?;

        if !response.status().is_success() {
            return Err(SpotheatError::FetchFailed(format!(
                "price endpoint returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SpotheatError::FetchFailed(format!("price body: {e}")))?;
        parse_price_body(&body)
    }
}

/// Parse a price payload, sniffing JSON vs CSV from the first byte.
pub fn parse_price_body(body: &str) -> Result<Vec<(i64, f64)>> {
    let trimmed = body.trim_start();
    let rows = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        parse_json(trimmed)?
    } else {
        parse_csv(body)?
    };
    if rows.len() < MIN_PRICE_ROWS {
        return Err(SpotheatError::InsufficientData {
            got: rows.len(),
            need: MIN_PRICE_ROWS,
        });
    }
    Ok(rows)
}

/// CSV shape: one header line, then `"epoch";"price"` rows with a decimal
/// comma in the price.
fn parse_csv(body: &str) -> Result<Vec<(i64, f64)>> {
    let mut rows = Vec::new();
    for line in body.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(';').map(|f| f.trim().trim_matches('"'));
        let epoch = fields
            .next()
            .and_then(|f| f.parse::<i64>().ok())
            .ok_or_else(|| SpotheatError::FetchFailed(format!("bad CSV epoch in {line:?}")))?;
        let price = fields
            .next()
            .and_then(|f| f.replace(',', ".").parse::<f64>().ok())
            .ok_or_else(|| SpotheatError::FetchFailed(format!("bad CSV price in {line:?}")))?;
        rows.push((epoch, price));
    }
    Ok(rows)
}

/// JSON shape: `{"hourly": [{"time": epoch, "price": x}, ...]}`.
fn parse_json(body: &str) -> Result<Vec<(i64, f64)>> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| SpotheatError::FetchFailed(format!("json: {e}")))?;
    let hourly = value
        .get("hourly")
        .and_then(|h| h.as_array())
        .ok_or_else(|| SpotheatError::FetchFailed("missing hourly array".to_string()))?;

    let mut rows = Vec::new();
    for entry in hourly {
        let time = entry
            .get("time")
            .and_then(|t| t.as_i64())
            .ok_or_else(|| SpotheatError::FetchFailed("hourly entry missing time".to_string()))?;
        let price = entry
            .get("price")
            .and_then(|p| p.as_f64())
            .ok_or_else(|| SpotheatError::FetchFailed("hourly entry missing price".to_string()))?;
        rows.push((time, price));
    }
    Ok(rows)
}

/// Apply fees and order the rows into the planner's input series.
pub fn normalize(rows: &[(i64, f64)], provider: Provider, utc_offset_secs: i32) -> Vec<PricePoint> {
    let mut points: Vec<PricePoint> = rows
        .iter()
        .map(|&(epoch, raw)| PricePoint::new(epoch, raw, tariff::fee(epoch, utc_offset_secs, provider)))
        .collect();
    points.sort_by_key(|p| p.hour_start);
    points
}

/// UTC window covering the local day to plan.
///
/// At or after 23:00 local, tomorrow's prices are planned; before that the
/// current day's are. The end is the final hour start, so a full day is 24
/// rows inclusive.
pub fn day_window(now: DateTime<Utc>, utc_offset_secs: i32) -> (DateTime<Utc>, DateTime<Utc>) {
    let offset = FixedOffset::east_opt(tariff::floor_offset_to_hours(utc_offset_secs))
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
    let local = now.with_timezone(&offset);

    let target_day = if local.time().hour() >= 23 {
        local.date_naive() + Duration::days(1)
    } else {
        local.date_naive()
    };

    let start = offset
        .from_local_datetime(&target_day.and_hms_opt(0, 0, 0).expect("midnight"))
        .single()
        .expect("fixed offsets are unambiguous")
        .with_timezone(&Utc);
    (start, start + Duration::hours(23))
}
