//! Shelly Gen2 RPC adapter
//!
//! Speaks the device's JSON-RPC-over-HTTP surface: schedule management,
//! switch auto-revert timers, clock status, and the on-device key-value
//! store that holds the controller's persisted state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike};
use serde_json::{Value, json};

use crate::device::{DeviceChannel, DeviceClock, InstalledSchedule, ScheduleSpec};
use crate::error::{Result, SpotheatError};
use crate::store::KvStore;

/// Device-side RPC error payload.
#[derive(Debug, Clone)]
struct RpcError {
    code: i64,
    message: String,
}

/// Key not present in the device KVS.
const CODE_NOT_FOUND: i64 = -105;

/// HTTP JSON-RPC client for one Shelly-class device.
#[derive(Debug, Clone)]
pub struct ShellyRpc {
    http: reqwest::Client,
    endpoint: String,
    relay_id: u8,
    timeout: Duration,
}

impl ShellyRpc {
    pub fn new(endpoint: &str, relay_id: u8) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            relay_id,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue one RPC frame. The outer error is transport-level; the inner
    /// one is the device rejecting the call.
    async fn call_raw(
        &self,
        method: &str,
        params: Value,
    ) -> Result<std::result::Result<Value, RpcError>> {
        let frame = json!({
            "id": 1,
            "src": "spotheat",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(format!("{}/rpc", self.endpoint))
            .timeout(self.timeout)
            .json(&frame)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SpotheatError::Rpc(format!(
                "{method}: HTTP {}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        if let Some(error) = body.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Ok(Err(RpcError { code, message }));
        }
        Ok(Ok(body.get("result").cloned().unwrap_or(Value::Null)))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match self.call_raw(method, params).await? {
            Ok(result) => Ok(result),
            Err(e) => Err(map_rpc_error(method, &e)),
        }
    }
}

fn map_rpc_error(method: &str, error: &RpcError) -> SpotheatError {
    let lower = error.message.to_lowercase();
    if lower.contains("too many") || lower.contains("limit") {
        SpotheatError::CapacityExceeded
    } else {
        SpotheatError::Rpc(format!(
            "{method} code {}: {}",
            error.code, error.message
        ))
    }
}

/// Pull `InstalledSchedule`s out of a `Schedule.List` result.
///
/// Entries that do not switch the relay (other scripts' jobs, button
/// automations) are skipped; they are never ours to dedupe against or
/// delete.
fn parse_job_list(result: &Value) -> Vec<InstalledSchedule> {
    let jobs = match result.get("jobs").and_then(Value::as_array) {
        Some(jobs) => jobs,
        None => return Vec::new(),
    };

    let mut installed = Vec::new();
    for job in jobs {
        let handle = job.get("id").and_then(Value::as_u64);
        let timespec = job.get("timespec").and_then(Value::as_str);
        let on = job
            .get("calls")
            .and_then(Value::as_array)
            .and_then(|calls| calls.first())
            .filter(|call| {
                call.get("method").and_then(Value::as_str) == Some("Switch.Set")
            })
            .and_then(|call| call.get("params"))
            .and_then(|params| params.get("on"))
            .and_then(Value::as_bool);

        match (handle, timespec, on) {
            (Some(handle), Some(timespec), Some(on)) => installed.push(InstalledSchedule {
                handle: handle as u32,
                timespec: timespec.to_string(),
                on,
            }),
            _ => log::debug!("skipping non-switch schedule entry: {job}"),
        }
    }
    installed
}

/// UTC offset in seconds from the device's local `HH:MM` display time and
/// its epoch clock. Handles fractional-hour zones; callers floor as needed.
fn offset_from_local_time(unixtime: i64, local_hhmm: &str) -> Option<i32> {
    let utc = DateTime::from_timestamp(unixtime, 0)?;
    let (hh, mm) = local_hhmm.split_once(':')?;
    let local_minutes = hh.parse::<i32>().ok()? * 60 + mm.parse::<i32>().ok()?;
    let utc_minutes = utc.hour() as i32 * 60 + utc.minute() as i32;

    let mut diff = local_minutes - utc_minutes;
    if diff > 12 * 60 {
        diff -= 24 * 60;
    }
    if diff < -12 * 60 {
        diff += 24 * 60;
    }
    Some(diff * 60)
}

#[async_trait]
impl DeviceChannel for ShellyRpc {
    async fn list_schedules(&self) -> Result<Vec<InstalledSchedule>> {
        let result = self.call("Schedule.List", json!({})).await?;
        Ok(parse_job_list(&result))
    }

    async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<u32> {
        let params = json!({
            "enable": true,
            "timespec": spec.timespec,
            "calls": [{
                "method": "Switch.Set",
                "params": { "id": self.relay_id, "on": spec.on },
            }],
        });
        let result = self.call("Schedule.Create", params).await?;
        result
            .get("id")
            .and_then(Value::as_u64)
            .map(|id| id as u32)
            .ok_or_else(|| SpotheatError::Rpc("Schedule.Create returned no id".to_string()))
    }

    async fn delete_schedule(&self, handle: u32) -> Result<()> {
        self.call("Schedule.Delete", json!({ "id": handle })).await?;
        Ok(())
    }

    async fn set_failsafe_timer(&self, duration_secs: u32, revert_on: bool) -> Result<()> {
        let params = json!({
            "id": self.relay_id,
            "config": {
                "auto_on": revert_on,
                "auto_on_delay": duration_secs,
                "auto_off": !revert_on,
                "auto_off_delay": duration_secs,
            },
        });
        self.call("Switch.SetConfig", params).await?;
        Ok(())
    }

    async fn clock(&self) -> Result<DeviceClock> {
        let status = self.call("Sys.GetStatus", json!({})).await?;
        let unixtime = status
            .get("unixtime")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let utc_offset_secs = status
            .get("time")
            .and_then(Value::as_str)
            .and_then(|t| offset_from_local_time(unixtime, t))
            .unwrap_or(0);
        Ok(DeviceClock {
            unixtime,
            utc_offset_secs,
        })
    }
}

/// The device KVS doubles as the controller's durable store, so persisted
/// handles survive even if the controlling host is reinstalled.
#[async_trait]
impl KvStore for ShellyRpc {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.call_raw("KVS.Get", json!({ "key": key })).await? {
            Ok(result) => Ok(result.get("value").cloned()),
            Err(e) if e.code == CODE_NOT_FOUND => Ok(None),
            Err(e) => Err(SpotheatError::Store(format!(
                "KVS.Get {key}: code {} {}",
                e.code, e.message
            ))),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.call("KVS.Set", json!({ "key": key, "value": value }))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.call_raw("KVS.Delete", json!({ "key": key })).await? {
            Ok(_) => Ok(()),
            Err(e) if e.code == CODE_NOT_FOUND => Ok(()),
            Err(e) => Err(SpotheatError::Store(format!(
                "KVS.Delete {key}: code {} {}",
                e.code, e.message
            ))),
        }
    }
}
