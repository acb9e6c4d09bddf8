//! Device command channel
//!
//! The relay device is driven through a narrow RPC surface: list, create
//! and delete schedule entries, arm the failsafe auto-revert timer, and read
//! the device clock. `DeviceChannel` is the seam; `ShellyRpc` is the real
//! adapter and `MockDeviceChannel` stands in for tests.

pub mod shelly;
pub mod timespec;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SpotheatError};

pub use shelly::ShellyRpc;

/// A schedule entry as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledSchedule {
    /// Opaque identifier assigned by the device at creation
    pub handle: u32,
    pub timespec: String,
    /// Relay state the entry switches to
    pub on: bool,
}

/// A schedule entry to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub timespec: String,
    pub on: bool,
}

impl ScheduleSpec {
    /// Whether an installed entry is this spec, modulo formatting.
    pub fn matches(&self, installed: &InstalledSchedule) -> bool {
        self.on == installed.on && timespec::equivalent(&self.timespec, &installed.timespec)
    }
}

/// Snapshot of the device wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceClock {
    /// Epoch seconds, 0 when the device has not synced time yet
    pub unixtime: i64,
    /// Local UTC offset in seconds
    pub utc_offset_secs: i32,
}

impl DeviceClock {
    pub fn is_valid(&self) -> bool {
        self.unixtime > 0
    }
}

/// Narrow, rate-limited command channel to the relay device.
///
/// The transport allows only a handful of concurrent calls; callers must
/// keep their own pipelining within the configured budget.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// List the schedule entries currently installed on the device.
    async fn list_schedules(&self) -> Result<Vec<InstalledSchedule>>;

    /// Create a schedule entry, returning its handle.
    async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<u32>;

    /// Delete a schedule entry by handle.
    async fn delete_schedule(&self, handle: u32) -> Result<()>;

    /// Arm the failsafe auto-revert timer: after `duration_secs` without a
    /// new command the relay reverts to `revert_on`.
    async fn set_failsafe_timer(&self, duration_secs: u32, revert_on: bool) -> Result<()>;

    /// Read the device clock.
    async fn clock(&self) -> Result<DeviceClock>;
}

/// In-memory device stand-in for tests.
///
/// Tracks the installed schedule set, observed call concurrency, and can be
/// told to fail creates or enforce a schedule slot capacity.
#[derive(Debug, Default)]
pub struct MockDeviceChannel {
    schedules: Mutex<BTreeMap<u32, InstalledSchedule>>,
    next_handle: AtomicU32,
    fail_creates_remaining: AtomicUsize,
    fail_deletes_remaining: AtomicUsize,
    capacity: Option<usize>,
    latency: Duration,
    clock: Mutex<DeviceClock>,
    in_flight: AtomicUsize,
    max_in_flight_seen: AtomicUsize,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    failsafe_arms: Mutex<Vec<(u32, bool)>>,
}

impl MockDeviceChannel {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU32::new(1),
            clock: Mutex::new(DeviceClock {
                unixtime: 1_735_689_600, // 2025-01-01 00:00 UTC
                utc_offset_secs: 7200,
            }),
            ..Self::default()
        }
    }

    /// Add artificial per-call latency so concurrency is observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Enforce a device-side schedule slot limit.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Fail the next `n` create calls with an RPC error.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` delete calls with an RPC error.
    pub fn fail_next_deletes(&self, n: usize) {
        self.fail_deletes_remaining.store(n, Ordering::SeqCst);
    }

    /// Pre-install an entry, as if a previous run created it.
    pub fn install(&self, handle: u32, timespec: &str, on: bool) {
        self.schedules.lock().unwrap().insert(
            handle,
            InstalledSchedule {
                handle,
                timespec: timespec.to_string(),
                on,
            },
        );
        self.next_handle.fetch_max(handle + 1, Ordering::SeqCst);
    }

    pub fn set_clock(&self, unixtime: i64, utc_offset_secs: i32) {
        *self.clock.lock().unwrap() = DeviceClock {
            unixtime,
            utc_offset_secs,
        };
    }

    pub fn installed(&self) -> Vec<InstalledSchedule> {
        self.schedules.lock().unwrap().values().cloned().collect()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight_seen(&self) -> usize {
        self.max_in_flight_seen.load(Ordering::SeqCst)
    }

    /// Failsafe timer arms as `(duration_secs, revert_on)` pairs.
    pub fn failsafe_arms(&self) -> Vec<(u32, bool)> {
        self.failsafe_arms.lock().unwrap().clone()
    }

    async fn enter_call(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_seen.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn exit_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceChannel for MockDeviceChannel {
    async fn list_schedules(&self) -> Result<Vec<InstalledSchedule>> {
        self.enter_call().await;
        let listing = self.installed();
        self.exit_call();
        Ok(listing)
    }

    async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<u32> {
        self.enter_call().await;
        self.creates.fetch_add(1, Ordering::SeqCst);

        let result = (|| {
            let remaining = self.fail_creates_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_creates_remaining
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(SpotheatError::Rpc("injected create failure".to_string()));
            }

            let mut schedules = self.schedules.lock().unwrap();
            if let Some(capacity) = self.capacity
                && schedules.len() >= capacity
            {
                return Err(SpotheatError::CapacityExceeded);
            }

            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
            schedules.insert(
                handle,
                InstalledSchedule {
                    handle,
                    timespec: spec.timespec.clone(),
                    on: spec.on,
                },
            );
            Ok(handle)
        })();

        self.exit_call();
        result
    }

    async fn delete_schedule(&self, handle: u32) -> Result<()> {
        self.enter_call().await;
        self.deletes.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_deletes_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_deletes_remaining
                .store(remaining - 1, Ordering::SeqCst);
            self.exit_call();
            return Err(SpotheatError::Rpc("injected delete failure".to_string()));
        }

        let removed = self.schedules.lock().unwrap().remove(&handle);
        self.exit_call();
        match removed {
            Some(_) => Ok(()),
            None => Err(SpotheatError::Rpc(format!("no schedule with id {handle}"))),
        }
    }

    async fn set_failsafe_timer(&self, duration_secs: u32, revert_on: bool) -> Result<()> {
        self.failsafe_arms
            .lock()
            .unwrap()
            .push((duration_secs, revert_on));
        Ok(())
    }

    async fn clock(&self) -> Result<DeviceClock> {
        Ok(*self.clock.lock().unwrap())
    }
}
