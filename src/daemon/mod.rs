//! Control loop daemon
//!
//! The long-running process that decides when to replan, fetches forecast
//! and price data, runs the planner, and hands the plan to the dispatcher.
//! One cycle at a time: a wake that arrives while a cycle runs is a no-op.

pub mod refresh;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Config;
use crate::device::{DeviceChannel, DeviceClock};
use crate::dispatch::{CycleStamps, Dispatcher, ReconcileResult};
use crate::error::{Result, SpotheatError};
use crate::plan::{self, SchedulePlan, forecast};
use crate::sources::{ForecastClient, PriceClient, prices};
use crate::store::{self, KvStore};
use crate::tariff::floor_offset_to_hours;

/// What one wake of the control loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing due; no work performed
    Skipped,
    /// Planned from fresh price data
    Refreshed,
    /// Fell back to the degraded plan (fetch failure or no clock)
    Degraded,
}

/// Counters across the daemon's lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopStats {
    pub wakes: u64,
    pub refreshed: u64,
    pub degraded: u64,
    pub skipped: u64,
}

impl LoopStats {
    pub fn record(&mut self, outcome: &CycleOutcome) {
        self.wakes += 1;
        match outcome {
            CycleOutcome::Skipped => self.skipped += 1,
            CycleOutcome::Refreshed => self.refreshed += 1,
            CycleOutcome::Degraded => self.degraded += 1,
        }
    }
}

/// The planning/dispatching control loop.
pub struct ControlLoop<D, S> {
    device: Arc<D>,
    store: Arc<S>,
    dispatcher: Dispatcher<D, S>,
    price_client: PriceClient,
    forecast_client: ForecastClient,
    config: Config,
    stagger_minute: u8,
    cycle_running: bool,
    pub stats: LoopStats,
}

impl<D, S> ControlLoop<D, S>
where
    D: DeviceChannel + 'static,
    S: KvStore,
{
    pub fn new(config: Config, device: Arc<D>, store: Arc<S>) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::clone(&device),
            Arc::clone(&store),
            config.dispatch.clone(),
            config.device.inverted,
        );
        let price_client = PriceClient::new(
            &config.sources.price_url,
            &config.sources.price_region,
            config.sources.timeout_secs,
        );
        let forecast_client = ForecastClient::new(
            &config.sources.forecast_url,
            config.sources.latitude,
            config.sources.longitude,
            config.sources.timeout_secs,
        );
        let stagger_minute = refresh::stagger_minute(&config.device.endpoint);
        Self {
            device,
            store,
            dispatcher,
            price_client,
            forecast_client,
            config,
            stagger_minute,
            cycle_running: false,
            stats: LoopStats::default(),
        }
    }

    /// Run forever: wake on the configured interval until interrupted, then
    /// drop the pidfile so the watchdog sweeps the installed schedule.
    pub async fn run(&mut self) -> Result<()> {
        self.write_pidfile()?;
        log::info!(
            "control loop started, waking every {}s, stagger minute {}",
            self.config.daemon.wake_interval_secs,
            self.stagger_minute
        );

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.daemon.wake_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.wake().await;
                    self.stats.record(&outcome);
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("interrupted, shutting down");
                    break;
                }
            }
        }
        self.remove_pidfile();
        Ok(())
    }

    /// One wake: refresh decision plus at most one cycle.
    ///
    /// The guard makes overlapping wakes a no-op rather than queueing them.
    pub async fn wake(&mut self) -> CycleOutcome {
        if self.cycle_running {
            return CycleOutcome::Skipped;
        }
        self.cycle_running = true;
        let outcome = match self.wake_inner().await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("cycle failed: {e}");
                CycleOutcome::Skipped
            }
        };
        self.cycle_running = false;
        outcome
    }

    async fn wake_inner(&mut self) -> Result<CycleOutcome> {
        if !self.refresh_due().await? {
            return Ok(CycleOutcome::Skipped);
        }
        self.run_cycle().await
    }

    /// Whether persisted timestamps say it is time to fetch again.
    async fn refresh_due(&self) -> Result<bool> {
        let state = store::load_state(&*self.store).await?;
        let clock = self.device.clock().await.unwrap_or_default();
        // The decision can run on host time; planning itself insists on the
        // device clock
        let (now, offset) = if clock.is_valid() {
            (clock.unixtime, clock.utc_offset_secs)
        } else {
            (Utc::now().timestamp(), 0)
        };

        let heating = &self.config.heating;
        let forecast_driven = heating.forecast.enabled && heating.period_hours > 0;
        let due = refresh::needs_refresh(
            now,
            state.last_price_ts,
            offset,
            self.stagger_minute,
            heating.period_hours,
            forecast_driven,
        ) || (forecast_driven
            && refresh::needs_refresh(
                now,
                state.last_forecast_ts,
                offset,
                self.stagger_minute,
                heating.period_hours,
                true,
            ));
        Ok(due)
    }

    /// One full cycle: failsafe, clock, fetches, plan, reconcile.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        // The failsafe timer is armed before any network-dependent step so
        // the relay auto-reverts no matter what fails later
        self.arm_failsafe().await?;

        let clock = match self.wait_for_clock().await {
            Ok(clock) => clock,
            Err(SpotheatError::ClockNotReady) => {
                log::warn!("device clock never became ready, installing fallback plan");
                return self.dispatch_fallback(CycleStamps::default()).await;
            }
            Err(e) => return Err(e),
        };

        let (plan, stamps, degraded) = self.build_plan(clock).await;
        let result = self.dispatcher.reconcile(&plan, stamps).await?;
        log_reconcile(&plan, &result);

        Ok(if degraded {
            CycleOutcome::Degraded
        } else {
            CycleOutcome::Refreshed
        })
    }

    /// Compute the day's plan from live data, degrading to the fixed
    /// fallback on any fetch problem.
    pub async fn build_plan(&self, clock: DeviceClock) -> (SchedulePlan, CycleStamps, bool) {
        let offset = floor_offset_to_hours(clock.utc_offset_secs);
        let now = clock.unixtime;
        let now_local_hour = plan::hour_of_day(now, offset);
        let heating = &self.config.heating;

        let mut stamps = CycleStamps::default();

        // Forecast first: it only shapes the duration, but its failure
        // degrades the whole cycle just like a price failure
        let mut required_override = None;
        if heating.forecast.enabled && heating.period_hours > 0 {
            match self
                .forecast_client
                .fetch_mean(heating.period_hours)
                .await
            {
                Ok(mean_temp) => {
                    let hours = forecast::required_hours(
                        mean_temp,
                        heating.period_hours,
                        heating.forecast.curve_shift,
                        heating.forecast.power_factor,
                        heating.forecast.baseline_temp,
                    );
                    log::info!(
                        "forecast mean {mean_temp:.1} C -> {hours} heating hours per period"
                    );
                    required_override = Some(hours);
                    stamps.forecast_ts = Some(now);
                }
                Err(e) => {
                    log::warn!("forecast fetch failed, using fallback plan: {e}");
                    return (plan::fallback_plan(heating), stamps, true);
                }
            }
        }

        let (start, end) = prices::day_window(
            chrono::DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now),
            offset,
        );
        let rows = match self.price_client.fetch(start, end).await {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("price fetch failed, using fallback plan: {e}");
                return (plan::fallback_plan(heating), stamps, true);
            }
        };
        stamps.price_ts = Some(now);

        let points = prices::normalize(&rows, self.config.tariff.provider, offset);
        let plan = plan::plan(&points, heating, required_override, now_local_hour, offset);
        (plan, stamps, false)
    }

    async fn dispatch_fallback(&self, stamps: CycleStamps) -> Result<CycleOutcome> {
        let plan = plan::fallback_plan(&self.config.heating);
        let result = self.dispatcher.reconcile(&plan, stamps).await?;
        log_reconcile(&plan, &result);
        Ok(CycleOutcome::Degraded)
    }

    /// Arm the device-local auto-revert timer.
    ///
    /// The +2s margin keeps back-to-back scheduled hours from flapping the
    /// relay at the boundary.
    async fn arm_failsafe(&self) -> Result<()> {
        let duration = self.config.daemon.failsafe_minutes * 60 + 2;
        self.device
            .set_failsafe_timer(duration, self.config.device.inverted)
            .await
    }

    /// Poll the device clock a bounded number of times.
    async fn wait_for_clock(&self) -> Result<DeviceClock> {
        let attempts = self.config.daemon.clock_attempts.max(1);
        for attempt in 0..attempts {
            match self.device.clock().await {
                Ok(clock) if clock.is_valid() => return Ok(clock),
                Ok(_) => log::debug!("device has no time yet (attempt {attempt})"),
                Err(e) => log::debug!("clock read failed (attempt {attempt}): {e}"),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(self.config.daemon.clock_poll_secs)).await;
            }
        }
        Err(SpotheatError::ClockNotReady)
    }

    fn write_pidfile(&self) -> Result<()> {
        let path = &self.config.daemon.pidfile;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, std::process::id().to_string())?;
        Ok(())
    }

    fn remove_pidfile(&self) {
        let path = &self.config.daemon.pidfile;
        if let Err(e) = fs::remove_file(path) {
            log::warn!("could not remove pidfile {}: {e}", path.display());
        }
    }
}

fn log_reconcile(plan: &SchedulePlan, result: &ReconcileResult) {
    let hours: Vec<String> = plan.hours().iter().map(|h| format!("{h:02}:00")).collect();
    log::info!(
        "plan covers [{}]; {} created, {} deleted, {} already in place",
        hours.join(", "),
        result.created.len(),
        result.deleted.len(),
        result.skipped
    );
}

/// Read the controller pid recorded by a running daemon.
pub fn read_pidfile(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
