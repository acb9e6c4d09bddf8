//! Schedule dispatch and reconciliation
//!
//! Turns a fresh `SchedulePlan` into the minimal set of idempotent device
//! operations: delete stale entries, skip anything already installed, create
//! what is missing. Operations run through a FIFO queue with a bounded
//! number in flight, drained by a poll loop; stale deletions always finish
//! before any creation starts, so the device never briefly holds duplicate
//! schedules. Failures are per-task: logged, retried a bounded number of
//! times for transport errors, then dropped for the next cycle to correct.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::config::DispatchConfig;
use crate::device::{DeviceChannel, ScheduleSpec, timespec};
use crate::error::Result;
use crate::plan::SchedulePlan;
use crate::store::{self, KvStore};

/// A single queued device operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOp {
    Create(ScheduleSpec),
    Delete(u32),
}

/// Queued operation plus its retry bookkeeping. Consumed exactly once.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub op: TaskOp,
    pub correlation_id: u64,
    pub attempts: u8,
}

impl DispatchTask {
    pub fn new(op: TaskOp, correlation_id: u64) -> Self {
        Self {
            op,
            correlation_id,
            attempts: 0,
        }
    }
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Handles of newly created entries
    pub created: Vec<u32>,
    /// Handles successfully deleted
    pub deleted: Vec<u32>,
    /// Desired entries already installed, left untouched
    pub skipped: usize,
    /// Operations dropped after exhausting their attempts
    pub failed: usize,
}

impl ReconcileResult {
    /// True when the pass issued no device mutations at all.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.failed == 0
    }
}

/// Outcome of draining one task batch.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Handles returned by successful creates
    pub created: Vec<u32>,
    /// Handles of successful deletes
    pub deleted: Vec<u32>,
    /// Tasks dropped after their last attempt
    pub failed: Vec<TaskOp>,
}

/// Fetch timestamps to persist with a successful commit. `None` keeps the
/// previous value, so degraded cycles do not mask stale data.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStamps {
    pub price_ts: Option<i64>,
    pub forecast_ts: Option<i64>,
}

/// Reconciles desired plans against the device under a concurrency budget.
pub struct Dispatcher<D, S> {
    device: Arc<D>,
    store: Arc<S>,
    config: DispatchConfig,
    /// Relay state a scheduled hour switches to (false for inverted wiring)
    relay_on: bool,
}

impl<D, S> Dispatcher<D, S>
where
    D: DeviceChannel + 'static,
    S: KvStore,
{
    pub fn new(device: Arc<D>, store: Arc<S>, config: DispatchConfig, inverted: bool) -> Self {
        Self {
            device,
            store,
            config,
            relay_on: !inverted,
        }
    }

    /// Device specs a plan renders to: one comma-joined entry, or none for
    /// an empty plan.
    pub fn desired_specs(&self, plan: &SchedulePlan) -> Vec<ScheduleSpec> {
        if plan.is_empty() {
            return Vec::new();
        }
        vec![ScheduleSpec {
            timespec: timespec::build(&plan.hours()),
            on: self.relay_on,
        }]
    }

    /// Reconcile the desired plan against the device and commit the result.
    ///
    /// Calling this twice with the same plan and no external changes is a
    /// no-op the second time.
    pub async fn reconcile(
        &self,
        desired: &SchedulePlan,
        stamps: CycleStamps,
    ) -> Result<ReconcileResult> {
        let mut state = store::load_state(&*self.store).await?;
        let installed = self.device.list_schedules().await?;
        let desired_specs = self.desired_specs(desired);

        let installed_by_handle: HashMap<u32, usize> = installed
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.handle, i))
            .collect();

        let mut correlation = 0u64;
        let mut next_id = || {
            correlation += 1;
            correlation
        };

        // Pass 1: keep owned handles that still match a desired spec, queue
        // deletion for the rest. Handles that vanished from the device are
        // simply forgotten.
        let mut kept: Vec<u32> = Vec::new();
        let mut matched = vec![false; desired_specs.len()];
        let mut deletes: VecDeque<DispatchTask> = VecDeque::new();
        for &handle in &state.installed_handles {
            let Some(&index) = installed_by_handle.get(&handle) else {
                log::debug!("handle {handle} no longer on device, dropping from state");
                continue;
            };
            let entry = &installed[index];
            match desired_specs
                .iter()
                .position(|spec| spec.matches(entry))
                .filter(|&i| !matched[i])
            {
                Some(i) => {
                    matched[i] = true;
                    kept.push(handle);
                }
                None => deletes.push_back(DispatchTask::new(TaskOp::Delete(handle), next_id())),
            }
        }

        // Pass 2: skip desired specs that some other entry already covers,
        // create the rest. Entries we do not own are never deleted, but they
        // do satisfy dedupe.
        let mut creates: VecDeque<DispatchTask> = VecDeque::new();
        let mut skipped = kept.len();
        for (i, spec) in desired_specs.iter().enumerate() {
            if matched[i] {
                continue;
            }
            if installed.iter().any(|entry| spec.matches(entry)) {
                skipped += 1;
                continue;
            }
            creates.push_back(DispatchTask::new(TaskOp::Create(spec.clone()), next_id()));
        }

        let projected = installed.len() - deletes.len() + creates.len();
        if projected > self.config.device_capacity {
            log::warn!(
                "plan needs {projected} schedule slots but the device holds {}, overflow creates will fail",
                self.config.device_capacity
            );
        }

        // Stale entries must be fully gone before creations begin
        let delete_outcome = self.execute(deletes).await;
        let create_outcome = self.execute(creates).await;

        // A failed delete means the entry is still installed; keep tracking
        // it so the next cycle retries
        for op in &delete_outcome.failed {
            if let TaskOp::Delete(handle) = op {
                kept.push(*handle);
            }
        }

        let result = ReconcileResult {
            created: create_outcome.created.clone(),
            deleted: delete_outcome.deleted,
            skipped,
            failed: delete_outcome.failed.len() + create_outcome.failed.len(),
        };

        state.installed_handles = kept;
        state.installed_handles.extend(create_outcome.created);
        state.installed_handles.sort_unstable();
        state.installed_handles.dedup();
        state.last_price_ts = stamps.price_ts.or(state.last_price_ts);
        state.last_forecast_ts = stamps.forecast_ts.or(state.last_forecast_ts);
        store::save_state(&*self.store, &state).await?;

        if !result.is_noop() {
            log::info!(
                "reconcile: {} created, {} deleted, {} skipped, {} failed",
                result.created.len(),
                result.deleted.len(),
                result.skipped,
                result.failed
            );
        }
        Ok(result)
    }

    /// Drain a task batch with at most the configured number of operations
    /// in flight.
    ///
    /// The queue is polled on a fixed tick: top up to the budget, sleep,
    /// reap completions, repeat until everything has finished. Transport
    /// failures requeue until their attempts run out; capacity failures are
    /// dropped immediately.
    pub async fn execute(&self, mut queue: VecDeque<DispatchTask>) -> DrainOutcome {
        let budget = self.config.max_in_flight();
        let tick = Duration::from_millis(self.config.poll_interval_ms);
        let mut in_flight: JoinSet<(DispatchTask, Result<Option<u32>>)> = JoinSet::new();
        let mut outcome = DrainOutcome::default();

        loop {
            while in_flight.len() < budget {
                let Some(mut task) = queue.pop_front() else {
                    break;
                };
                task.attempts += 1;
                let device = Arc::clone(&self.device);
                in_flight.spawn(async move {
                    let result = match &task.op {
                        TaskOp::Create(spec) => device.create_schedule(spec).await.map(Some),
                        TaskOp::Delete(handle) => {
                            device.delete_schedule(*handle).await.map(|()| None)
                        }
                    };
                    (task, result)
                });
            }

            if in_flight.is_empty() && queue.is_empty() {
                break;
            }

            tokio::time::sleep(tick).await;

            while let Some(joined) = in_flight.try_join_next() {
                match joined {
                    Ok((task, Ok(handle))) => match (&task.op, handle) {
                        (TaskOp::Create(_), Some(handle)) => outcome.created.push(handle),
                        (TaskOp::Delete(handle), _) => outcome.deleted.push(*handle),
                        (TaskOp::Create(_), None) => {}
                    },
                    Ok((task, Err(e))) => {
                        if e.is_retryable() && task.attempts < self.config.max_attempts {
                            log::warn!(
                                "task {} attempt {} failed, requeueing: {e}",
                                task.correlation_id,
                                task.attempts
                            );
                            queue.push_back(task);
                        } else {
                            log::warn!(
                                "task {} dropped after {} attempts: {e}",
                                task.correlation_id,
                                task.attempts
                            );
                            outcome.failed.push(task.op);
                        }
                    }
                    Err(join_error) => {
                        log::error!("dispatch task aborted: {join_error}");
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDeviceChannel;
    use crate::plan::{EntryReason, ScheduleEntry};
    use crate::store::MemoryKvs;

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            poll_interval_ms: 5,
            ..DispatchConfig::default()
        }
    }

    fn plan_for_hours(hours: &[u8]) -> SchedulePlan {
        SchedulePlan {
            entries: hours
                .iter()
                .map(|&hour| ScheduleEntry {
                    hour,
                    reason: EntryReason::CheapestInPeriod,
                    price: Some(10.0),
                })
                .collect(),
        }
    }

    fn dispatcher(
        device: &Arc<MockDeviceChannel>,
        store: &Arc<MemoryKvs>,
        config: DispatchConfig,
    ) -> Dispatcher<MockDeviceChannel, MemoryKvs> {
        Dispatcher::new(Arc::clone(device), Arc::clone(store), config, false)
    }

    #[tokio::test]
    async fn test_reconcile_installs_fresh_plan() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());

        let result = d
            .reconcile(&plan_for_hours(&[1, 2, 14]), CycleStamps::default())
            .await
            .unwrap();

        assert_eq!(result.created.len(), 1);
        assert_eq!(result.deleted.len(), 0);
        let installed = device.installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].timespec, "0 0 1,2,14 * * *");
        assert!(installed[0].on);

        let state = store::load_state(&*kvs).await.unwrap();
        assert_eq!(state.installed_handles, result.created);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());
        let plan = plan_for_hours(&[3, 4]);

        d.reconcile(&plan, CycleStamps::default()).await.unwrap();
        let creates_before = device.create_calls();
        let deletes_before = device.delete_calls();

        let second = d.reconcile(&plan, CycleStamps::default()).await.unwrap();

        assert!(second.is_noop());
        assert_eq!(second.skipped, 1);
        assert_eq!(device.create_calls(), creates_before);
        assert_eq!(device.delete_calls(), deletes_before);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_stale_entry() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());

        d.reconcile(&plan_for_hours(&[1, 2]), CycleStamps::default())
            .await
            .unwrap();
        let result = d
            .reconcile(&plan_for_hours(&[20, 21]), CycleStamps::default())
            .await
            .unwrap();

        assert_eq!(result.deleted.len(), 1);
        assert_eq!(result.created.len(), 1);
        let installed = device.installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].timespec, "0 0 20,21 * * *");
    }

    #[tokio::test]
    async fn test_reconcile_empty_plan_clears_owned_entries() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());

        d.reconcile(&plan_for_hours(&[5]), CycleStamps::default())
            .await
            .unwrap();
        let result = d
            .reconcile(&SchedulePlan::default(), CycleStamps::default())
            .await
            .unwrap();

        assert_eq!(result.deleted.len(), 1);
        assert!(device.installed().is_empty());
        let state = store::load_state(&*kvs).await.unwrap();
        assert!(!state.has_installed());
    }

    #[tokio::test]
    async fn test_foreign_entries_satisfy_dedupe_but_are_never_deleted() {
        let device = Arc::new(MockDeviceChannel::new());
        // Installed by hand on the device, not in our persisted state
        device.install(50, "0 0 1,2 * * *", true);
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());

        let result = d
            .reconcile(&plan_for_hours(&[1, 2]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.created.len(), 0);
        assert_eq!(result.skipped, 1);

        // A different plan must not delete the foreign entry
        let result = d
            .reconcile(&plan_for_hours(&[9]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.deleted.len(), 0);
        assert!(device.installed().iter().any(|e| e.handle == 50));
    }

    #[tokio::test]
    async fn test_inverted_relay_schedules_off() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let d = Dispatcher::new(Arc::clone(&device), Arc::clone(&kvs), fast_config(), true);

        d.reconcile(&plan_for_hours(&[1]), CycleStamps::default())
            .await
            .unwrap();
        assert!(!device.installed()[0].on);
    }

    #[tokio::test]
    async fn test_execute_respects_concurrency_budget() {
        let device = Arc::new(
            MockDeviceChannel::new().with_latency(Duration::from_millis(40)),
        );
        let kvs = Arc::new(MemoryKvs::new());
        let config = DispatchConfig {
            rpc_ceiling: 4,
            reserved_slots: 1,
            poll_interval_ms: 5,
            ..DispatchConfig::default()
        };
        let d = dispatcher(&device, &kvs, config);

        let queue: VecDeque<DispatchTask> = (0..10)
            .map(|i| {
                DispatchTask::new(
                    TaskOp::Create(ScheduleSpec {
                        timespec: format!("0 0 {i} * * *"),
                        on: true,
                    }),
                    i,
                )
            })
            .collect();

        let outcome = d.execute(queue).await;

        assert_eq!(outcome.created.len(), 10);
        assert!(outcome.failed.is_empty());
        assert!(
            device.max_in_flight_seen() <= 3,
            "saw {} in flight",
            device.max_in_flight_seen()
        );
    }

    #[tokio::test]
    async fn test_transport_failure_retries_then_drops() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let config = DispatchConfig {
            poll_interval_ms: 5,
            max_attempts: 3,
            ..DispatchConfig::default()
        };
        let d = dispatcher(&device, &kvs, config);

        // Fails all three attempts
        device.fail_next_creates(3);
        let result = d
            .reconcile(&plan_for_hours(&[7]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.created.is_empty());
        assert_eq!(device.create_calls(), 3);

        // Next cycle notices the gap and fills it
        let result = d
            .reconcile(&plan_for_hours(&[7]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.created.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_budget() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());

        device.fail_next_creates(1);
        let result = d
            .reconcile(&plan_for_hours(&[7]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.failed, 0);
        assert_eq!(device.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_capacity_failure_is_not_retried() {
        let device = Arc::new(MockDeviceChannel::new().with_capacity(1));
        device.install(1, "0 0 9 * * *", true);
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());

        let result = d
            .reconcile(&plan_for_hours(&[1]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.failed, 1);
        // One attempt only, no retry storm against a full device
        assert_eq!(device.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_handle_tracked() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let config = DispatchConfig {
            poll_interval_ms: 5,
            max_attempts: 1,
            ..DispatchConfig::default()
        };
        let d = dispatcher(&device, &kvs, config);

        d.reconcile(&plan_for_hours(&[1]), CycleStamps::default())
            .await
            .unwrap();
        device.fail_next_deletes(1);
        let result = d
            .reconcile(&plan_for_hours(&[2]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.failed, 1);

        // The undeleted entry is still tracked for the next pass
        let state = store::load_state(&*kvs).await.unwrap();
        assert_eq!(state.installed_handles.len(), 2);

        let result = d
            .reconcile(&plan_for_hours(&[2]), CycleStamps::default())
            .await
            .unwrap();
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(device.installed().len(), 1);
    }

    #[tokio::test]
    async fn test_stamps_preserved_when_absent() {
        let device = Arc::new(MockDeviceChannel::new());
        let kvs = Arc::new(MemoryKvs::new());
        let d = dispatcher(&device, &kvs, fast_config());

        d.reconcile(
            &plan_for_hours(&[1]),
            CycleStamps {
                price_ts: Some(1000),
                forecast_ts: Some(2000),
            },
        )
        .await
        .unwrap();

        // A degraded cycle commits without fresh stamps
        d.reconcile(&plan_for_hours(&[1]), CycleStamps::default())
            .await
            .unwrap();

        let state = store::load_state(&*kvs).await.unwrap();
        assert_eq!(state.last_price_ts, Some(1000));
        assert_eq!(state.last_forecast_ts, Some(2000));
    }
}
