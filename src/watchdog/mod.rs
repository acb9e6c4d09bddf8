//! Fail-safe watchdog
//!
//! Runs as its own process, decoupled from the control loop's lifetime.
//! When it observes that the controller has stopped - pidfile gone, or the
//! recorded pid no longer alive - it deletes every schedule handle the
//! controller had installed and clears the persisted handle set. The relay
//! is never left ticking a stale schedule just because its planner died.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, DispatchConfig};
use crate::daemon::read_pidfile;
use crate::device::DeviceChannel;
use crate::dispatch::{DispatchTask, Dispatcher, TaskOp};
use crate::error::Result;
use crate::store::{self, KvStore, PersistedState};

/// Result of one cleanup sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Nothing was installed; nothing to do
    Idle,
    /// Handles were swept
    Cleaned { deleted: usize, failed: usize },
}

/// Tracks controller liveness transitions.
///
/// The watchdog only reacts to a running-to-stopped edge; starting up
/// against an already-stopped controller must not trigger a sweep of
/// state another run may still own.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Liveness {
    armed: bool,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one liveness observation; true means the controller just
    /// stopped.
    pub fn observe(&mut self, alive: bool) -> bool {
        if alive {
            self.armed = true;
            false
        } else if self.armed {
            self.armed = false;
            true
        } else {
            false
        }
    }
}

/// Supervises the controller process and sweeps after it.
pub struct Watchdog<D, S> {
    store: Arc<S>,
    dispatcher: Dispatcher<D, S>,
    pidfile: PathBuf,
    poll_interval: Duration,
}

impl<D, S> Watchdog<D, S>
where
    D: DeviceChannel + 'static,
    S: KvStore,
{
    pub fn new(config: &Config, device: Arc<D>, store: Arc<S>) -> Self {
        Self::with_dispatch(
            device,
            store,
            config.dispatch.clone(),
            config.daemon.pidfile.clone(),
            Duration::from_secs(config.daemon.watchdog_poll_secs),
        )
    }

    pub fn with_dispatch(
        device: Arc<D>,
        store: Arc<S>,
        dispatch: DispatchConfig,
        pidfile: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        let dispatcher = Dispatcher::new(device, Arc::clone(&store), dispatch, false);
        Self {
            store,
            dispatcher,
            pidfile,
            poll_interval,
        }
    }

    /// Watch the controller until interrupted, sweeping on every
    /// running-to-stopped transition.
    pub async fn run(&self) -> Result<()> {
        log::info!(
            "watchdog started, observing {} every {:?}",
            self.pidfile.display(),
            self.poll_interval
        );
        let mut liveness = Liveness::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    if liveness.observe(controller_alive(&self.pidfile)) {
                        log::warn!("controller stopped, sweeping installed schedule");
                        match self.on_controller_stopped().await {
                            Ok(outcome) => log::info!("sweep finished: {outcome:?}"),
                            Err(e) => log::error!("sweep failed: {e}"),
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("watchdog interrupted, exiting");
                    return Ok(());
                }
            }
        }
    }

    /// Delete every persisted handle and clear the handle set.
    ///
    /// Deletions run under the same bounded-concurrency drain as normal
    /// dispatch. Individual failures are logged and skipped; the handle set
    /// is cleared regardless, and any entry that survives is removed by the
    /// next reconcile.
    pub async fn on_controller_stopped(&self) -> Result<SweepOutcome> {
        let state = store::load_state(&*self.store).await?;
        if !state.has_installed() {
            return Ok(SweepOutcome::Idle);
        }

        let queue: VecDeque<DispatchTask> = state
            .installed_handles
            .iter()
            .enumerate()
            .map(|(i, &handle)| DispatchTask::new(TaskOp::Delete(handle), i as u64))
            .collect();
        let outcome = self.dispatcher.execute(queue).await;

        let mut cleared = PersistedState::empty();
        cleared.schema_version = state.schema_version;
        store::save_state(&*self.store, &cleared).await?;

        Ok(SweepOutcome::Cleaned {
            deleted: outcome.deleted.len(),
            failed: outcome.failed.len(),
        })
    }
}

/// Whether the controller behind the pidfile is alive.
pub fn controller_alive(pidfile: &Path) -> bool {
    match read_pidfile(pidfile) {
        Some(pid) => process_exists(pid),
        None => false,
    }
}

/// Liveness check through the proc filesystem.
fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Remove any schedule the controller may have left, regardless of
/// liveness. Backs the manual `cleanup` command.
pub async fn sweep_now<D, S>(config: &Config, device: Arc<D>, store: Arc<S>) -> Result<SweepOutcome>
where
    D: DeviceChannel + 'static,
    S: KvStore,
{
    let watchdog = Watchdog::new(config, device, store);
    watchdog.on_controller_stopped().await
}
