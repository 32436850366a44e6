//! Run-once and daemon loop controller.
//!
//! Every daemon (replicator, reconstructor, auditor, updater) is a [`Pass`]
//! driven by the same explicit state machine:
//!
//! ```text
//!   Idle ──▶ RunningPass ──▶ CoolingDown ──▶ RunningPass ...
//!                 │                │
//!                 └── shutdown ────┴──▶ Idle
//! ```
//!
//! In run-once mode a single pass runs and the controller returns to
//! `Idle`. In daemon mode passes repeat with `interval` between them; a
//! reload request during cool-down reloads rings, and a pass that ended on
//! a ring change is followed immediately by a fresh pass.

use crate::auditor::Auditor;
use crate::scheduler::{JobScheduler, PassFilter};
use crate::shutdown::ShutdownCoordinator;
use crate::types::{PassAbort, PassStatistics};
use crate::updater::UpdateSweeper;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// State of the loop controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    RunningPass,
    CoolingDown,
}

/// One repeatable sweep of a daemon.
#[async_trait]
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_pass(&self) -> PassStatistics;

    /// Re-read external state such as rings.
    fn reload(&self) {}
}

/// A scheduler pass restricted by a [`PassFilter`].
pub struct SchedulerPass {
    scheduler: JobScheduler,
    filter: PassFilter,
}

impl SchedulerPass {
    pub fn new(scheduler: JobScheduler, filter: PassFilter) -> Self {
        Self { scheduler, filter }
    }
}

#[async_trait]
impl Pass for SchedulerPass {
    fn name(&self) -> &'static str {
        self.scheduler.name()
    }

    async fn run_pass(&self) -> PassStatistics {
        self.scheduler.run_pass(&self.filter).await
    }

    fn reload(&self) {
        self.scheduler.reload_rings();
    }
}

#[async_trait]
impl Pass for Auditor {
    fn name(&self) -> &'static str {
        "auditor"
    }

    async fn run_pass(&self) -> PassStatistics {
        Auditor::run_pass(self).await
    }
}

#[async_trait]
impl Pass for UpdateSweeper {
    fn name(&self) -> &'static str {
        "updater"
    }

    async fn run_pass(&self) -> PassStatistics {
        UpdateSweeper::run_pass(self).await
    }
}

/// Totals over every pass a controller ran.
#[derive(Debug, Clone, Default)]
pub struct DaemonReport {
    pub passes: u64,
    pub totals: PassStatistics,
}

/// Drives a [`Pass`] once or forever.
pub struct Daemon<P: Pass> {
    pass: P,
    interval: Duration,
    shutdown: ShutdownCoordinator,
    state: watch::Sender<DaemonState>,
}

impl<P: Pass> Daemon<P> {
    pub fn new(pass: P, interval: Duration, shutdown: ShutdownCoordinator) -> Self {
        let (state, _) = watch::channel(DaemonState::Idle);
        Self {
            pass,
            interval,
            shutdown,
            state,
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    fn transition(&self, next: DaemonState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(daemon = self.pass.name(), from = ?previous, to = ?next, "Daemon state change");
        }
    }

    /// Run a single pass.
    pub async fn run_once(&self) -> PassStatistics {
        self.transition(DaemonState::RunningPass);
        let stats = self.pass.run_pass().await;
        self.transition(DaemonState::Idle);
        stats
    }

    /// Run passes until shutdown.
    ///
    /// A pass in progress when shutdown arrives is cancelled; the partial
    /// work it committed is durable because every write is atomic.
    pub async fn run_forever(&self) -> DaemonReport {
        let name = self.pass.name();
        let mut report = DaemonReport::default();
        info!(daemon = name, interval_secs = self.interval.as_secs(), "Daemon started");

        while !self.shutdown.is_shutting_down() {
            self.transition(DaemonState::RunningPass);
            let stats = tokio::select! {
                stats = self.pass.run_pass() => stats,
                _ = self.shutdown.wait_for_shutdown() => {
                    info!(daemon = name, "Pass cancelled by shutdown");
                    report.totals.aborted = Some(PassAbort::Shutdown);
                    break;
                }
            };
            report.passes += 1;
            report.totals.merge(&stats);

            if !stats.is_success() {
                warn!(
                    daemon = name,
                    failed = stats.failed,
                    aborted = ?stats.aborted,
                    "Pass finished with failures; next pass scheduled"
                );
            }
            if stats.aborted == Some(PassAbort::StaleRing) {
                info!(daemon = name, "Ring changed; starting next pass immediately");
                continue;
            }

            self.transition(DaemonState::CoolingDown);
            if !self.cool_down().await {
                break;
            }
        }

        self.transition(DaemonState::Idle);
        info!(
            daemon = name,
            passes = report.passes,
            attempted = report.totals.attempted,
            failed = report.totals.failed,
            "Daemon stopped"
        );
        report
    }

    /// Wait out the interval, serving reload requests. Returns false on shutdown.
    async fn cool_down(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        let sleep = tokio::time::sleep(self.interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait_for_shutdown() => return false,
                _ = &mut sleep => return true,
                _ = self.shutdown.wait_for_reload() => {
                    debug!(
                        daemon = self.pass.name(),
                        remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Reload requested during cool-down"
                    );
                    self.pass.reload();
                }
            }
        }
    }
}
