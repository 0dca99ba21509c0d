use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use stagehand_core::config::WorkflowConfig;
use stagehand_core::errors::ApplicationError;

use crate::scheduler::AutoApprovalScheduler;
use crate::watchdog::EscalationWatchdog;

/// A periodic pass that takes "now" from the wall clock.
#[async_trait]
pub trait SweepJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Returns the number of items the pass acted on.
    async fn run_once(&self) -> Result<usize, ApplicationError>;
}

#[async_trait]
impl SweepJob for AutoApprovalScheduler {
    fn name(&self) -> &'static str {
        "auto_approval"
    }

    async fn run_once(&self) -> Result<usize, ApplicationError> {
        Ok(self.sweep(Utc::now()).await?.stats.advanced)
    }
}

#[async_trait]
impl SweepJob for EscalationWatchdog {
    fn name(&self) -> &'static str {
        "escalation"
    }

    async fn run_once(&self) -> Result<usize, ApplicationError> {
        Ok(self.sweep(Utc::now()).await?.stats.escalated)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepSchedule {
    pub auto_approval: Duration,
    pub escalation: Duration,
}

impl SweepSchedule {
    pub fn from_config(workflow: &WorkflowConfig) -> Self {
        Self {
            auto_approval: Duration::from_secs(workflow.auto_approval_sweep_secs.max(1)),
            escalation: Duration::from_secs(workflow.escalation_sweep_secs.max(1)),
        }
    }
}

pub struct BackgroundRuntime {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl BackgroundRuntime {
    /// Signals every loop and waits up to `grace` for in-flight passes to finish.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let joined = tokio::time::timeout(grace, async {
            for handle in self.handles {
                if let Err(error) = handle.await {
                    warn!(
                        event_name = "system.runtime.join_failed",
                        correlation_id = "shutdown",
                        error = %error,
                        "background sweep task ended abnormally"
                    );
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                event_name = "system.runtime.shutdown_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "background sweeps did not stop within the grace period"
            );
        }
    }
}

pub fn spawn_sweeps(
    scheduler: Arc<AutoApprovalScheduler>,
    watchdog: Arc<EscalationWatchdog>,
    schedule: SweepSchedule,
) -> BackgroundRuntime {
    let (shutdown, receiver) = watch::channel(false);
    let handles = vec![
        tokio::spawn(run_loop(scheduler, schedule.auto_approval, receiver.clone())),
        tokio::spawn(run_loop(watchdog, schedule.escalation, receiver)),
    ];
    BackgroundRuntime { handles, shutdown }
}

async fn run_loop<J: SweepJob>(job: Arc<J>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        event_name = "system.runtime.sweep_started",
        correlation_id = "bootstrap",
        sweep = job.name(),
        period_secs = period.as_secs(),
        "background sweep started"
    );

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(error) = job.run_once().await {
                    warn!(
                        event_name = "system.runtime.sweep_failed",
                        sweep = job.name(),
                        error = %error,
                        "sweep pass failed; retrying next tick"
                    );
                }
            }
        }
    }

    info!(
        event_name = "system.runtime.sweep_stopped",
        correlation_id = "shutdown",
        sweep = job.name(),
        "background sweep stopped"
    );
}
