//! Claim scheduler.
//!
//! Each cycle claims a batch of due deployments inside one transaction, runs
//! their steps concurrently, persists every transition on that transaction
//! and commits. Several workers may run the scheduler against the same store;
//! row locks guarantee that a deployment is advanced by one worker at a time.
//!
//! Each deployment is persisted under its own savepoint. A deployment whose
//! writes fail is rolled back alone and retried on a later cycle; the rest of
//! the batch still commits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::FuotaResult;
use crate::executor::{StepExecutor, StepResult};
use crate::state::{StateMachine, StepOutcome, TransitionContext};
use crate::store::{DeploymentStore, StoreTransaction};
use crate::tracker::record_reports;
use crate::types::{now, FuotaDeployment};

/// Counters for one claim cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Deployments claimed.
    pub claimed: usize,
    /// Deployments moved to their next state, excluding those finished.
    pub advanced: usize,
    /// Deployments rescheduled in the same state.
    pub retried: usize,
    /// Deployments that reached `DONE`.
    pub finished: usize,
    /// Device outcomes recorded from step reports.
    pub device_outcomes: u64,
    /// Deployments left unchanged because their rows could not be read or
    /// written.
    pub failed: usize,
}

impl CycleSummary {
    fn absorb(&mut self, other: Self) {
        self.advanced += other.advanced;
        self.retried += other.retried;
        self.finished += other.finished;
        self.device_outcomes += other.device_outcomes;
        self.failed += other.failed;
    }
}

/// Periodically claims and advances due deployments.
pub struct ClaimScheduler {
    store: Arc<dyn DeploymentStore>,
    executor: StepExecutor,
    machine: StateMachine,
    batch_size: u32,
    poll_interval: Duration,
}

impl ClaimScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        executor: StepExecutor,
        machine: StateMachine,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            machine,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
        }
    }

    /// Run cycles on the poll interval until `cancel` fires.
    ///
    /// A failed cycle is logged and rolled back; the next tick proceeds. A
    /// cycle in progress when cancellation arrives runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            batch_size = self.batch_size,
            poll_interval = ?self.poll_interval,
            "claim scheduler started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(summary) if summary.claimed > 0 => {
                            info!(
                                claimed = summary.claimed,
                                advanced = summary.advanced,
                                retried = summary.retried,
                                finished = summary.finished,
                                failed = summary.failed,
                                "claim cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "claim cycle failed"),
                    }
                }
            }
        }

        info!("claim scheduler stopped");
    }

    /// Run a single cycle at the current time.
    pub async fn run_once(&self) -> FuotaResult<CycleSummary> {
        self.run_once_at(now()).await
    }

    /// Run a single cycle as if the current time were `at`.
    ///
    /// A store error on one deployment discards only that deployment's
    /// writes. Errors outside any single deployment, such as a failed claim
    /// or commit, roll back the whole cycle and release its claims.
    pub async fn run_once_at(&self, at: DateTime<Utc>) -> FuotaResult<CycleSummary> {
        let mut tx = self.store.begin().await?;
        let claimed = tx.claim_due(self.batch_size, at).await?;

        let mut summary = CycleSummary {
            claimed: claimed.len(),
            ..CycleSummary::default()
        };
        if claimed.is_empty() {
            tx.commit().await?;
            return Ok(summary);
        }

        let mut work = Vec::with_capacity(claimed.len());
        for deployment in claimed {
            debug!(
                deployment_id = %deployment.id,
                state = %deployment.state,
                "deployment claimed"
            );
            match tx.pending_devices(&deployment.id).await {
                Ok(pending) => work.push((deployment, pending)),
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        deployment_id = %deployment.id,
                        error = %e,
                        "pending devices unreadable, deployment skipped"
                    );
                }
            }
        }

        let results = join_all(
            work.iter()
                .map(|(deployment, pending)| self.executor.execute(deployment, pending.clone())),
        )
        .await;

        for ((mut deployment, _), result) in work.into_iter().zip(results) {
            let id = deployment.id;
            tx.savepoint().await?;
            match self.persist(tx.as_mut(), &mut deployment, result, at).await {
                Ok(progress) => {
                    tx.release_savepoint().await?;
                    summary.absorb(progress);
                }
                Err(e) => {
                    tx.rollback_to_savepoint().await?;
                    summary.failed += 1;
                    error!(deployment_id = %id, error = %e, "deployment step not persisted");
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn persist(
        &self,
        tx: &mut dyn StoreTransaction,
        deployment: &mut FuotaDeployment,
        result: StepResult,
        at: DateTime<Utc>,
    ) -> FuotaResult<CycleSummary> {
        let mut summary = CycleSummary {
            device_outcomes: record_reports(tx, &deployment.id, &result.devices).await?,
            ..CycleSummary::default()
        };

        let pending_devices = u64::try_from(tx.pending_devices(&deployment.id).await?.len())
            .unwrap_or(u64::MAX);
        let ctx = TransitionContext {
            now: at,
            pending_devices,
        };
        let transition = self.machine.transition(deployment, &result.outcome, &ctx);

        if let Some(message) = &transition.fail_outstanding {
            let failed = tx.fail_pending_devices(&deployment.id, message).await?;
            warn!(
                deployment_id = %deployment.id,
                state = %deployment.state,
                failed_devices = failed,
                reason = %message,
                "deployment forced to done"
            );
        }

        let previous = deployment.state;
        transition.apply(deployment);
        tx.update(deployment).await?;

        if transition.is_done() {
            summary.finished += 1;
            if transition.fail_outstanding.is_none() {
                info!(deployment_id = %deployment.id, "deployment done");
            }
        } else if deployment.state == previous {
            summary.retried += 1;
            let reason = match &result.outcome {
                StepOutcome::Retry { reason } => reason.as_str(),
                _ => "devices pending",
            };
            info!(
                deployment_id = %deployment.id,
                state = %deployment.state,
                attempt = deployment.retry_count,
                next_step_after = %deployment.next_step_after,
                reason,
                "step retried"
            );
        } else {
            summary.advanced += 1;
            info!(
                deployment_id = %deployment.id,
                from = %previous,
                to = %deployment.state,
                next_step_after = %deployment.next_step_after,
                "deployment advanced"
            );
        }

        Ok(summary)
    }
}

impl std::fmt::Debug for ClaimScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimScheduler")
            .field("executor", &self.executor)
            .field("machine", &self.machine)
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
