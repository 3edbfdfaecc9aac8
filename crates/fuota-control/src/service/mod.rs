//! Service lifecycle management.
//!
//! Provides the worker runner with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::FuotaConfig;
use crate::error::FuotaResult;
use crate::executor::{HttpStepAction, StepAction, StepExecutor};
use crate::scheduler::ClaimScheduler;
use crate::state::{RetryPolicy, StateMachine, TimingPolicy};
use crate::store::{DeploymentStore, PostgresStore};

/// The FUOTA worker service.
///
/// Manages the lifecycle of one worker process, including:
/// - Database connections
/// - The collaborator bridge
/// - The claim scheduler loop
/// - Signal handling and graceful shutdown
pub struct WorkerService {
    config: FuotaConfig,
    cancel: CancellationToken,
}

impl WorkerService {
    /// Create a new worker service with the given configuration.
    #[must_use]
    pub fn new(config: FuotaConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the worker service.
    ///
    /// This will:
    /// 1. Connect to the database
    /// 2. Create the HTTP step action
    /// 3. Run the claim scheduler until a shutdown signal arrives
    pub async fn run(&self) -> FuotaResult<()> {
        let store: Arc<dyn DeploymentStore> =
            Arc::new(PostgresStore::new(&self.config.database).await?);
        info!("connected to PostgreSQL");

        let action: Arc<dyn StepAction> = Arc::new(HttpStepAction::new(&self.config.collaborator)?);
        info!(url = %self.config.collaborator.url, "collaborator bridge configured");

        self.run_with(store, action).await;

        info!("worker shutdown complete");
        Ok(())
    }

    /// Run the claim scheduler over the given store and action until shutdown.
    pub async fn run_with(&self, store: Arc<dyn DeploymentStore>, action: Arc<dyn StepAction>) {
        let executor = StepExecutor::new(action, self.config.scheduler.step_timeout());
        let machine = StateMachine::new(
            RetryPolicy::from(&self.config.retry),
            TimingPolicy::from(&self.config.timing),
        );
        let scheduler = ClaimScheduler::new(store, executor, machine, &self.config.scheduler);

        let signals = tokio::spawn(shutdown_signal(self.cancel.clone()));
        scheduler.run(self.cancel.clone()).await;
        signals.abort();
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            return;
        }
    }

    cancel.cancel();
}
