//! Device participation bookkeeping.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{FuotaError, FuotaResult};
use crate::executor::DeviceReport;
use crate::store::{DeploymentStore, StoreTransaction};
use crate::types::{DevEui, DeploymentId, DeviceOutcome, Page, Participant};

/// Records per-device outcomes independently of the deployment's own state.
///
/// A participant moves from pending to success or error exactly once.
#[derive(Clone)]
pub struct ParticipationTracker {
    store: Arc<dyn DeploymentStore>,
}

impl ParticipationTracker {
    /// Create a tracker over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// Record a terminal outcome in its own transaction.
    ///
    /// Fails with `AlreadyTerminal` if the device already has an outcome and
    /// with `DeviceNotFound` if it is not enrolled.
    pub async fn record_outcome(
        &self,
        id: &DeploymentId,
        dev_eui: &DevEui,
        outcome: DeviceOutcome,
        message: &str,
    ) -> FuotaResult<()> {
        let mut tx = self.store.begin().await?;
        tx.record_device_outcome(id, dev_eui, outcome, message)
            .await?;
        tx.commit().await?;

        info!(
            deployment_id = %id,
            dev_eui = %dev_eui,
            state = %outcome.state(),
            "device outcome recorded"
        );
        Ok(())
    }

    /// Number of enrolled devices without a terminal outcome.
    pub async fn count_pending(&self, id: &DeploymentId) -> FuotaResult<u64> {
        self.store.pending_count(id).await
    }

    /// Number of devices enrolled in the deployment.
    pub async fn device_count(&self, id: &DeploymentId) -> FuotaResult<u64> {
        self.store.device_count(id).await
    }

    /// Participation records ordered by device name.
    pub async fn list_participants(
        &self,
        id: &DeploymentId,
        page: Page,
    ) -> FuotaResult<Vec<Participant>> {
        self.store.list_devices(id, page).await
    }
}

impl std::fmt::Debug for ParticipationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipationTracker").finish_non_exhaustive()
    }
}

/// Apply the device reports of a step inside the cycle's transaction.
///
/// Reports for devices that already have an outcome or are not enrolled are
/// skipped. Returns the number of outcomes recorded.
pub(crate) async fn record_reports(
    tx: &mut dyn StoreTransaction,
    id: &DeploymentId,
    reports: &[DeviceReport],
) -> FuotaResult<u64> {
    let mut recorded = 0;

    for report in reports {
        match tx
            .record_device_outcome(id, &report.dev_eui, report.outcome, &report.message)
            .await
        {
            Ok(()) => {
                recorded += 1;
                info!(
                    deployment_id = %id,
                    dev_eui = %report.dev_eui,
                    state = %report.outcome.state(),
                    "device outcome recorded"
                );
            }
            Err(FuotaError::AlreadyTerminal { state, .. }) => {
                debug!(
                    deployment_id = %id,
                    dev_eui = %report.dev_eui,
                    state,
                    "device outcome already recorded"
                );
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    deployment_id = %id,
                    dev_eui = %report.dev_eui,
                    "outcome reported for a device that is not enrolled"
                );
            }
            Err(e) => return Err(e),
        }
    }

    Ok(recorded)
}
