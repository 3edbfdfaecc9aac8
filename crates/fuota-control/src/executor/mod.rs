//! Step execution.
//!
//! Every state except `DONE` implies one side effect on the network server:
//! linking the multicast group, setting up the fragmentation session,
//! enqueueing the payload and so on. Those side effects live behind the
//! [`StepAction`] trait. The [`StepExecutor`] calls the action under a timeout
//! and classifies whatever comes back into a [`StepOutcome`] for the state
//! machine.

mod http;

pub use http::HttpStepAction;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::FuotaResult;
use crate::state::StepOutcome;
use crate::types::{
    DevEui, DeploymentId, DeploymentState, DeviceOutcome, FuotaDeployment, MulticastGroupId,
};

/// Everything an action needs to perform the side effect of a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRequest {
    /// State whose side effect is requested.
    pub state: DeploymentState,
    /// Deployment the step belongs to.
    pub deployment_id: DeploymentId,
    /// Multicast group used for delivery.
    pub multicast_group_id: Option<MulticastGroupId>,
    /// Firmware image.
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    /// Fragmentation matrix selector.
    pub fragmentation_matrix: u8,
    /// Opaque firmware descriptor.
    pub descriptor: [u8; 4],
    /// Fragment size in bytes.
    pub frag_size: u32,
    /// Number of redundancy fragments.
    pub redundancy: u32,
    /// Block acknowledgement delay exponent.
    pub block_ack_delay: u32,
    /// Multicast session timeout exponent.
    pub multicast_timeout: u32,
    /// Per-device answer timeout in milliseconds.
    pub unicast_timeout_ms: u64,
    /// Devices without a terminal outcome.
    pub pending_devices: Vec<DevEui>,
}

impl StepRequest {
    /// Build the request for the deployment's current state.
    #[must_use]
    pub fn new(deployment: &FuotaDeployment, pending_devices: Vec<DevEui>) -> Self {
        Self {
            state: deployment.state,
            deployment_id: deployment.id,
            multicast_group_id: deployment.multicast_group_id,
            payload: deployment.payload.clone(),
            fragmentation_matrix: deployment.fragmentation_matrix,
            descriptor: deployment.descriptor,
            frag_size: deployment.frag_size,
            redundancy: deployment.redundancy,
            block_ack_delay: deployment.block_ack_delay,
            multicast_timeout: deployment.multicast_timeout,
            unicast_timeout_ms: u64::try_from(deployment.unicast_timeout.as_millis())
                .unwrap_or(u64::MAX),
            pending_devices,
        }
    }
}

/// What the action made of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// The side effect is done.
    Completed,
    /// The side effect is still in progress.
    Pending,
    /// The side effect can never succeed.
    Rejected,
}

/// Terminal outcome a device reported during a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReport {
    /// Reporting device.
    pub dev_eui: DevEui,
    /// Reported outcome.
    pub outcome: DeviceOutcome,
    /// Error details, empty on success.
    #[serde(default)]
    pub message: String,
}

impl DeviceReport {
    /// A successful device.
    #[must_use]
    pub fn success(dev_eui: DevEui) -> Self {
        Self {
            dev_eui,
            outcome: DeviceOutcome::Success,
            message: String::new(),
        }
    }

    /// A failed device.
    #[must_use]
    pub fn error(dev_eui: DevEui, message: impl Into<String>) -> Self {
        Self {
            dev_eui,
            outcome: DeviceOutcome::Error,
            message: message.into(),
        }
    }
}

/// Answer of a [`StepAction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    /// Step status.
    pub status: ActionStatus,
    /// Explanation for pending or rejected steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Device outcomes learnt during the step.
    #[serde(default)]
    pub devices: Vec<DeviceReport>,
}

impl ActionReport {
    /// The step completed.
    #[must_use]
    pub const fn completed() -> Self {
        Self {
            status: ActionStatus::Completed,
            reason: None,
            devices: Vec::new(),
        }
    }

    /// The step is still in progress.
    #[must_use]
    pub fn pending(reason: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Pending,
            reason: Some(reason.into()),
            devices: Vec::new(),
        }
    }

    /// The step can never succeed.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Rejected,
            reason: Some(reason.into()),
            devices: Vec::new(),
        }
    }

    /// Attach device outcomes.
    #[must_use]
    pub fn with_devices(mut self, devices: Vec<DeviceReport>) -> Self {
        self.devices = devices;
        self
    }
}

/// Side effect performer, keyed by the request's state.
///
/// Implementations return [`FuotaError::Collaborator`](crate::FuotaError::Collaborator)
/// or [`FuotaError::Http`](crate::FuotaError::Http) for failures worth
/// retrying. Any other error finishes the deployment.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Perform the side effect for `request.state`.
    async fn execute(&self, request: &StepRequest) -> FuotaResult<ActionReport>;
}

/// Classified result of one step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// Outcome for the state machine.
    pub outcome: StepOutcome,
    /// Device outcomes to record before deciding the transition.
    pub devices: Vec<DeviceReport>,
}

/// Runs a [`StepAction`] for a deployment's current state.
#[derive(Clone)]
pub struct StepExecutor {
    action: Arc<dyn StepAction>,
    timeout: Duration,
}

impl StepExecutor {
    /// Create an executor bounding each call by `timeout`.
    #[must_use]
    pub fn new(action: Arc<dyn StepAction>, timeout: Duration) -> Self {
        Self { action, timeout }
    }

    /// Execute the deployment's current step.
    ///
    /// Never fails: collaborator errors and timeouts become outcomes.
    pub async fn execute(
        &self,
        deployment: &FuotaDeployment,
        pending_devices: Vec<DevEui>,
    ) -> StepResult {
        let request = StepRequest::new(deployment, pending_devices);
        let state = deployment.state;

        let report = match tokio::time::timeout(self.timeout, self.action.execute(&request)).await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) if e.is_transient() => {
                warn!(
                    deployment_id = %deployment.id,
                    state = %state,
                    error = %e,
                    "step failed, will retry"
                );
                return StepResult {
                    outcome: StepOutcome::retry(e.to_string()),
                    devices: Vec::new(),
                };
            }
            Ok(Err(e)) => {
                warn!(
                    deployment_id = %deployment.id,
                    state = %state,
                    error = %e,
                    "step failed permanently"
                );
                return StepResult {
                    outcome: StepOutcome::fatal(e.to_string()),
                    devices: Vec::new(),
                };
            }
            Err(_) => {
                warn!(
                    deployment_id = %deployment.id,
                    state = %state,
                    timeout = ?self.timeout,
                    "step timed out, will retry"
                );
                return StepResult {
                    outcome: StepOutcome::retry(format!("timed out after {:?}", self.timeout)),
                    devices: Vec::new(),
                };
            }
        };

        debug!(
            deployment_id = %deployment.id,
            state = %state,
            status = ?report.status,
            devices = report.devices.len(),
            "step executed"
        );

        let outcome = match report.status {
            ActionStatus::Completed => StepOutcome::Advance,
            ActionStatus::Pending => {
                StepOutcome::retry(report.reason.unwrap_or_else(|| "step pending".to_owned()))
            }
            ActionStatus::Rejected => StepOutcome::fatal(
                report
                    .reason
                    .unwrap_or_else(|| "rejected by collaborator".to_owned()),
            ),
        };

        StepResult {
            outcome,
            devices: report.devices,
        }
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
