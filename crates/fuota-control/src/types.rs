//! Core types for fuota-control.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::FuotaError;

/// Current time truncated to the microsecond precision the store keeps.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Unique identifier for a FUOTA deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(Uuid);

impl DeploymentId {
    /// Wrap an existing UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a new random deployment ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the multicast group a deployment is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MulticastGroupId(Uuid);

impl MulticastGroupId {
    /// Wrap an existing UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MulticastGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// EUI-64 device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevEui([u8; 8]);

impl DevEui {
    /// Create an EUI from its eight bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Build an EUI from a persisted byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FuotaError> {
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            FuotaError::integrity(format!(
                "DevEUI must have length 8, got: {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for DevEui {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid DevEUI '{s}': {e}"))?;
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| format!("invalid DevEUI '{s}': expected 8 bytes"))?;
        Ok(Self(array))
    }
}

impl Serialize for DevEui {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DevEui {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a FUOTA deployment.
///
/// Variants are declared in rollout order; see [`crate::state`] for the
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    /// Multicast group is being set up on the devices.
    #[serde(rename = "MC_SETUP")]
    MulticastSetup,
    /// Fragmentation session is being set up on the devices.
    #[serde(rename = "FRAG_SESS_SETUP")]
    FragmentationSessionSetup,
    /// Class-C multicast session is being scheduled on the devices.
    #[serde(rename = "MC_SESS_C_SETUP")]
    MulticastSessionSetup,
    /// Firmware fragments are being enqueued for multicast transmission.
    Enqueue,
    /// Waiting for the multicast queue to be transmitted.
    WaitingTx,
    /// Payload transmitted; the multicast session is over.
    Transmitted,
    /// Fragmentation session status was requested from the devices.
    StatusRequested,
    /// Deployment finished.
    Done,
}

impl DeploymentState {
    /// Get the persisted tag for this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MulticastSetup => "MC_SETUP",
            Self::FragmentationSessionSetup => "FRAG_SESS_SETUP",
            Self::MulticastSessionSetup => "MC_SESS_C_SETUP",
            Self::Enqueue => "ENQUEUE",
            Self::WaitingTx => "WAITING_TX",
            Self::Transmitted => "TRANSMITTED",
            Self::StatusRequested => "STATUS_REQUESTED",
            Self::Done => "DONE",
        }
    }

    /// Check if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeploymentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MC_SETUP" => Ok(Self::MulticastSetup),
            "FRAG_SESS_SETUP" => Ok(Self::FragmentationSessionSetup),
            "MC_SESS_C_SETUP" => Ok(Self::MulticastSessionSetup),
            "ENQUEUE" => Ok(Self::Enqueue),
            "WAITING_TX" => Ok(Self::WaitingTx),
            "TRANSMITTED" => Ok(Self::Transmitted),
            "STATUS_REQUESTED" => Ok(Self::StatusRequested),
            "DONE" => Ok(Self::Done),
            _ => Err(format!("unknown deployment state: {s}")),
        }
    }
}

/// Per-device participation state within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    /// No outcome recorded yet.
    Pending,
    /// Device reported a complete firmware image.
    Success,
    /// Device failed or never answered.
    Error,
}

impl DeviceState {
    /// Get the persisted tag for this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }

    /// Check if the state can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeviceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("unknown device state: {s}")),
        }
    }
}

/// Terminal outcome recorded for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOutcome {
    /// Firmware received and verified.
    Success,
    /// Device failed.
    Error,
}

impl DeviceOutcome {
    /// The participation state this outcome moves the device to.
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        match self {
            Self::Success => DeviceState::Success,
            Self::Error => DeviceState::Error,
        }
    }
}

/// Rollout parameters supplied when a deployment is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentParams {
    /// Human-readable name.
    pub name: String,
    /// Multicast group used for delivery, if already linked.
    #[serde(default)]
    pub multicast_group_id: Option<MulticastGroupId>,
    /// Fragmentation matrix selector.
    pub fragmentation_matrix: u8,
    /// Opaque firmware descriptor.
    pub descriptor: [u8; 4],
    /// Firmware image.
    pub payload: Vec<u8>,
    /// Fragment size in bytes.
    pub frag_size: u32,
    /// Number of redundancy fragments.
    pub redundancy: u32,
    /// Block acknowledgement delay exponent.
    pub block_ack_delay: u32,
    /// Multicast session timeout exponent (session lasts `2^n` seconds).
    pub multicast_timeout: u32,
    /// How long to wait for a unicast answer from each device.
    pub unicast_timeout: Duration,
}

/// A FUOTA deployment as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuotaDeployment {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
    /// Human-readable name.
    pub name: String,
    /// Multicast group used for delivery.
    pub multicast_group_id: Option<MulticastGroupId>,
    /// Fragmentation matrix selector.
    pub fragmentation_matrix: u8,
    /// Opaque firmware descriptor.
    pub descriptor: [u8; 4],
    /// Firmware image.
    pub payload: Vec<u8>,
    /// Fragment size in bytes.
    pub frag_size: u32,
    /// Number of redundancy fragments.
    pub redundancy: u32,
    /// Block acknowledgement delay exponent.
    pub block_ack_delay: u32,
    /// Multicast session timeout exponent.
    pub multicast_timeout: u32,
    /// How long to wait for a unicast answer from each device.
    pub unicast_timeout: Duration,
    /// Current lifecycle state.
    pub state: DeploymentState,
    /// The deployment is not advanced before this instant.
    pub next_step_after: DateTime<Utc>,
    /// Consecutive failed attempts of the current step.
    pub retry_count: u32,
}

impl FuotaDeployment {
    /// Create a new deployment in the initial state, due immediately.
    #[must_use]
    pub fn new(params: DeploymentParams) -> Self {
        let now = now();
        Self {
            id: DeploymentId::generate(),
            created_at: now,
            updated_at: now,
            name: params.name,
            multicast_group_id: params.multicast_group_id,
            fragmentation_matrix: params.fragmentation_matrix,
            descriptor: params.descriptor,
            payload: params.payload,
            frag_size: params.frag_size,
            redundancy: params.redundancy,
            block_ack_delay: params.block_ack_delay,
            multicast_timeout: params.multicast_timeout,
            unicast_timeout: params.unicast_timeout,
            state: DeploymentState::MulticastSetup,
            next_step_after: now,
            retry_count: 0,
        }
    }

    /// Check if the deployment may be claimed at `at`.
    #[must_use]
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.multicast_group_id.is_some() && self.next_step_after <= at
    }
}

/// A device to enroll when creating a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolledDevice {
    /// Device EUI.
    pub dev_eui: DevEui,
    /// Display name used for ordering participant listings.
    pub name: String,
}

impl EnrolledDevice {
    /// Create a new enrolled device.
    #[must_use]
    pub fn new(dev_eui: DevEui, name: impl Into<String>) -> Self {
        Self {
            dev_eui,
            name: name.into(),
        }
    }
}

/// A device participation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Deployment the record belongs to.
    pub deployment_id: DeploymentId,
    /// Device EUI.
    pub dev_eui: DevEui,
    /// Device display name.
    pub device_name: String,
    /// Participation state.
    pub state: DeviceState,
    /// Error message, empty unless the state is [`DeviceState::Error`].
    pub error_message: String,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Pagination for participant listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of results.
    pub limit: u32,
    /// Number of results to skip.
    pub offset: u32,
}

impl Page {
    /// First page with the given size.
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}
