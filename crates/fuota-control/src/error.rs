//! Error types for fuota-control.

/// Result type alias using [`FuotaError`].
pub type FuotaResult<T> = Result<T, FuotaError>;

/// Errors that can occur while storing or advancing FUOTA deployments.
#[derive(Debug, thiserror::Error)]
pub enum FuotaError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Device is not enrolled in the deployment.
    #[error("device {dev_eui} not enrolled in deployment {deployment_id}")]
    DeviceNotFound {
        /// Deployment identifier.
        deployment_id: String,
        /// Device EUI.
        dev_eui: String,
    },

    /// Device already has a terminal outcome for this deployment.
    #[error("device {dev_eui} already {state} in deployment {deployment_id}")]
    AlreadyTerminal {
        /// Deployment identifier.
        deployment_id: String,
        /// Device EUI.
        dev_eui: String,
        /// The terminal state already recorded.
        state: &'static str,
    },

    /// A persisted field is malformed.
    #[error("storage integrity error: {0}")]
    Integrity(String),

    /// Collaborator (network server, multicast infrastructure) failure.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FuotaError {
    /// Create an integrity error.
    #[must_use]
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a collaborator error.
    #[must_use]
    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the referenced deployment or participant does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DeploymentNotFound(_) | Self::DeviceNotFound { .. }
        )
    }

    /// Returns true if retrying the operation later may succeed.
    ///
    /// Integrity and not-found errors are never transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Collaborator(_) | Self::Http(_))
    }
}
