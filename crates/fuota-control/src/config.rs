//! Configuration for fuota-control.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{FuotaError, FuotaResult};

/// Top-level configuration for the FUOTA worker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FuotaConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Claim scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Step retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Step timing configuration.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Collaborator (network server bridge) configuration.
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
}

impl FuotaConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `fuota.toml` in the current directory (if present)
    /// 3. Environment variables with `FUOTA_` prefix
    pub fn load() -> FuotaResult<Self> {
        Figment::new()
            .merge(Toml::file("fuota.toml"))
            .merge(Env::prefixed("FUOTA_").split("__"))
            .extract()
            .map_err(|e| FuotaError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> FuotaResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FUOTA_").split("__"))
            .extract()
            .map_err(|e| FuotaError::Config(e.to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/fuota".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Claim scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often to poll for due deployments (seconds).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum deployments claimed per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Ceiling for a single collaborator call (seconds).
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

const fn default_poll_interval_secs() -> u64 {
    1
}

const fn default_batch_size() -> u32 {
    10
}

const fn default_step_timeout_secs() -> u64 {
    30
}

impl SchedulerConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Step timeout as a duration.
    #[must_use]
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

/// Step retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts of a single step before the deployment is forced to done.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failure (seconds).
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Upper bound for a single backoff (seconds).
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

const fn default_max_attempts() -> u32 {
    10
}

const fn default_base_delay_secs() -> u64 {
    30
}

const fn default_max_delay_secs() -> u64 {
    900 // 15 minutes
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Step timing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Slack after the multicast session before checking device status (seconds).
    #[serde(default = "default_session_margin_secs")]
    pub session_margin_secs: u64,

    /// Upper bound for any computed wait between steps (seconds).
    #[serde(default = "default_max_step_delay_secs")]
    pub max_step_delay_secs: u64,
}

const fn default_session_margin_secs() -> u64 {
    10
}

const fn default_max_step_delay_secs() -> u64 {
    86_400 // 1 day
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            session_margin_secs: default_session_margin_secs(),
            max_step_delay_secs: default_max_step_delay_secs(),
        }
    }
}

/// Collaborator bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollaboratorConfig {
    /// Base URL of the HTTP bridge to the network server.
    #[serde(default = "default_collaborator_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_collaborator_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_collaborator_url() -> String {
    "http://localhost:8090".to_owned()
}

const fn default_collaborator_timeout_secs() -> u64 {
    10
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            url: default_collaborator_url(),
            timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}
