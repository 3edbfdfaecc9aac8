//! FUOTA deployment control
//!
//! This crate drives firmware-over-the-air rollouts to fleets of LoRaWAN
//! devices. Each rollout is a deployment that walks through a fixed sequence
//! of steps on the network server; progress is persisted so that any number
//! of worker processes can share the work and a crashed worker loses nothing.
//!
//! # Architecture
//!
//! - **Store** ([`store`]): deployments and per-device participation records,
//!   with transactional claim-for-update semantics
//! - **State machine** ([`state`]): pure transition logic, retries and timing
//! - **Executor** ([`executor`]): performs the side effect of a state through
//!   a [`StepAction`] and classifies the result
//! - **Scheduler** ([`scheduler`]): claims due deployments with
//!   `FOR UPDATE SKIP LOCKED` and advances each by one step per cycle
//! - **Tracker** ([`tracker`]): per-device success and error bookkeeping
//!
//! # State Machine
//!
//! ```text
//! MC_SETUP ─▶ FRAG_SESS_SETUP ─▶ MC_SESS_C_SETUP ─▶ ENQUEUE ─▶ WAITING_TX
//!                                                                  │
//!            DONE ◀── STATUS_REQUESTED ◀── TRANSMITTED ◀───────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fuota_control::{
//!     DeploymentParams, DeploymentStore, DevEui, EnrolledDevice, FuotaDeployment, MemoryStore,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let deployment = FuotaDeployment::new(DeploymentParams {
//!     name: "firmware 1.2.0".to_owned(),
//!     multicast_group_id: None,
//!     fragmentation_matrix: 3,
//!     descriptor: [1, 2, 3, 4],
//!     payload: firmware,
//!     frag_size: 50,
//!     redundancy: 10,
//!     block_ack_delay: 6,
//!     multicast_timeout: 8,
//!     unicast_timeout: Duration::from_secs(60),
//! });
//!
//! let device = EnrolledDevice::new("0102030405060708".parse()?, "sensor-1");
//! store.create(&deployment, &[device]).await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
pub mod tracker;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::FuotaConfig;
pub use error::{FuotaError, FuotaResult};
pub use executor::{
    ActionReport, ActionStatus, DeviceReport, HttpStepAction, StepAction, StepExecutor,
    StepRequest, StepResult,
};
pub use scheduler::{ClaimScheduler, CycleSummary};
pub use service::WorkerService;
pub use state::{
    RetryPolicy, StateMachine, StepOutcome, TimingPolicy, Transition, TransitionContext,
};
pub use store::{DeploymentStore, MemoryStore, PostgresStore, StoreTransaction};
pub use tracker::ParticipationTracker;
pub use types::{
    DevEui, DeploymentId, DeploymentParams, DeploymentState, DeviceOutcome, DeviceState,
    EnrolledDevice, FuotaDeployment, MulticastGroupId, Page, Participant,
};
