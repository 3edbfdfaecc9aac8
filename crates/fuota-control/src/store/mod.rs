//! Deployment storage backends.
//!
//! This module provides traits and implementations for persisting FUOTA
//! deployments and their device participation records. The primary
//! implementation uses PostgreSQL; an in-memory implementation with the same
//! locking semantics is provided for testing.
//!
//! Claiming work happens inside a [`StoreTransaction`]. Rows returned by
//! [`StoreTransaction::claim_due`] stay locked until the transaction is
//! committed, rolled back or dropped, so a worker that dies mid-step releases
//! its claim without any explicit lease handling.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FuotaResult;
use crate::types::{
    DevEui, DeploymentId, DeviceOutcome, EnrolledDevice, FuotaDeployment, Page, Participant,
};

/// Backend for storing FUOTA deployments.
///
/// Implementations must ensure that all operations are atomic and durable.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment together with one pending participation
    /// record per enrolled device.
    ///
    /// Either everything is stored or nothing is.
    async fn create(
        &self,
        deployment: &FuotaDeployment,
        devices: &[EnrolledDevice],
    ) -> FuotaResult<()>;

    /// Get a deployment by ID without locking it.
    ///
    /// Returns `None` if the deployment does not exist.
    async fn get(&self, id: &DeploymentId) -> FuotaResult<Option<FuotaDeployment>>;

    /// List deployments that are not done, ordered by `next_step_after`.
    ///
    /// This is a plain read for reporting; nothing is locked.
    async fn list_pending(&self, limit: u32) -> FuotaResult<Vec<FuotaDeployment>>;

    /// Number of devices enrolled in a deployment.
    async fn device_count(&self, id: &DeploymentId) -> FuotaResult<u64>;

    /// Number of enrolled devices without a terminal outcome.
    async fn pending_count(&self, id: &DeploymentId) -> FuotaResult<u64>;

    /// List participation records ordered by device name.
    async fn list_devices(&self, id: &DeploymentId, page: Page) -> FuotaResult<Vec<Participant>>;

    /// Start a transaction.
    async fn begin(&self) -> FuotaResult<Box<dyn StoreTransaction>>;
}

/// A unit of work against the store.
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards
/// its writes and releases every row lock it holds.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Get a deployment by ID and lock it for the rest of the transaction.
    ///
    /// Waits if another transaction holds the lock.
    async fn get_for_update(&mut self, id: &DeploymentId) -> FuotaResult<Option<FuotaDeployment>>;

    /// Lock and return up to `batch_size` deployments that are due at `now`.
    ///
    /// A deployment is due when it is not done, has a multicast group and its
    /// `next_step_after` has elapsed. Rows locked by other transactions are
    /// skipped rather than waited for. Results are ordered by
    /// `next_step_after`.
    ///
    /// A row that cannot be decoded is logged, left out of the result and
    /// pushed back so it cannot hold the head of every later claim.
    async fn claim_due(
        &mut self,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> FuotaResult<Vec<FuotaDeployment>>;

    /// Persist every mutable field of a deployment and refresh `updated_at`.
    ///
    /// Returns [`FuotaError::DeploymentNotFound`](crate::FuotaError::DeploymentNotFound)
    /// if no row matched.
    async fn update(&mut self, deployment: &mut FuotaDeployment) -> FuotaResult<()>;

    /// Move a pending participant to a terminal state.
    ///
    /// Fails with `AlreadyTerminal` if an outcome was recorded before and
    /// with `DeviceNotFound` if the device is not enrolled.
    async fn record_device_outcome(
        &mut self,
        id: &DeploymentId,
        dev_eui: &DevEui,
        outcome: DeviceOutcome,
        message: &str,
    ) -> FuotaResult<()>;

    /// Devices of a deployment that are still pending.
    async fn pending_devices(&mut self, id: &DeploymentId) -> FuotaResult<Vec<DevEui>>;

    /// Mark every pending participant as error with `message`.
    ///
    /// Returns the number of participants changed.
    async fn fail_pending_devices(&mut self, id: &DeploymentId, message: &str) -> FuotaResult<u64>;

    /// Mark the point that [`rollback_to_savepoint`](Self::rollback_to_savepoint)
    /// returns to. A new savepoint replaces the previous one.
    async fn savepoint(&mut self) -> FuotaResult<()>;

    /// Discard writes made since the last savepoint. Earlier writes and row
    /// locks are kept.
    async fn rollback_to_savepoint(&mut self) -> FuotaResult<()>;

    /// Keep writes made since the last savepoint and forget it.
    async fn release_savepoint(&mut self) -> FuotaResult<()>;

    /// Make every write durable and release all locks.
    async fn commit(self: Box<Self>) -> FuotaResult<()>;

    /// Discard every write and release all locks.
    async fn rollback(self: Box<Self>) -> FuotaResult<()>;
}
