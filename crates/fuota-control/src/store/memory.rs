//! In-memory deployment store for testing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{FuotaError, FuotaResult};
use crate::types::{
    now, DevEui, DeploymentId, DeviceOutcome, DeviceState, EnrolledDevice, FuotaDeployment, Page,
    Participant,
};

use super::{DeploymentStore, StoreTransaction};

/// How long a transaction waits before re-checking a row lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Inner {
    deployments: HashMap<DeploymentId, FuotaDeployment>,
    participants: HashMap<DeploymentId, BTreeMap<DevEui, Participant>>,
    locked: HashSet<DeploymentId>,
}

impl Inner {
    fn participant(&self, id: &DeploymentId, dev_eui: &DevEui) -> Option<&Participant> {
        self.participants.get(id).and_then(|devices| devices.get(dev_eui))
    }
}

fn lock(inner: &Mutex<Inner>) -> FuotaResult<MutexGuard<'_, Inner>> {
    inner
        .lock()
        .map_err(|_| FuotaError::internal("lock poisoned"))
}

/// In-memory deployment store for testing.
///
/// Row locks behave like PostgreSQL's `FOR UPDATE`: a claimed deployment
/// stays locked until its transaction ends, `claim_due` skips rows locked by
/// other transactions while `get_for_update` and `update` wait for them.
/// Cloning the store
/// shares the underlying data, which lets tests run several workers against
/// one store.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create(
        &self,
        deployment: &FuotaDeployment,
        devices: &[EnrolledDevice],
    ) -> FuotaResult<()> {
        let mut inner = lock(&self.inner)?;

        if inner.deployments.contains_key(&deployment.id) {
            return Err(FuotaError::internal(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }

        let mut participants = BTreeMap::new();
        for device in devices {
            let participant = Participant {
                deployment_id: deployment.id,
                dev_eui: device.dev_eui,
                device_name: device.name.clone(),
                state: DeviceState::Pending,
                error_message: String::new(),
                created_at: deployment.created_at,
                updated_at: deployment.created_at,
            };
            if participants.insert(device.dev_eui, participant).is_some() {
                return Err(FuotaError::internal(format!(
                    "device {} enrolled twice",
                    device.dev_eui
                )));
            }
        }

        inner.deployments.insert(deployment.id, deployment.clone());
        inner.participants.insert(deployment.id, participants);
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> FuotaResult<Option<FuotaDeployment>> {
        let inner = lock(&self.inner)?;
        Ok(inner.deployments.get(id).cloned())
    }

    async fn list_pending(&self, limit: u32) -> FuotaResult<Vec<FuotaDeployment>> {
        let inner = lock(&self.inner)?;

        let mut results: Vec<_> = inner
            .deployments
            .values()
            .filter(|d| !d.state.is_terminal())
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.next_step_after
                .cmp(&b.next_step_after)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(results.into_iter().take(to_usize(limit)).collect())
    }

    async fn device_count(&self, id: &DeploymentId) -> FuotaResult<u64> {
        let inner = lock(&self.inner)?;
        let count = inner.participants.get(id).map_or(0, BTreeMap::len);
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn pending_count(&self, id: &DeploymentId) -> FuotaResult<u64> {
        let inner = lock(&self.inner)?;
        let count = inner.participants.get(id).map_or(0, |devices| {
            devices
                .values()
                .filter(|p| p.state == DeviceState::Pending)
                .count()
        });
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn list_devices(&self, id: &DeploymentId, page: Page) -> FuotaResult<Vec<Participant>> {
        let inner = lock(&self.inner)?;

        let mut results: Vec<_> = inner
            .participants
            .get(id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default();
        results.sort_by(|a, b| {
            a.device_name
                .cmp(&b.device_name)
                .then_with(|| a.dev_eui.cmp(&b.dev_eui))
        });

        Ok(results
            .into_iter()
            .skip(to_usize(page.offset))
            .take(to_usize(page.limit))
            .collect())
    }

    async fn begin(&self) -> FuotaResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            held: HashSet::new(),
            staged: HashMap::new(),
            outcomes: HashMap::new(),
            savepoint: None,
        }))
    }
}

#[derive(Debug, Clone)]
struct StagedOutcome {
    state: DeviceState,
    message: String,
    at: DateTime<Utc>,
}

/// Transaction over a [`MemoryStore`].
///
/// Writes are staged locally and applied on commit.
#[derive(Debug)]
struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    held: HashSet<DeploymentId>,
    staged: HashMap<DeploymentId, FuotaDeployment>,
    outcomes: HashMap<(DeploymentId, DevEui), StagedOutcome>,
    savepoint: Option<Savepoint>,
}

#[derive(Debug)]
struct Savepoint {
    staged: HashMap<DeploymentId, FuotaDeployment>,
    outcomes: HashMap<(DeploymentId, DevEui), StagedOutcome>,
}

impl MemoryTransaction {
    fn view(&self, inner: &Inner, id: &DeploymentId) -> Option<FuotaDeployment> {
        self.staged
            .get(id)
            .or_else(|| inner.deployments.get(id))
            .cloned()
    }

    fn device_state(&self, participant: &Participant) -> DeviceState {
        self.outcomes
            .get(&(participant.deployment_id, participant.dev_eui))
            .map_or(participant.state, |staged| staged.state)
    }

    /// Take the row lock on `id`, waiting while another transaction holds it.
    ///
    /// Returns false if the deployment does not exist.
    async fn acquire(&mut self, id: &DeploymentId) -> FuotaResult<bool> {
        loop {
            {
                let mut inner = lock(&self.inner)?;
                if !inner.deployments.contains_key(id) {
                    return Ok(false);
                }
                if self.held.contains(id) || inner.locked.insert(*id) {
                    self.held.insert(*id);
                    return Ok(true);
                }
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    fn release(&mut self) {
        let held = std::mem::take(&mut self.held);
        if held.is_empty() {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            for id in &held {
                inner.locked.remove(id);
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get_for_update(&mut self, id: &DeploymentId) -> FuotaResult<Option<FuotaDeployment>> {
        if !self.acquire(id).await? {
            return Ok(None);
        }
        let inner = lock(&self.inner)?;
        Ok(self.view(&inner, id))
    }

    async fn claim_due(
        &mut self,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> FuotaResult<Vec<FuotaDeployment>> {
        let mut inner = lock(&self.inner)?;

        let mut due: Vec<FuotaDeployment> = inner
            .deployments
            .keys()
            .filter(|id| self.held.contains(*id) || !inner.locked.contains(*id))
            .filter_map(|id| self.view(&inner, id))
            .filter(|d| d.is_due(now))
            .collect();
        due.sort_by(|a, b| {
            a.next_step_after
                .cmp(&b.next_step_after)
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(to_usize(batch_size));

        for deployment in &due {
            inner.locked.insert(deployment.id);
            self.held.insert(deployment.id);
        }

        Ok(due)
    }

    async fn update(&mut self, deployment: &mut FuotaDeployment) -> FuotaResult<()> {
        if !self.acquire(&deployment.id).await? {
            return Err(FuotaError::DeploymentNotFound(deployment.id.to_string()));
        }

        deployment.updated_at = now();
        self.staged.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn record_device_outcome(
        &mut self,
        id: &DeploymentId,
        dev_eui: &DevEui,
        outcome: DeviceOutcome,
        message: &str,
    ) -> FuotaResult<()> {
        let inner = lock(&self.inner)?;
        let participant = inner
            .participant(id, dev_eui)
            .ok_or_else(|| FuotaError::DeviceNotFound {
                deployment_id: id.to_string(),
                dev_eui: dev_eui.to_string(),
            })?;

        let current = self.device_state(participant);
        if current.is_terminal() {
            return Err(FuotaError::AlreadyTerminal {
                deployment_id: id.to_string(),
                dev_eui: dev_eui.to_string(),
                state: current.as_str(),
            });
        }
        drop(inner);

        self.outcomes.insert(
            (*id, *dev_eui),
            StagedOutcome {
                state: outcome.state(),
                message: message.to_owned(),
                at: now(),
            },
        );
        Ok(())
    }

    async fn pending_devices(&mut self, id: &DeploymentId) -> FuotaResult<Vec<DevEui>> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .participants
            .get(id)
            .map(|devices| {
                devices
                    .values()
                    .filter(|p| self.device_state(p) == DeviceState::Pending)
                    .map(|p| p.dev_eui)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fail_pending_devices(&mut self, id: &DeploymentId, message: &str) -> FuotaResult<u64> {
        let pending = self.pending_devices(id).await?;
        let at = now();
        for dev_eui in &pending {
            self.outcomes.insert(
                (*id, *dev_eui),
                StagedOutcome {
                    state: DeviceState::Error,
                    message: message.to_owned(),
                    at,
                },
            );
        }
        Ok(u64::try_from(pending.len()).unwrap_or(u64::MAX))
    }

    async fn savepoint(&mut self) -> FuotaResult<()> {
        self.savepoint = Some(Savepoint {
            staged: self.staged.clone(),
            outcomes: self.outcomes.clone(),
        });
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> FuotaResult<()> {
        let savepoint = self
            .savepoint
            .take()
            .ok_or_else(|| FuotaError::internal("no savepoint to roll back to"))?;
        self.staged = savepoint.staged;
        self.outcomes = savepoint.outcomes;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> FuotaResult<()> {
        self.savepoint
            .take()
            .map(|_| ())
            .ok_or_else(|| FuotaError::internal("no savepoint to release"))
    }

    async fn commit(self: Box<Self>) -> FuotaResult<()> {
        let mut this = self;
        {
            let mut inner = lock(&this.inner)?;

            for (id, deployment) in this.staged.drain() {
                if let Some(stored) = inner.deployments.get_mut(&id) {
                    *stored = deployment;
                }
            }

            for ((id, dev_eui), staged) in this.outcomes.drain() {
                let Some(participant) = inner
                    .participants
                    .get_mut(&id)
                    .and_then(|devices| devices.get_mut(&dev_eui))
                else {
                    continue;
                };
                // A concurrent transaction may have committed an outcome first.
                if participant.state.is_terminal() {
                    continue;
                }
                participant.state = staged.state;
                participant.error_message = staged.message;
                participant.updated_at = staged.at;
            }
        }
        this.release();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> FuotaResult<()> {
        let mut this = self;
        this.staged.clear();
        this.outcomes.clear();
        this.release();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

fn to_usize(n: u32) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}
