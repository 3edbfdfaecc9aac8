//! Common test utilities for fuota-control integration tests.

#![allow(dead_code, clippy::unwrap_used)]

pub mod fixtures;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fuota_control::config::SchedulerConfig;
use fuota_control::{
    ActionReport, ClaimScheduler, CycleSummary, DeploymentId, DeploymentState, DeploymentStore,
    DeviceReport, FuotaDeployment, FuotaError, FuotaResult, MemoryStore, RetryPolicy,
    StateMachine, StepAction, StepExecutor, StepRequest, TimingPolicy,
};

/// What the scripted collaborator does for one call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Complete the step.
    Complete,
    /// Complete the step and report device outcomes.
    CompleteWith(Vec<DeviceReport>),
    /// Report the step as still in progress.
    Pending,
    /// Reject the step.
    Reject(String),
    /// Fail with a transient error.
    Fail(String),
    /// Never answer.
    Hang,
}

/// A step action driven by per-state scripts.
///
/// States without a queued script complete. The last script queued for a
/// state repeats once the queue runs dry.
#[derive(Debug, Default)]
pub struct ScriptedAction {
    scripts: Mutex<HashMap<DeploymentState, VecDeque<Script>>>,
    requests: Mutex<Vec<StepRequest>>,
    delay: Option<Duration>,
}

impl ScriptedAction {
    /// Creates an action that completes every step.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an action that sleeps before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queues scripts for a state.
    pub fn script(&self, state: DeploymentState, scripts: impl IntoIterator<Item = Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(state)
            .or_default()
            .extend(scripts);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<StepRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests received for a deployment.
    pub fn requests_for(&self, id: &DeploymentId) -> Vec<StepRequest> {
        self.requests()
            .into_iter()
            .filter(|r| &r.deployment_id == id)
            .collect()
    }

    fn next_script(&self, state: DeploymentState) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&state) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Script::Complete),
            None => Script::Complete,
        }
    }
}

#[async_trait]
impl StepAction for ScriptedAction {
    async fn execute(&self, request: &StepRequest) -> FuotaResult<ActionReport> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.next_script(request.state);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match script {
            Script::Complete => Ok(ActionReport::completed()),
            Script::CompleteWith(devices) => Ok(ActionReport::completed().with_devices(devices)),
            Script::Pending => Ok(ActionReport::pending("still running")),
            Script::Reject(reason) => Ok(ActionReport::rejected(reason)),
            Script::Fail(reason) => Err(FuotaError::collaborator(reason)),
            Script::Hang => std::future::pending().await,
        }
    }
}

/// Complete test worker setup with all components wired together.
pub struct TestWorker {
    pub store: Arc<MemoryStore>,
    pub action: Arc<ScriptedAction>,
    pub scheduler: ClaimScheduler,
}

impl TestWorker {
    /// Creates a worker with default policies.
    pub fn new(store: Arc<MemoryStore>, action: Arc<ScriptedAction>) -> Self {
        Self::with_retry(store, action, RetryPolicy::default())
    }

    /// Creates a worker with a custom retry policy.
    pub fn with_retry(
        store: Arc<MemoryStore>,
        action: Arc<ScriptedAction>,
        retry: RetryPolicy,
    ) -> Self {
        let executor = StepExecutor::new(
            Arc::clone(&action) as Arc<dyn StepAction>,
            Duration::from_millis(200),
        );
        let scheduler = ClaimScheduler::new(
            Arc::clone(&store) as Arc<dyn DeploymentStore>,
            executor,
            StateMachine::new(retry, TimingPolicy::default()),
            &SchedulerConfig::default(),
        );

        Self {
            store,
            action,
            scheduler,
        }
    }

    /// Runs one cycle at the deployment's `next_step_after`.
    pub async fn step(&self, id: &DeploymentId) -> CycleSummary {
        let deployment = self.get(id).await;
        self.scheduler
            .run_once_at(deployment.next_step_after)
            .await
            .unwrap()
    }

    /// Steps the deployment until it is done, returning every persisted
    /// snapshot in order.
    pub async fn drive_to_done(&self, id: &DeploymentId, max_cycles: usize) -> Vec<FuotaDeployment> {
        let mut history = vec![self.get(id).await];
        for _ in 0..max_cycles {
            self.step(id).await;
            let current = self.get(id).await;
            let done = current.state == DeploymentState::Done;
            history.push(current);
            if done {
                return history;
            }
        }
        panic!("deployment {id} not done after {max_cycles} cycles");
    }

    /// Reads a deployment that must exist.
    pub async fn get(&self, id: &DeploymentId) -> FuotaDeployment {
        self.store.get(id).await.unwrap().unwrap()
    }
}
