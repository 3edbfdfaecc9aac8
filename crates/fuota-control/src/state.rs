//! Deployment state machine.
//!
//! The machine is pure: given a deployment, the outcome of executing its
//! current step and a little context about the world, it computes the next
//! state, when the deployment becomes eligible again, and whether outstanding
//! devices must be failed. Persisting the result is the caller's job.
//!
//! ```text
//! MC_SETUP ─▶ FRAG_SESS_SETUP ─▶ MC_SESS_C_SETUP ─▶ ENQUEUE ─▶ WAITING_TX
//!                                                                  │
//!            DONE ◀── STATUS_REQUESTED ◀── TRANSMITTED ◀───────────┘
//! ```
//!
//! Any state may also be forced to `DONE` by a fatal outcome or by exhausting
//! the retry ceiling.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};

use crate::config::{RetryConfig, TimingConfig};
use crate::types::{DeploymentState, FuotaDeployment};

/// Rollout order. Each state advances to the one that follows it.
pub const ROLLOUT_ORDER: [DeploymentState; 8] = [
    DeploymentState::MulticastSetup,
    DeploymentState::FragmentationSessionSetup,
    DeploymentState::MulticastSessionSetup,
    DeploymentState::Enqueue,
    DeploymentState::WaitingTx,
    DeploymentState::Transmitted,
    DeploymentState::StatusRequested,
    DeploymentState::Done,
];

impl DeploymentState {
    /// The state reached when this state's step succeeds.
    ///
    /// Returns `None` for the terminal state.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        let position = ROLLOUT_ORDER.iter().position(|s| s == self)?;
        ROLLOUT_ORDER.get(position + 1).copied()
    }
}

/// Classified result of executing a deployment's current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step completed; move to the next state.
    Advance,
    /// The step did not complete; try again later.
    Retry {
        /// Why the step must be retried.
        reason: String,
    },
    /// The step can never complete; finish the deployment.
    Fatal {
        /// Why the deployment cannot continue.
        reason: String,
    },
}

impl StepOutcome {
    /// Create a retry outcome.
    #[must_use]
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
        }
    }

    /// Create a fatal outcome.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }
}

/// World state needed to decide a transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    /// The current time.
    pub now: DateTime<Utc>,
    /// Devices still pending after this step's device reports were recorded.
    pub pending_devices: u64,
}

/// Result of a state machine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State to persist.
    pub state: DeploymentState,
    /// Earliest time the deployment may be claimed again.
    pub next_step_after: DateTime<Utc>,
    /// Retry counter to persist.
    pub retry_count: u32,
    /// When set, every device still pending must be marked as error with
    /// this message.
    pub fail_outstanding: Option<String>,
}

impl Transition {
    /// Write the transition into the deployment.
    pub fn apply(&self, deployment: &mut FuotaDeployment) {
        deployment.state = self.state;
        deployment.next_step_after = self.next_step_after;
        deployment.retry_count = self.retry_count;
    }

    /// Check if the transition finishes the deployment.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Exponential backoff with a ceiling on attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts of a single step before the deployment is forced to done.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff after `failures` consecutive failures (zero-based).
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2_u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// How long a deployment waits after each successful step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPolicy {
    /// Slack added after the class-C session before transmission counts as over.
    pub session_margin: Duration,
    /// Upper bound for any computed step delay.
    pub max_step_delay: Duration,
}

impl TimingPolicy {
    /// Delay before the state following `completed` may run.
    #[must_use]
    pub fn delay_after(&self, completed: DeploymentState, deployment: &FuotaDeployment) -> Duration {
        let delay = match completed {
            DeploymentState::MulticastSetup
            | DeploymentState::FragmentationSessionSetup
            | DeploymentState::MulticastSessionSetup
            | DeploymentState::Transmitted => deployment.unicast_timeout,
            DeploymentState::Enqueue => deployment
                .unicast_timeout
                .saturating_mul(deployment.redundancy.max(1)),
            DeploymentState::WaitingTx => {
                let session_secs = 2_u64
                    .checked_pow(deployment.multicast_timeout)
                    .unwrap_or(u64::MAX);
                Duration::from_secs(session_secs).saturating_add(self.session_margin)
            }
            DeploymentState::StatusRequested | DeploymentState::Done => Duration::ZERO,
        };
        delay.min(self.max_step_delay)
    }
}

impl From<&TimingConfig> for TimingPolicy {
    fn from(config: &TimingConfig) -> Self {
        Self {
            session_margin: Duration::from_secs(config.session_margin_secs),
            max_step_delay: Duration::from_secs(config.max_step_delay_secs),
        }
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

/// The deployment state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateMachine {
    retry: RetryPolicy,
    timing: TimingPolicy,
}

impl StateMachine {
    /// Create a state machine with the given policies.
    #[must_use]
    pub const fn new(retry: RetryPolicy, timing: TimingPolicy) -> Self {
        Self { retry, timing }
    }

    /// The retry policy in use.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Compute the transition for `deployment` given the step outcome.
    ///
    /// The returned `next_step_after` is never earlier than the deployment's
    /// current one.
    #[must_use]
    pub fn transition(
        &self,
        deployment: &FuotaDeployment,
        outcome: &StepOutcome,
        ctx: &TransitionContext,
    ) -> Transition {
        if deployment.state.is_terminal() {
            return Transition {
                state: deployment.state,
                next_step_after: deployment.next_step_after,
                retry_count: deployment.retry_count,
                fail_outstanding: None,
            };
        }

        match outcome {
            StepOutcome::Advance => self.advance(deployment, ctx),
            StepOutcome::Retry { reason } => self.retry(deployment, reason, ctx),
            StepOutcome::Fatal { reason } => Self::finish(
                deployment,
                format!("{} failed: {reason}", deployment.state),
                ctx,
            ),
        }
    }

    fn advance(&self, deployment: &FuotaDeployment, ctx: &TransitionContext) -> Transition {
        if deployment.state == DeploymentState::StatusRequested && ctx.pending_devices > 0 {
            let reason = format!("{} device(s) have not reported status", ctx.pending_devices);
            return self.retry(deployment, &reason, ctx);
        }

        let state = deployment.state.next().unwrap_or(DeploymentState::Done);
        let delay = self.timing.delay_after(deployment.state, deployment);

        Transition {
            state,
            next_step_after: not_before(after(ctx.now, delay), deployment.next_step_after),
            retry_count: 0,
            fail_outstanding: None,
        }
    }

    fn retry(
        &self,
        deployment: &FuotaDeployment,
        reason: &str,
        ctx: &TransitionContext,
    ) -> Transition {
        let attempts = deployment.retry_count.saturating_add(1);
        if attempts >= self.retry.max_attempts {
            return Self::finish(
                deployment,
                format!(
                    "{} gave up after {attempts} attempt(s): {reason}",
                    deployment.state
                ),
                ctx,
            );
        }

        let delay = self.retry.backoff(deployment.retry_count);
        Transition {
            state: deployment.state,
            next_step_after: not_before(after(ctx.now, delay), deployment.next_step_after),
            retry_count: attempts,
            fail_outstanding: None,
        }
    }

    fn finish(deployment: &FuotaDeployment, message: String, ctx: &TransitionContext) -> Transition {
        Transition {
            state: DeploymentState::Done,
            next_step_after: not_before(ctx.now, deployment.next_step_after),
            retry_count: deployment.retry_count,
            fail_outstanding: Some(message),
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .trunc_subsecs(6)
}

fn not_before(candidate: DateTime<Utc>, floor: DateTime<Utc>) -> DateTime<Utc> {
    candidate.max(floor)
}
