//! The resource poller.

use std::fmt;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::backoff::Backoff;
use crate::error::{ConvergeError, ProviderError, ProviderErrorKind};
use crate::state::ResourceState;
use crate::DEFAULT_UNKNOWN_GRACE;

/// Kind tag carried by every resource handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    Volume,
    Snapshot,
    Image,
    Subnet,
    Attachment,
    SpotRequest,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::Snapshot => "snapshot",
            Self::Image => "image",
            Self::Subnet => "subnet",
            Self::Attachment => "attachment",
            Self::SpotRequest => "spot request",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource whose current state can be read from the provider.
#[async_trait]
pub trait Observable: Send + Sync {
    type State: ResourceState;

    fn kind(&self) -> ResourceKind;

    fn id(&self) -> &str;

    /// Read the current state. Each call is one poll attempt.
    async fn state(&self) -> Result<Self::State, ProviderError>;

    /// Human readable name used in logs and errors.
    fn describe(&self) -> String {
        format!("{} `{}'", self.kind(), self.id())
    }
}

/// Convergence status for a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed state is one of the targets.
    Converged,

    /// Observed state is in between; keep polling.
    Converging,

    /// Observed state is fatal for this wait.
    Diverged,

    /// Observed state is unmapped.
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// How a successful wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Converged<S> {
    /// A target state was observed.
    Reached(S),

    /// The resource disappeared and the wait treats that as done.
    Gone,
}

impl<S> Converged<S> {
    pub fn state(&self) -> Option<&S> {
        match self {
            Self::Reached(state) => Some(state),
            Self::Gone => None,
        }
    }
}

/// Terminal state classification for one wait.
#[derive(Debug, Clone)]
pub struct TerminalStates<S> {
    targets: Vec<S>,
    fatal: Vec<S>,
    pending_errors: Vec<ProviderErrorKind>,
    absent_means_done: bool,
    unknown_grace: u32,
}

impl<S: ResourceState> TerminalStates<S> {
    /// Wait for a single target state.
    pub fn target(state: S) -> Self {
        Self::any_of(vec![state])
    }

    /// Wait for any of several acceptable states.
    ///
    /// Service unavailable and rate limited errors are tolerated by default.
    pub fn any_of(targets: Vec<S>) -> Self {
        Self {
            targets,
            fatal: Vec::new(),
            pending_errors: vec![
                ProviderErrorKind::ServiceUnavailable,
                ProviderErrorKind::RateLimited,
            ],
            absent_means_done: false,
            unknown_grace: DEFAULT_UNKNOWN_GRACE,
        }
    }

    /// Fail immediately when `state` is observed.
    pub fn fatal(mut self, state: S) -> Self {
        if !self.fatal.contains(&state) {
            self.fatal.push(state);
        }
        self
    }

    /// Treat `kind` as "not yet converged".
    pub fn tolerate(mut self, kind: ProviderErrorKind) -> Self {
        if !self.pending_errors.contains(&kind) {
            self.pending_errors.push(kind);
        }
        self
    }

    /// A not-found error ends the wait successfully.
    pub fn gone_when_absent(mut self) -> Self {
        self.absent_means_done = true;
        self
    }

    pub fn unknown_grace(mut self, observations: u32) -> Self {
        self.unknown_grace = observations;
        self
    }

    pub fn targets(&self) -> &[S] {
        &self.targets
    }

    pub fn is_tolerated(&self, kind: ProviderErrorKind) -> bool {
        self.pending_errors.contains(&kind)
    }

    pub fn absent_means_done(&self) -> bool {
        self.absent_means_done
    }

    pub fn classify(&self, state: &S) -> ConvergenceStatus {
        if self.targets.contains(state) {
            ConvergenceStatus::Converged
        } else if self.fatal.contains(state) {
            ConvergenceStatus::Diverged
        } else if state.is_unknown() {
            ConvergenceStatus::Unknown
        } else {
            ConvergenceStatus::Converging
        }
    }

    /// The target states, joined for error messages.
    pub fn expected(&self) -> String {
        self.targets
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("' or `")
    }
}

/// Poll `resource` until it reaches one of the target states.
///
/// Makes at most `backoff.max_attempts()` reads and sleeps `backoff.delay(n)`
/// between them. No sleep follows the final read.
pub async fn wait_for<R, B>(
    resource: &R,
    states: &TerminalStates<R::State>,
    backoff: &B,
) -> Result<Converged<R::State>, ConvergeError>
where
    R: Observable + ?Sized,
    B: Backoff + ?Sized,
{
    let description = resource.describe();
    let max_attempts = backoff.max_attempts();
    let started = Instant::now();
    let mut unknown_streak = 0u32;
    let mut last_observed: Option<String> = None;

    for attempt in 0..max_attempts {
        match resource.state().await {
            Ok(state) => {
                let status = states.classify(&state);
                debug!(
                    resource = %description,
                    attempt,
                    state = %state,
                    status = ?status,
                    "observed resource state"
                );

                match status {
                    ConvergenceStatus::Converged => {
                        info!(
                            resource = %description,
                            state = %state,
                            attempts = attempt + 1,
                            "resource converged"
                        );
                        return Ok(Converged::Reached(state));
                    }
                    ConvergenceStatus::Diverged => {
                        return Err(unexpected(&description, &state, states));
                    }
                    ConvergenceStatus::Unknown => {
                        unknown_streak += 1;
                        if unknown_streak > states.unknown_grace {
                            return Err(unexpected(&description, &state, states));
                        }
                    }
                    ConvergenceStatus::Converging => unknown_streak = 0,
                }

                last_observed = Some(state.to_string());
            }
            Err(err) if states.absent_means_done && err.is_not_found() => {
                info!(resource = %description, "resource is gone");
                return Ok(Converged::Gone);
            }
            Err(err) if states.is_tolerated(err.kind()) => {
                debug!(
                    resource = %description,
                    attempt,
                    error = %err,
                    "tolerated provider error while polling"
                );
            }
            Err(err) => return Err(err.into()),
        }

        if attempt + 1 < max_attempts {
            let delay = backoff.delay(attempt);
            debug!(
                resource = %description,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "waiting before next poll"
            );
            sleep(delay).await;
        }
    }

    Err(ConvergeError::Timeout {
        resource: description,
        attempts: max_attempts,
        elapsed: started.elapsed(),
        last_observed,
    })
}

fn unexpected<S: ResourceState>(
    description: &str,
    observed: &S,
    states: &TerminalStates<S>,
) -> ConvergeError {
    ConvergeError::UnexpectedTerminalState {
        resource: description.to_string(),
        observed: observed.to_string(),
        expected: states.expected(),
    }
}
