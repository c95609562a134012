//! Bounded polling of asynchronous backend operations.
//!
//! Backends either hand back an operation handle or expect callers to watch
//! a resource's own status field. Both are expressed as a check returning a
//! [`PollOutcome`]; [`poll_until`] drives the check under a [`PollBudget`].

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::LifecycleError;

/// Attempt count and spacing for a polling loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PollBudget {
    /// Number of checks issued before giving up.
    pub attempts: u32,
    /// Delay after the first unsuccessful check.
    pub interval: Duration,
    /// Multiplier applied to the delay after each further check. `1` keeps
    /// the interval fixed.
    pub backoff_factor: u32,
    /// Upper bound on any single delay.
    pub max_interval: Duration,
}

impl PollBudget {
    /// Budget with a fixed interval between checks.
    #[must_use]
    pub const fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            backoff_factor: 1,
            max_interval: interval,
        }
    }

    /// Enables multiplicative backoff capped at `max_interval`.
    #[must_use]
    pub const fn with_backoff(mut self, factor: u32, max_interval: Duration) -> Self {
        self.backoff_factor = factor;
        self.max_interval = max_interval;
        self
    }

    /// Builds the budget described by the engine configuration.
    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self::fixed(
            config.poll_attempts,
            Duration::from_millis(config.poll_interval_ms),
        )
        .with_backoff(
            config.poll_backoff_factor,
            Duration::from_millis(config.poll_max_interval_ms),
        )
    }

    /// Delay to wait after check number `attempt` (1-based) failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff_factor <= 1 {
            return self.interval;
        }
        let growth = self
            .backoff_factor
            .saturating_pow(attempt.saturating_sub(1));
        self.interval
            .saturating_mul(growth)
            .min(self.max_interval.max(self.interval))
    }
}

/// Result of a single check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollOutcome<T> {
    /// Not terminal yet; carries the state the backend reported.
    Pending(String),
    /// Terminal success.
    Ready(T),
    /// Terminal failure; carries the backend's error payload.
    Failed(String),
}

/// Checks until the outcome is terminal or the budget is spent.
///
/// The check is called at most `budget.attempts` times and the loop only
/// sleeps between checks, never after the last one.
///
/// # Errors
///
/// Returns [`LifecycleError::BackendOperation`] when a check reports a
/// terminal failure, [`LifecycleError::Timeout`] when the budget runs out, or
/// any error the check itself raises.
pub async fn poll_until<T, F, Fut>(
    budget: &PollBudget,
    resource: &str,
    expected: &str,
    mut check: F,
) -> Result<T, LifecycleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>, LifecycleError>>,
{
    let mut last_state = String::from("unknown");
    for attempt in 1..=budget.attempts {
        match check().await? {
            PollOutcome::Ready(value) => {
                debug!(resource, expected, attempt, "poll reached target state");
                return Ok(value);
            }
            PollOutcome::Failed(payload) => {
                return Err(LifecycleError::BackendOperation {
                    operation: resource.to_owned(),
                    payload,
                });
            }
            PollOutcome::Pending(state) => {
                debug!(resource, expected, attempt, state = %state, "still waiting");
                last_state = state;
            }
        }
        if attempt < budget.attempts {
            sleep(budget.delay_after(attempt)).await;
        }
    }

    warn!(resource, expected, last_state = %last_state, "polling budget exhausted");
    Err(LifecycleError::Timeout {
        resource: resource.to_owned(),
        expected: expected.to_owned(),
        attempts: budget.attempts,
    })
}
