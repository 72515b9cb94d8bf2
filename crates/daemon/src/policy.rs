//! Restart policy: whether and when to retry after a failure

use loopcast_config::SupervisorConfig;
use std::time::Duration;

/// Verdict for one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Retry after waiting out the backoff delay
    Retry { delay: Duration },
    /// Attempts exhausted; stop retrying until an external restart
    Halt,
}

/// Fixed-backoff policy bounded by a consecutive-attempt ceiling
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Duration::from_secs(config.backoff_secs),
        }
    }

    /// Decide for the given number of attempts already consumed
    pub fn decide(&self, attempts: u32) -> RestartDecision {
        if attempts < self.max_attempts {
            RestartDecision::Retry {
                delay: self.backoff,
            }
        } else {
            RestartDecision::Halt
        }
    }
}
