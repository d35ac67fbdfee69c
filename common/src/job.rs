use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobLabel(pub String);

impl std::fmt::Display for JobLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for JobLabel {
    fn default() -> Self {
        JobLabel(crate::DEFAULT_JOB_LABEL.to_string())
    }
}

/// What the runner does when the job keeps failing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and keep the schedule.
    #[default]
    Ignore,
    /// Stop the runner after this many failures in a row.
    Escalate { max_consecutive: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// How the supervisor restarts a runner that stopped unexpectedly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicy {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// `None` restarts forever.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: Option<u32>,
    /// A runner that stays up this long clears the restart count and backoff.
    #[serde(default = "default_reset_after")]
    pub reset_after_secs: u64,
}

fn default_initial_delay() -> u64 { 1 }
fn default_max_delay() -> u64 { 60 }
fn default_max_restarts() -> Option<u32> { Some(5) }
fn default_reset_after() -> u64 { 300 }

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_restarts: default_max_restarts(),
            reset_after_secs: default_reset_after(),
        }
    }
}

/// The one recurring job the daemon runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub label: JobLabel,
    pub command: PathBuf,
    pub working_dir: PathBuf,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
}
