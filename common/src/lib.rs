pub mod job;
pub mod schedule;

pub use job::{BackoffStrategy, FailurePolicy, Job, JobLabel, RestartPolicy};
pub use schedule::parse_duration;

// File names inside the working directory
pub const DEFAULT_DIR_NAME: &str = "tickerd";
pub const DEFAULT_PID_FILE: &str = "tickerd.pid";
pub const DEFAULT_LOG_FILE: &str = "tickerd.log";
pub const DEFAULT_JOB_COMMAND: &str = "my_script.bash";
pub const DEFAULT_JOB_LABEL: &str = "myscript";

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV: &str = "TICKERD_CONFIG";

/// Process exit statuses.
pub mod exit {
    /// Clean shutdown after a termination signal.
    pub const OK: i32 = 0;
    /// Logging, daemonization or runtime setup failed.
    pub const STARTUP: i32 = 1;
    /// The configuration could not be loaded or is invalid.
    pub const CONFIG: i32 = 2;
    /// Another live instance holds the PID lock.
    pub const LOCK_HELD: i32 = 3;
    /// The task runner stopped and supervision escalated to shutdown.
    pub const RUNNER_FAILED: i32 = 4;
}
