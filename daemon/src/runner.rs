use common::{FailurePolicy, Job, JobLabel};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Result of one invocation of the job's command.
#[derive(Debug)]
pub enum JobOutcome {
    Success { stdout: Vec<u8> },
    Failed {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },
    TimedOut { after: Duration },
    /// The command could not be spawned or waited on.
    SpawnFailed { error: io::Error },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("job {label} failed {failures} times in a row")]
    FailureLimit { label: JobLabel, failures: u32 },
}

/// Spawns the command in the job's working directory and waits for it,
/// killing it if the job's timeout passes first.
pub async fn execute(job: &Job) -> JobOutcome {
    let mut cmd = Command::new(&job.command);
    cmd.current_dir(&job.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => return JobOutcome::SpawnFailed { error },
    };

    let output = match job.timeout {
        Some(limit) => match time::timeout(limit, child.wait_with_output()).await {
            Ok(res) => res,
            Err(_) => return JobOutcome::TimedOut { after: limit },
        },
        None => child.wait_with_output().await,
    };

    match output {
        Ok(output) if output.status.success() => JobOutcome::Success { stdout: output.stdout },
        Ok(output) => JobOutcome::Failed {
            code: output.status.code(),
            signal: output.status.signal(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        },
        Err(error) => JobOutcome::SpawnFailed { error },
    }
}

pub fn log_outcome(label: &JobLabel, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Success { stdout } => {
            log::debug!("[{}] script output: {}", label, String::from_utf8_lossy(stdout).trim_end());
        }
        JobOutcome::Failed { code: Some(code), stderr, .. } => {
            log::debug!("[{}] error running script: exit status {}: {}", label, code, stderr);
        }
        JobOutcome::Failed { signal, stderr, .. } => {
            log::debug!(
                "[{}] error running script: killed by signal {}: {}",
                label,
                signal.unwrap_or(0),
                stderr
            );
        }
        JobOutcome::TimedOut { after } => {
            log::warn!("[{}] script timed out after {:?} and was killed", label, after);
        }
        JobOutcome::SpawnFailed { error } => {
            log::warn!("[{}] could not run script: {}", label, error);
        }
    }
}

/// Set while a run is in progress; survives runner restarts.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicBool>);

impl InFlight {
    pub fn try_begin(&self) -> Option<RunPermit> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit(self.0.clone()))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the in-flight flag when dropped, including on panic.
#[derive(Debug)]
pub struct RunPermit(Arc<AtomicBool>);

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one job on a fixed interval. The first run happens one interval
/// after `run` starts; ticks that land while a run is in progress are
/// skipped.
pub struct Runner {
    job: Job,
    in_flight: InFlight,
    observer: Option<mpsc::UnboundedSender<JobOutcome>>,
}

impl Runner {
    pub fn new(job: Job, in_flight: InFlight) -> Self {
        Self {
            job,
            in_flight,
            observer: None,
        }
    }

    /// Receives every outcome after it has been logged, including runs
    /// that finish after this runner has stopped.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<JobOutcome>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns only when the failure policy gives up.
    pub async fn run(self) -> RunnerError {
        let job = self.job;
        log::debug!("[{}] scheduling {:?} every {:?}", job.label, job.command, job.interval);

        let mut ticker = time::interval_at(Instant::now() + job.interval, job.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(permit) = self.in_flight.try_begin() else {
                        log::debug!("[{}] previous run still in progress, skipping tick", job.label);
                        continue;
                    };
                    let job = job.clone();
                    let done = done_tx.clone();
                    let observer = self.observer.clone();
                    // Detached: a run outlives a runner restart and is
                    // still logged; only the failure count is lost.
                    tokio::spawn(async move {
                        log::debug!("[{}] running script..", job.label);
                        let outcome = execute(&job).await;
                        drop(permit);
                        log_outcome(&job.label, &outcome);
                        let _ = done.send(outcome.is_success());
                        if let Some(observer) = observer {
                            let _ = observer.send(outcome);
                        }
                    });
                }
                Some(succeeded) = done_rx.recv() => {
                    if succeeded {
                        failures = 0;
                    } else {
                        failures += 1;
                    }
                    if let FailurePolicy::Escalate { max_consecutive } = job.failure_policy {
                        if failures >= max_consecutive {
                            return RunnerError::FailureLimit { label: job.label.clone(), failures };
                        }
                    }
                }
            }
        }
    }
}
