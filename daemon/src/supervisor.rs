use crate::runner::RunnerError;
use common::{BackoffStrategy, RestartPolicy};
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The runner's failure policy asked for shutdown.
    #[error("task runner escalated: {0}")]
    Escalated(#[source] RunnerError),
    #[error("task runner died {restarts} times, giving up")]
    GaveUp { restarts: u32 },
}

/// Keeps the task runner alive: a runner that panics or is cancelled is
/// restarted after a backoff delay, a runner that escalates is not.
///
/// `max_restarts` counts deaths in a row; a runner that stayed up for
/// `reset_after_secs` starts the count (and the backoff) over.
pub struct Supervisor {
    policy: RestartPolicy,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy }
    }

    /// Spawns `start()` as its own task and watches it. Only returns when
    /// supervision gives up.
    pub async fn supervise<F, Fut>(self, mut start: F) -> SupervisorError
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RunnerError> + Send + 'static,
    {
        let mut restarts = 0u32;
        let stable = Duration::from_secs(self.policy.reset_after_secs);
        loop {
            let started = Instant::now();
            match tokio::spawn(start()).await {
                Ok(err) => {
                    log::error!("Task runner stopped: {}", err);
                    return SupervisorError::Escalated(err);
                }
                Err(e) => log::error!("Task runner died: {}", e),
            }
            if restarts > 0 && started.elapsed() >= stable {
                log::info!("Task runner was up for {:?}, resetting restart count", started.elapsed());
                restarts = 0;
            }

            if let Some(max) = self.policy.max_restarts {
                if restarts >= max {
                    return SupervisorError::GaveUp { restarts };
                }
            }

            let delay = calculate_backoff_delay(
                restarts,
                &self.policy.strategy,
                self.policy.initial_delay_secs,
                self.policy.max_delay_secs,
            );
            restarts += 1;
            log::warn!("Restarting task runner in {}s (restart #{})", delay, restarts);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }
}

/// Calculate next restart delay based on backoff strategy
pub fn calculate_backoff_delay(
    attempt: u32,
    strategy: &BackoffStrategy,
    initial_delay: u64,
    max_delay: u64,
) -> u64 {
    let delay = match strategy {
        BackoffStrategy::Fixed => initial_delay,
        BackoffStrategy::Linear => initial_delay.saturating_mul(attempt as u64 + 1),
        BackoffStrategy::Exponential => {
            initial_delay.saturating_mul(2_u64.saturating_pow(attempt))
        },
    };

    delay.min(max_delay)
}
