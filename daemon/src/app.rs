use crate::runner::{InFlight, Runner};
use crate::supervisor::{Supervisor, SupervisorError};
use common::{Job, RestartPolicy};
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Name of the runtime thread the job runs on.
pub const RUNNER_THREAD: &str = "provisioning";

/// Why the main loop returned.
#[derive(Debug)]
pub enum Shutdown {
    Signal(Signal),
    RunnerFailed(SupervisorError),
}

impl Shutdown {
    pub fn exit_code(&self) -> i32 {
        match self {
            Shutdown::Signal(_) => common::exit::OK,
            Shutdown::RunnerFailed(_) => common::exit::RUNNER_FAILED,
        }
    }
}

/// One worker thread for the runner; the main thread drives `block_on`
/// and with it the heartbeat. Build only after daemonizing.
pub fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(RUNNER_THREAD)
        .enable_all()
        .build()
}

fn listen(signals: &[Signal]) -> std::io::Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(signals.len().max(1));
    for &sig in signals {
        let mut stream = signal(SignalKind::from_raw(sig as i32))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

/// Runs the supervised job and the heartbeat until a terminate signal
/// arrives or supervision gives up.
pub async fn run(
    job: Job,
    restart: RestartPolicy,
    heartbeat: Duration,
    terminate: &[Signal],
) -> anyhow::Result<Shutdown> {
    let mut signals = listen(terminate)?;

    let in_flight = InFlight::default();
    let mut supervisor = tokio::spawn(
        Supervisor::new(restart).supervise(move || Runner::new(job.clone(), in_flight.clone()).run()),
    );

    let mut ticker = tokio::time::interval(heartbeat);
    loop {
        tokio::select! {
            _ = ticker.tick() => log::debug!("alive"),
            Some(sig) = signals.recv() => {
                log::info!("Received {}, shutting down", sig);
                supervisor.abort();
                return Ok(Shutdown::Signal(sig));
            }
            res = &mut supervisor => {
                let err = res?;
                log::error!("Supervision gave up: {}", err);
                return Ok(Shutdown::RunnerFailed(err));
            }
        }
    }
}
