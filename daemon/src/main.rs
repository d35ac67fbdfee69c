use clap::Parser;
use common::exit;
use std::path::PathBuf;
use std::time::Duration;
use tickerd::config::Config;
use tickerd::daemon::{DaemonContext, DaemonError, PidLock};
use tickerd::{app, logging};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML or TOML config file (falls back to $TICKERD_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Stay attached to the terminal; still takes the PID lock
    #[arg(short, long)]
    foreground: bool,
}

/// A startup or runtime error together with the exit status it maps to.
struct Fatal {
    code: i32,
    error: anyhow::Error,
}

trait OrExit<T> {
    fn or_exit(self, code: i32) -> Result<T, Fatal>;
}

impl<T, E: Into<anyhow::Error>> OrExit<T> for Result<T, E> {
    fn or_exit(self, code: i32) -> Result<T, Fatal> {
        self.map_err(|e| Fatal { code, error: e.into() })
    }
}

impl From<DaemonError> for Fatal {
    fn from(e: DaemonError) -> Self {
        let code = match e {
            DaemonError::LockHeld { .. } => exit::LOCK_HELD,
            _ => exit::STARTUP,
        };
        Fatal { code, error: e.into() }
    }
}

fn main() {
    let cli = Cli::parse();
    let foreground = cli.foreground;

    // Everything `run` owns, the PID lock included, is dropped before exit.
    let code = match run(cli) {
        Ok(code) => code,
        Err(fatal) => {
            log::error!("{:#}", fatal.error);
            if !(foreground && log::max_level() != log::LevelFilter::Off) {
                eprintln!("tickerd: {:#}", fatal.error);
            }
            fatal.code
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32, Fatal> {
    let config = Config::load(cli.config.as_deref()).or_exit(exit::CONFIG)?;
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let settings = config.resolve(home.as_deref()).or_exit(exit::CONFIG)?;

    // A refused instance must not write to, or rotate, the live daemon's log.
    let lock = PidLock::acquire(&settings.pid_file, settings.lock_timeout)?;

    let log_file = logging::init(&settings.log, cli.foreground).or_exit(exit::STARTUP)?;
    log::info!("Starting tickerd {}...", env!("CARGO_PKG_VERSION"));
    log::info!("pid = {:?} log = {:?}", settings.pid_file, settings.log.path);
    if let Some(stale) = lock.reclaimed() {
        log::warn!("Reclaimed stale PID file {:?} left by pid {}", lock.path(), stale);
    }

    let ctx = DaemonContext::from_settings(&settings, &log_file, !cli.foreground).or_exit(exit::STARTUP)?;
    for line in ctx.to_string().lines() {
        log::info!("{}", line);
    }
    if ctx.detach {
        log::info!("About to daemonize...");
    }

    let guard = ctx.open(lock)?;

    let runtime = app::build_runtime().or_exit(exit::STARTUP)?;
    let shutdown = runtime
        .block_on(app::run(
            settings.job.clone(),
            settings.supervisor.clone(),
            settings.heartbeat_interval,
            guard.terminate_signals(),
        ))
        .or_exit(exit::STARTUP)?;
    runtime.shutdown_timeout(Duration::from_secs(5));

    log::info!("Shutting down: {:?}", shutdown);
    drop(guard);
    Ok(shutdown.exit_code())
}
