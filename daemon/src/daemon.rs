//! Detaching from the terminal and holding the PID lock.
//!
//! The [`PidLock`] is taken *before* forking, and before anything is
//! written to the log, then handed to [`DaemonContext::open`]. `flock`
//! locks belong to the open file description, which the forked child
//! inherits, so the lock stays held by the daemon after the parent exits
//! and a second instance is rejected in the foreground with a real exit
//! status without touching the live daemon's files.

use crate::config::{within_root, Settings};
use crate::logging::LogFile;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{self, ForkResult, Gid, Group, Pid, Uid, User};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("PID file {path:?} is locked by another instance{}", held_by(.pid))]
    LockHeld { path: PathBuf, pid: Option<i32> },
    #[error("failed to {context} {path:?}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{context} failed: {source}")]
    Errno {
        context: &'static str,
        #[source]
        source: Errno,
    },
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
}

fn held_by(pid: &Option<i32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {})", pid),
        None => String::new(),
    }
}

fn io_err(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> DaemonError {
    let path = path.to_path_buf();
    move |source| DaemonError::Io { context, path, source }
}

fn errno(context: &'static str) -> impl FnOnce(Errno) -> DaemonError {
    move |source| DaemonError::Errno { context, source }
}

/// An exclusively `flock`ed file holding the owner's PID.
///
/// Dropping it removes the file (if it still names this process) and
/// closes the descriptor, which releases the lock.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: File,
    reclaimed: Option<i32>,
}

impl PidLock {
    /// Retries until `timeout` elapses, then reports the holder. Creates
    /// the parent directory if missing.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err("create PID file directory", parent))?;
        }
        let deadline = Instant::now() + timeout;
        let file = loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o644)
                .open(path)
                .map_err(io_err("open PID file", path))?;
            lock_until(&file, path, deadline)?;
            // The previous holder may have unlinked the file while we waited.
            if same_file(&file, path) {
                break file;
            }
        };

        let mut lock = Self {
            path: path.to_path_buf(),
            file,
            reclaimed: None,
        };
        lock.reclaimed = lock.pid().filter(|&stale| stale != Pid::this().as_raw());
        lock.write_pid(Pid::this())?;
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID found in the file when it was taken over, if it was not ours.
    pub fn reclaimed(&self) -> Option<i32> {
        self.reclaimed
    }

    /// Re-expresses the path as seen from inside `root` after a chroot.
    pub fn enter_root(&mut self, root: &Path) {
        if let Some(path) = within_root(root, &self.path) {
            self.path = path;
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn pid(&self) -> Option<i32> {
        read_pid(&self.file)
    }

    pub fn write_pid(&self, pid: Pid) -> Result<(), DaemonError> {
        let write = || -> io::Result<()> {
            let mut file = &self.file;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", pid)?;
            file.sync_data()
        };
        write().map_err(io_err("write PID file", &self.path))
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if self.pid() == Some(Pid::this().as_raw()) {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("Failed to remove PID file {:?}: {}", self.path, e);
            }
        }
    }
}

fn lock_until(file: &File, path: &Path, deadline: Instant) -> Result<(), DaemonError> {
    loop {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EWOULDBLOCK) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(DaemonError::LockHeld {
                        path: path.to_path_buf(),
                        pid: read_pid(file),
                    });
                }
                std::thread::sleep(LOCK_POLL.min(deadline - now));
            }
            Err(e) => return Err(DaemonError::Errno { context: "flock", source: e }),
        }
    }
}

fn same_file(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

fn read_pid(mut file: &File) -> Option<i32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Ignore,
    /// Shut down in an orderly way so the guard is dropped.
    Terminate,
}

pub fn default_signal_map() -> Vec<(Signal, SignalAction)> {
    vec![
        (Signal::SIGTSTP, SignalAction::Ignore),
        (Signal::SIGTTIN, SignalAction::Ignore),
        (Signal::SIGTTOU, SignalAction::Ignore),
        (Signal::SIGTERM, SignalAction::Terminate),
        (Signal::SIGINT, SignalAction::Terminate),
        (Signal::SIGHUP, SignalAction::Terminate),
    ]
}

/// Everything needed to turn the current process into the daemon.
pub struct DaemonContext {
    pub working_directory: PathBuf,
    pub pid_file: PathBuf,
    pub umask: u32,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub chroot_directory: Option<PathBuf>,
    pub signal_map: Vec<(Signal, SignalAction)>,
    /// Descriptors kept open across detachment besides 0, 1, 2.
    pub files_preserve: Vec<RawFd>,
    /// Where stdout and stderr go once detached; `/dev/null` if unset.
    pub output: Option<LogFile>,
    /// `false` keeps the process in the foreground but still locks.
    pub detach: bool,
}

impl DaemonContext {
    pub fn new(working_directory: &Path, pid_file: &Path) -> Self {
        Self {
            working_directory: working_directory.to_path_buf(),
            pid_file: pid_file.to_path_buf(),
            umask: 0,
            uid: None,
            gid: None,
            chroot_directory: None,
            signal_map: default_signal_map(),
            files_preserve: Vec::new(),
            output: None,
            detach: true,
        }
    }

    pub fn from_settings(settings: &Settings, log_file: &LogFile, detach: bool) -> Result<Self, DaemonError> {
        let mut ctx = Self::new(&settings.working_dir, &settings.pid_file);
        ctx.umask = settings.umask;
        ctx.chroot_directory = settings.chroot.clone();
        ctx.detach = detach;

        if let Some(name) = &settings.user {
            let user = User::from_name(name)
                .map_err(errno("user lookup"))?
                .ok_or_else(|| DaemonError::UnknownUser(name.clone()))?;
            ctx.uid = Some(user.uid);
            ctx.gid = Some(user.gid);
        }
        if let Some(name) = &settings.group {
            let group = Group::from_name(name)
                .map_err(errno("group lookup"))?
                .ok_or_else(|| DaemonError::UnknownGroup(name.clone()))?;
            ctx.gid = Some(group.gid);
        }

        ctx.files_preserve.push(log_file.raw_fd());
        ctx.output = Some(log_file.clone());
        Ok(ctx)
    }

    pub fn terminate_signals(&self) -> Vec<Signal> {
        self.signal_map
            .iter()
            .filter(|(_, action)| *action == SignalAction::Terminate)
            .map(|(sig, _)| *sig)
            .collect()
    }

    /// Detaches while holding `lock` and returns the guard that undoes it
    /// all.
    ///
    /// Must run while the process has a single thread: it forks.
    pub fn open(self, mut lock: PidLock) -> Result<DaemonGuard, DaemonError> {
        if let Some(root) = &self.chroot_directory {
            unistd::chroot(root.as_path()).map_err(errno("chroot"))?;
            lock.enter_root(root);
            if let Some(log_file) = &self.output {
                log_file.enter_root(root);
            }
        }
        umask(Mode::from_bits_truncate(self.umask as _));
        std::env::set_current_dir(&self.working_directory)
            .map_err(io_err("change into working directory", &self.working_directory))?;

        if self.detach {
            fork_and_leave_parent("first fork")?;
            unistd::setsid().map_err(errno("setsid"))?;
            fork_and_leave_parent("second fork")?;
        }

        if let Some(gid) = self.gid {
            unistd::setgid(gid).map_err(errno("setgid"))?;
        }
        if let Some(uid) = self.uid {
            unistd::setuid(uid).map_err(errno("setuid"))?;
        }

        if self.detach {
            let mut keep = self.files_preserve.clone();
            keep.push(lock.raw_fd());
            // A rotation since construction moves the log to a new descriptor.
            if let Some(log_file) = &self.output {
                keep.push(log_file.raw_fd());
            }
            close_open_files(&keep);
            self.redirect_streams()?;
        }

        for (sig, action) in &self.signal_map {
            if *action == SignalAction::Ignore {
                // Safe: SIG_IGN installs no handler code.
                unsafe { signal(*sig, SigHandler::SigIgn) }.map_err(errno("ignore signal"))?;
            }
        }

        lock.write_pid(Pid::this())?;
        log::info!("Daemon running as pid {}, PID file {:?}", Pid::this(), lock.path());

        Ok(DaemonGuard {
            terminate: self.terminate_signals(),
            lock,
        })
    }

    fn redirect_streams(&self) -> Result<(), DaemonError> {
        let null = Path::new("/dev/null");
        let dev_null = OpenOptions::new()
            .read(true)
            .write(true)
            .open(null)
            .map_err(io_err("open", null))?;
        unistd::dup2(dev_null.as_raw_fd(), io::stdin().as_raw_fd()).map_err(errno("redirect stdin"))?;

        match &self.output {
            Some(log_file) => log_file
                .redirect_std_streams()
                .map_err(io_err("redirect output to", &log_file.path()))?,
            None => {
                for fd in [io::stdout().as_raw_fd(), io::stderr().as_raw_fd()] {
                    unistd::dup2(dev_null.as_raw_fd(), fd).map_err(errno("redirect output"))?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for DaemonContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "working_dir={:?}", self.working_directory)?;
        writeln!(f, "pid_file={:?}", self.pid_file)?;
        writeln!(f, "uid={}", self.uid.unwrap_or_else(Uid::current))?;
        writeln!(f, "gid={}", self.gid.unwrap_or_else(Gid::current))?;
        writeln!(f, "chroot={:?}", self.chroot_directory)?;
        writeln!(f, "umask={:o}", self.umask)?;
        writeln!(f, "preserved={:?}", self.files_preserve)?;
        write!(f, "signal_map={:?}", self.signal_map)
    }
}

fn fork_and_leave_parent(context: &'static str) -> Result<(), DaemonError> {
    // Safe: callers guarantee no other threads exist yet.
    match unsafe { unistd::fork() }.map_err(errno(context))? {
        // Skips destructors so the inherited lock file is left alone.
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => Ok(()),
    }
}

fn open_fds() -> Vec<RawFd> {
    match fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect(),
        Err(_) => (0..1024).collect(),
    }
}

fn close_open_files(keep: &[RawFd]) {
    for fd in open_fds() {
        if fd > 2 && !keep.contains(&fd) {
            let _ = unistd::close(fd);
        }
    }
}

/// Held for the life of the daemon; releases the PID lock on drop.
#[derive(Debug)]
pub struct DaemonGuard {
    lock: PidLock,
    terminate: Vec<Signal>,
}

impl DaemonGuard {
    pub fn terminate_signals(&self) -> &[Signal] {
        &self.terminate
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        log::info!("Releasing PID file {:?}", self.lock.path());
    }
}
