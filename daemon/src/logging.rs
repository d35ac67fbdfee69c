//! Rotating file logging behind the `log` facade.
//!
//! Records are rendered by a `fern` dispatch and committed to a
//! [`RotatingFile`] one whole record at a time, so a line is never split
//! across two files and lines from different threads never interleave.

use crate::config::{within_root, LogSettings};
use anyhow::Context;
use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A log file capped at `max_bytes`, keeping `backup_count` numbered
/// backups (`name.1` is the newest).
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    file: File,
    len: u64,
    redirect_std: bool,
}

impl RotatingFile {
    pub fn open(path: &Path, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = open_append(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backup_count,
            file,
            len,
            redirect_std: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// Writes one complete record, rotating first if it would push the
    /// current file past `max_bytes`.
    pub fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        if self.len > 0 && self.len + record.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(record)?;
        self.len += record.len() as u64;
        Ok(())
    }

    pub fn rotate(&mut self) -> io::Result<()> {
        if self.backup_count == 0 {
            self.file.set_len(0)?;
            self.len = 0;
            return Ok(());
        }

        let oldest = self.backup_path(self.backup_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.backup_count).rev() {
            let src = self.backup_path(n);
            if src.exists() {
                fs::rename(&src, self.backup_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = open_append(&self.path)?;
        self.len = 0;
        if self.redirect_std {
            self.point_std_streams()?;
        }
        Ok(())
    }

    fn point_std_streams(&self) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        for target in [io::stdout().as_raw_fd(), io::stderr().as_raw_fd()] {
            nix::unistd::dup2(fd, target).map_err(io::Error::from)?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Shared handle to the process log file.
#[derive(Clone)]
pub struct LogFile(Arc<Mutex<RotatingFile>>);

impl LogFile {
    pub fn open(path: &Path, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(RotatingFile::open(path, max_bytes, backup_count)?))))
    }

    fn lock(&self) -> MutexGuard<'_, RotatingFile> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path().to_path_buf()
    }

    /// Re-expresses the path as seen from inside `root` so rotation keeps
    /// working after a chroot.
    pub fn enter_root(&self, root: &Path) {
        let mut file = self.lock();
        if let Some(path) = within_root(root, &file.path) {
            file.path = path;
        }
    }

    /// Descriptor of the current file; it changes after a rotation.
    pub fn raw_fd(&self) -> RawFd {
        self.lock().file.as_raw_fd()
    }

    /// Points stdout and stderr at the log file, now and after every rotation.
    pub fn redirect_std_streams(&self) -> io::Result<()> {
        let mut file = self.lock();
        file.redirect_std = true;
        file.point_std_streams()
    }

    pub fn writer(&self) -> RecordWriter {
        RecordWriter {
            file: self.clone(),
            pending: Vec::new(),
        }
    }
}

/// Buffers a record and commits it to the log file on `flush`.
pub struct RecordWriter {
    file: LogFile,
    pending: Vec<u8>,
}

impl Write for RecordWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let result = self.file.lock().write_record(&self.pending);
        self.pending.clear();
        result
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// `<time> <LEVEL>: <file>:<module>:<line> : [<thread>]: <message>`
pub fn render(now: &DateTime<Local>, message: &fmt::Arguments, record: &log::Record, thread: &str) -> String {
    let file = record
        .file()
        .and_then(|f| Path::new(f).file_name())
        .and_then(|f| f.to_str())
        .unwrap_or("?");
    format!(
        "{:<15} {:<8}: {:<10}:{:<30}:{:>3} : [{:<12}]: {}",
        now.format("%Y-%m-%d %H:%M:%S,%3f"),
        record.level(),
        file,
        record.module_path().unwrap_or_else(|| record.target()),
        record.line().unwrap_or(0),
        thread,
        message
    )
}

/// Installs the global logger. Must run before daemonizing so every
/// lifecycle step is captured.
pub fn init(settings: &LogSettings, echo_stderr: bool) -> anyhow::Result<LogFile> {
    let log_file = LogFile::open(&settings.path, settings.max_bytes, settings.backup_count)
        .with_context(|| format!("Failed to open log file {:?}", settings.path))?;

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            let thread = std::thread::current();
            out.finish(format_args!(
                "{}",
                render(&Local::now(), message, record, thread.name().unwrap_or("<unnamed>"))
            ))
        })
        .level(settings.level)
        .chain(Box::new(log_file.writer()) as Box<dyn Write + Send>);

    if echo_stderr {
        dispatch = dispatch.chain(io::stderr());
    }
    dispatch.apply().context("Logger already installed")?;

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log::error!("{}", info);
        previous(info);
    }));

    Ok(log_file)
}
