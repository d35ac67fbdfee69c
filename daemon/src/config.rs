use anyhow::{Context, Result};
use common::schedule::{duration, option_duration};
use common::{FailurePolicy, Job, JobLabel, RestartPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Defaults to `$HOME/tickerd`.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default)]
    pub umask: u32,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub chroot: Option<PathBuf>,
    #[serde(default = "default_lock_timeout", with = "duration")]
    pub lock_timeout: Duration,
    #[serde(default = "default_heartbeat_interval", with = "duration")]
    pub heartbeat_interval: Duration,
}

fn default_pid_file() -> PathBuf { PathBuf::from(common::DEFAULT_PID_FILE) }
fn default_lock_timeout() -> Duration { Duration::from_secs(5) }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(10) }

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            working_directory: None,
            pid_file: default_pid_file(),
            umask: 0,
            user: None,
            group: None,
            chroot: None,
            lock_timeout: default_lock_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
}

fn default_log_file() -> PathBuf { PathBuf::from(common::DEFAULT_LOG_FILE) }
fn default_log_level() -> String { "debug".to_string() }
fn default_max_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_backup_count() -> u32 { 2 }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            level: default_log_level(),
            max_bytes: default_max_bytes(),
            backup_count: default_backup_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub label: JobLabel,
    #[serde(default = "default_command")]
    pub command: PathBuf,
    #[serde(default = "default_interval", with = "duration")]
    pub interval: Duration,
    #[serde(default, with = "option_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_command() -> PathBuf { PathBuf::from(common::DEFAULT_JOB_COMMAND) }
fn default_interval() -> Duration { Duration::from_secs(5) }

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            label: JobLabel::default(),
            command: default_command(),
            interval: default_interval(),
            timeout: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub supervisor: RestartPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no working directory configured and HOME is not set")]
    MissingWorkingDirectory,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid log level {0:?}")]
    BadLevel(String),
    #[error("cannot resolve relative working directory: {0}")]
    CurrentDir(#[source] std::io::Error),
    #[error("{key} {path:?} is outside the chroot directory {root:?}")]
    OutsideChroot {
        key: &'static str,
        path: PathBuf,
        root: PathBuf,
    },
}

/// Fully resolved settings: absolute paths, parsed level, the job itself.
///
/// With a chroot, `pid_file` and `log.path` are as seen before it (they are
/// opened first), while `working_dir` and the job's paths are as seen from
/// inside it.
#[derive(Debug, Clone)]
pub struct Settings {
    pub working_dir: PathBuf,
    pub pid_file: PathBuf,
    pub umask: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    pub chroot: Option<PathBuf>,
    pub lock_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub log: LogSettings,
    pub job: Job,
    pub supervisor: RestartPolicy,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub path: PathBuf,
    pub level: log::LevelFilter,
    pub max_bytes: u64,
    pub backup_count: u32,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// Explicit path first, then `$TICKERD_CONFIG`, then built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var_os(common::CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn resolve(&self, home: Option<&Path>) -> Result<Settings, ConfigError> {
        let working_dir = match (&self.daemon.working_directory, home) {
            (Some(dir), _) => dir.clone(),
            (None, Some(home)) => home.join(common::DEFAULT_DIR_NAME),
            (None, None) => return Err(ConfigError::MissingWorkingDirectory),
        };
        // Everything is resolved before the daemon changes directory.
        let working_dir = absolute(working_dir)?;
        let chroot = self.daemon.chroot.clone().map(absolute).transpose()?;

        if self.job.interval.is_zero() {
            return Err(ConfigError::Zero("job.interval"));
        }
        if self.daemon.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("daemon.heartbeat_interval"));
        }
        if self.logging.max_bytes == 0 {
            return Err(ConfigError::Zero("logging.max_bytes"));
        }
        if let Some(timeout) = self.job.timeout {
            if timeout.is_zero() {
                return Err(ConfigError::Zero("job.timeout"));
            }
        }
        if let FailurePolicy::Escalate { max_consecutive: 0 } = self.job.failure_policy {
            return Err(ConfigError::Zero("job.failure_policy.max_consecutive"));
        }
        let level = self.logging.level.parse::<log::LevelFilter>()
            .map_err(|_| ConfigError::BadLevel(self.logging.level.clone()))?;

        let pid_file = under(&working_dir, &self.daemon.pid_file);
        let log_path = under(&working_dir, &self.logging.file);
        let mut command = under(&working_dir, &self.job.command);
        let mut working_dir = working_dir;

        if let Some(root) = &chroot {
            let inside = |key: &'static str, path: &Path| {
                within_root(root, path).ok_or_else(|| ConfigError::OutsideChroot {
                    key,
                    path: path.to_path_buf(),
                    root: root.clone(),
                })
            };
            inside("logging.file", &log_path)?;
            inside("daemon.pid_file", &pid_file)?;
            command = inside("job.command", &command)?;
            working_dir = inside("daemon.working_directory", &working_dir)?;
        }

        Ok(Settings {
            pid_file,
            umask: self.daemon.umask,
            user: self.daemon.user.clone(),
            group: self.daemon.group.clone(),
            chroot,
            lock_timeout: self.daemon.lock_timeout,
            heartbeat_interval: self.daemon.heartbeat_interval,
            log: LogSettings {
                path: log_path,
                level,
                max_bytes: self.logging.max_bytes,
                backup_count: self.logging.backup_count,
            },
            job: Job {
                label: self.job.label.clone(),
                command,
                working_dir: working_dir.clone(),
                interval: self.job.interval,
                timeout: self.job.timeout,
                failure_policy: self.job.failure_policy,
            },
            supervisor: self.supervisor.clone(),
            working_dir,
        })
    }
}

/// `path` as seen after `chroot(root)`, or `None` if it lies outside.
pub fn within_root(root: &Path, path: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(|rest| Path::new("/").join(rest))
}

fn absolute(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir().map_err(ConfigError::CurrentDir)?.join(path))
    }
}

fn under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::BackoffStrategy;

    #[test]
    fn defaults_match_documented_layout() {
        let settings = Config::default().resolve(Some(Path::new("/home/dc"))).unwrap();
        assert_eq!(settings.working_dir, PathBuf::from("/home/dc/tickerd"));
        assert_eq!(settings.pid_file, PathBuf::from("/home/dc/tickerd/tickerd.pid"));
        assert_eq!(settings.log.path, PathBuf::from("/home/dc/tickerd/tickerd.log"));
        assert_eq!(settings.log.max_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.log.backup_count, 2);
        assert_eq!(settings.log.level, log::LevelFilter::Debug);
        assert_eq!(settings.job.command, PathBuf::from("/home/dc/tickerd/my_script.bash"));
        assert_eq!(settings.job.interval, Duration::from_secs(5));
        assert_eq!(settings.job.label.0, "myscript");
        assert_eq!(settings.job.timeout, None);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(settings.job.failure_policy, FailurePolicy::Ignore);
    }

    #[test]
    fn relative_working_dir_becomes_absolute() {
        let mut config = Config::default();
        config.daemon.working_directory = Some(PathBuf::from("run"));
        let settings = config.resolve(None).unwrap();
        assert!(settings.working_dir.is_absolute());
        assert!(settings.working_dir.ends_with("run"));
        assert!(settings.pid_file.starts_with(&settings.working_dir));
    }

    #[test]
    fn missing_home_and_working_dir_is_an_error() {
        let err = Config::default().resolve(None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingWorkingDirectory));
    }

    #[test]
    fn yaml_overrides_and_absolute_paths() {
        let yaml = r#"
daemon:
  working_directory: /srv/tick
  pid_file: /run/tick.pid
  heartbeat_interval: 30s
logging:
  level: info
  backup_count: 5
job:
  command: bin/run.sh
  interval: 2m
  timeout: 45s
  failure_policy: { kind: escalate, max_consecutive: 3 }
supervisor:
  strategy: fixed
  max_restarts: null
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let settings = config.resolve(None).unwrap();
        assert_eq!(settings.pid_file, PathBuf::from("/run/tick.pid"));
        assert_eq!(settings.log.path, PathBuf::from("/srv/tick/tickerd.log"));
        assert_eq!(settings.log.level, log::LevelFilter::Info);
        assert_eq!(settings.log.backup_count, 5);
        assert_eq!(settings.job.command, PathBuf::from("/srv/tick/bin/run.sh"));
        assert_eq!(settings.job.working_dir, PathBuf::from("/srv/tick"));
        assert_eq!(settings.job.interval, Duration::from_secs(120));
        assert_eq!(settings.job.timeout, Some(Duration::from_secs(45)));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.job.failure_policy, FailurePolicy::Escalate { max_consecutive: 3 });
        assert_eq!(settings.supervisor.strategy, BackoffStrategy::Fixed);
        assert_eq!(settings.supervisor.max_restarts, None);
    }

    #[test]
    fn toml_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickerd.toml");
        fs::write(&path, r#"
[daemon]
working_directory = "/opt/tick"
umask = 0o022

[job]
interval = 7
"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.daemon.umask, 0o022);
        assert_eq!(config.job.interval, Duration::from_secs(7));
        assert_eq!(config.logging.max_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickerd.ini");
        fs::write(&path, "").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn zero_values_are_rejected() {
        let mut config = Config::default();
        config.job.interval = Duration::ZERO;
        assert!(matches!(config.resolve(Some(Path::new("/h"))), Err(ConfigError::Zero("job.interval"))));

        let mut config = Config::default();
        config.logging.max_bytes = 0;
        assert!(matches!(config.resolve(Some(Path::new("/h"))), Err(ConfigError::Zero("logging.max_bytes"))));

        let mut config = Config::default();
        config.job.failure_policy = FailurePolicy::Escalate { max_consecutive: 0 };
        assert!(config.resolve(Some(Path::new("/h"))).is_err());
    }

    #[test]
    fn example_config_parses() {
        let config: Config = serde_yaml::from_str(include_str!("../../tickerd.example.yaml")).unwrap();
        let settings = config.resolve(None).unwrap();
        assert_eq!(settings.working_dir, PathBuf::from("/home/dc/tickerd"));
        assert_eq!(settings.lock_timeout, Duration::from_secs(5));
        assert_eq!(settings.supervisor, RestartPolicy::default());
    }

    #[test]
    fn chroot_rebases_paths_used_inside_it() {
        let mut config = Config::default();
        config.daemon.working_directory = Some(PathBuf::from("/srv/jail/tick"));
        config.daemon.chroot = Some(PathBuf::from("/srv/jail"));
        let settings = config.resolve(None).unwrap();

        assert_eq!(settings.chroot, Some(PathBuf::from("/srv/jail")));
        assert_eq!(settings.pid_file, PathBuf::from("/srv/jail/tick/tickerd.pid"));
        assert_eq!(settings.log.path, PathBuf::from("/srv/jail/tick/tickerd.log"));
        assert_eq!(settings.working_dir, PathBuf::from("/tick"));
        assert_eq!(settings.job.working_dir, PathBuf::from("/tick"));
        assert_eq!(settings.job.command, PathBuf::from("/tick/my_script.bash"));
    }

    #[test]
    fn chroot_rejects_files_outside_it() {
        let mut config = Config::default();
        config.daemon.working_directory = Some(PathBuf::from("/srv/jail/tick"));
        config.daemon.chroot = Some(PathBuf::from("/srv/jail"));
        config.logging.file = PathBuf::from("/var/log/tickerd.log");

        match config.resolve(None) {
            Err(ConfigError::OutsideChroot { key, path, .. }) => {
                assert_eq!(key, "logging.file");
                assert_eq!(path, PathBuf::from("/var/log/tickerd.log"));
            }
            other => panic!("expected OutsideChroot, got {:?}", other),
        }
    }

    #[test]
    fn oversized_duration_is_a_parse_error() {
        let res: Result<Config, _> = serde_yaml::from_str("job:\n  interval: 9999999999999999999m\n");
        assert!(res.is_err());
    }

    #[test]
    fn bad_level_is_rejected() {
        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(matches!(config.resolve(Some(Path::new("/h"))), Err(ConfigError::BadLevel(_))));
    }
}
