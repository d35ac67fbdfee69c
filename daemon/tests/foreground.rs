use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_tickerd");

fn write_config(dir: &Path, lock_timeout: &str) -> PathBuf {
    write_config_with(dir, lock_timeout, "")
}

fn write_config_with(dir: &Path, lock_timeout: &str, extra: &str) -> PathBuf {
    let script = dir.join("my_script.bash");
    fs::write(&script, "#!/bin/sh\necho ok\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let config = dir.join("tickerd.yaml");
    fs::write(
        &config,
        format!(
            "daemon:\n  working_directory: {}\n  heartbeat_interval: 1s\n  lock_timeout: {}\n\
             job:\n  interval: 1s\n{}",
            dir.display(),
            lock_timeout,
            extra
        ),
    )
    .unwrap();
    config
}

fn spawn(config: &Path, foreground: bool) -> Child {
    let mut cmd = Command::new(BIN);
    cmd.arg("--config").arg(config);
    if foreground {
        cmd.arg("--foreground");
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    done()
}

fn log_text(dir: &Path) -> String {
    fs::read_to_string(dir.join("tickerd.log")).unwrap_or_default()
}

fn read_pid(dir: &Path) -> Option<i32> {
    fs::read_to_string(dir.join("tickerd.pid")).ok()?.trim().parse().ok()
}

#[test]
fn foreground_runs_job_and_releases_lock_on_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "0s");
    let mut first = spawn(&config, true);

    assert!(wait_for(Duration::from_secs(10), || {
        log_text(dir.path()).matches("script output: ok").count() >= 2
    }));
    let log = log_text(dir.path());
    assert!(log.contains("alive"));
    assert!(log.contains("[provisioning]"));
    assert_eq!(read_pid(dir.path()), Some(first.id() as i32));

    let second = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .arg("--foreground")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(second.code(), Some(common::exit::LOCK_HELD));

    kill(Pid::from_raw(first.id() as i32), Signal::SIGTERM).unwrap();
    let status = first.wait().unwrap();
    assert_eq!(status.code(), Some(common::exit::OK));
    assert!(!dir.path().join("tickerd.pid").exists());
}

#[test]
fn sighup_shuts_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "0s");
    let mut daemon = spawn(&config, true);

    // Handlers are installed before the first heartbeat.
    assert!(wait_for(Duration::from_secs(10), || log_text(dir.path()).contains("alive")));
    kill(Pid::from_raw(daemon.id() as i32), Signal::SIGHUP).unwrap();

    let status = daemon.wait().unwrap();
    assert_eq!(status.code(), Some(common::exit::OK));
    assert!(!dir.path().join("tickerd.pid").exists());
    assert!(log_text(dir.path()).contains("Received SIGHUP"));
}

#[test]
fn refused_instance_leaves_the_live_log_alone() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config_with(
        dir.path(),
        "0s",
        "logging:\n  max_bytes: 4000\n  backup_count: 2\n",
    );
    let mut first = spawn(&config, true);
    assert!(wait_for(Duration::from_secs(10), || {
        log_text(dir.path()).contains("script output: ok")
    }));

    let second = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .arg("--foreground")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(second.code(), Some(common::exit::LOCK_HELD));

    kill(Pid::from_raw(first.id() as i32), Signal::SIGTERM).unwrap();
    assert_eq!(first.wait().unwrap().code(), Some(common::exit::OK));

    let mut all = log_text(dir.path());
    for n in 1..=2 {
        all.push_str(&fs::read_to_string(dir.path().join(format!("tickerd.log.{}", n))).unwrap_or_default());
    }
    assert_eq!(all.matches("Starting tickerd").count(), 1);
    assert!(log_text(dir.path()).contains("Received SIGTERM"));
}

#[test]
fn detached_daemon_outlives_its_launcher() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "0s");

    let launcher = spawn(&config, false);
    let launcher_pid = launcher.id() as i32;
    assert!(launcher.wait_with_output().unwrap().status.success());

    // The launcher writes its own PID before forking; wait for the daemon's.
    assert!(wait_for(Duration::from_secs(10), || {
        read_pid(dir.path()).map_or(false, |pid| pid != launcher_pid)
    }));
    let pid = read_pid(dir.path()).unwrap();
    assert!(wait_for(Duration::from_secs(10), || {
        log_text(dir.path()).contains("script output: ok")
    }));

    kill(Pid::from_raw(pid), Signal::SIGTERM).unwrap();
    assert!(wait_for(Duration::from_secs(10), || !dir.path().join("tickerd.pid").exists()));
    assert!(log_text(dir.path()).contains("Received SIGTERM"));
}

#[test]
fn invalid_config_exits_with_config_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bad.yaml");
    fs::write(&config, "job:\n  interval: 0s\n").unwrap();

    let status = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(common::exit::CONFIG));
}
