use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tokio::sync::watch;
use tracing::{error, info};

use bounce_config::AppConfig;
use bounce_runtime::run_watch_daemon;

use crate::startup::prepare_collaborators;

/// Set on the child spawned by `daemon start`.
pub(crate) const DAEMON_PROCESS_ENV: &str = "BOUNCE_WATCHER_DAEMON_PROCESS";

#[derive(Debug, Clone)]
pub(crate) struct DaemonPaths {
    runtime_dir: PathBuf,
    pub(crate) pid_file: PathBuf,
    pub(crate) log_file: PathBuf,
    pub(crate) lock_file: PathBuf,
}

pub(crate) fn daemon_paths(config: &AppConfig) -> DaemonPaths {
    let runtime_dir = config.daemon.runtime_dir.clone();
    DaemonPaths {
        pid_file: runtime_dir.join("bounce-watcher.pid"),
        log_file: runtime_dir.join("daemon.log"),
        lock_file: runtime_dir.join("bounce-watcher.lock"),
        runtime_dir,
    }
}

/// Whether some process currently holds the exclusive lock on `path`.
pub(crate) fn is_lock_held(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

/// Take the single-instance lock and record our pid.  The lock lives as
/// long as the returned file.
pub(crate) fn acquire_instance_lock(paths: &DaemonPaths) -> Result<File> {
    fs::create_dir_all(&paths.runtime_dir)
        .with_context(|| format!("creating {}", paths.runtime_dir.display()))?;
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&paths.lock_file)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another bounce-watcher instance already holds the lock"))?;
    fs::write(&paths.pid_file, std::process::id().to_string())?;
    Ok(lock_file)
}

pub(crate) fn daemon_start(config: &AppConfig, config_path: &Path, no_notify: bool, force: bool) -> Result<()> {
    config.validate()?;
    let paths = daemon_paths(config);
    fs::create_dir_all(&paths.runtime_dir)?;

    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            if !force {
                bail!(
                    "daemon already running with pid {pid}; use `bounce-watcher daemon restart` or `bounce-watcher daemon start --force`"
                );
            }
            terminate_pid(pid)?;
            wait_for_pid_exit(pid, Duration::from_secs(4));
        }
        let _ = fs::remove_file(&paths.pid_file);
    }

    // A crashed daemon leaves its lock file behind; nothing holds it now.
    if force && paths.lock_file.exists() && !is_lock_held(&paths.lock_file) {
        let _ = fs::remove_file(&paths.lock_file);
    }

    let exe = std::env::current_exe()?;
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let err = out.try_clone()?;

    let mut command = Command::new(exe);
    command.arg("--config").arg(config_path);
    if no_notify {
        command.arg("--no-notify");
    }
    let mut child = command
        .arg("run")
        .env(DAEMON_PROCESS_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()?;

    for _ in 0..40 {
        if is_lock_held(&paths.lock_file) {
            println!("daemon started");
            println!("- pid: {}", child.id());
            println!("- config: {}", config_path.display());
            println!("- log: {}", paths.log_file.display());
            return Ok(());
        }

        if let Some(status) = child.try_wait()? {
            let _ = fs::remove_file(&paths.pid_file);
            bail!(
                "daemon exited during startup with status {status}; check {}",
                paths.log_file.display()
            );
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    bail!(
        "daemon did not become ready; check {}",
        paths.log_file.display()
    )
}

pub(crate) fn daemon_stop(config: &AppConfig) -> Result<()> {
    let paths = daemon_paths(config);

    let Some(pid) = read_pid(&paths.pid_file)? else {
        println!("daemon is not running");
        return Ok(());
    };

    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        println!("daemon was not running (stale pid file cleaned)");
        return Ok(());
    }

    terminate_pid(pid)?;
    // Leave room for in-flight conversions to finish their grace period.
    let grace = Duration::from_secs(config.scheduler.shutdown_grace_secs + 4);
    wait_for_pid_exit(pid, grace);
    if is_pid_running(pid) {
        bail!("daemon pid {pid} did not exit within {}s", grace.as_secs());
    }
    let _ = fs::remove_file(&paths.pid_file);
    println!("daemon stopped (pid {pid})");
    Ok(())
}

pub(crate) fn daemon_status(config: &AppConfig) -> Result<()> {
    let paths = daemon_paths(config);
    let running = match read_pid(&paths.pid_file)? {
        Some(pid) if is_pid_running(pid) => Some(pid),
        _ => None,
    };

    match running {
        Some(pid) => {
            println!("daemon status: running");
            println!("- pid: {pid}");
        }
        None if is_lock_held(&paths.lock_file) => {
            println!("daemon status: running (foreground or unknown pid)");
        }
        None => println!("daemon status: stopped"),
    }
    println!("- source: {:?}", config.source.mode);
    println!("- destination: {}", config.destination.active_path().display());
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

pub(crate) fn wait_for_pid_exit(pid: u32, timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::from_millis(0);
    while waited < timeout {
        if !is_pid_running(pid) {
            return;
        }
        std::thread::sleep(step);
        waited += step;
    }
}

pub(crate) fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

pub(crate) fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub(crate) fn terminate_pid(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("kill").arg(pid.to_string()).status()?;
        if !status.success() {
            bail!("failed to terminate daemon pid {pid}");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("daemon stop is only implemented on unix in this build")
    }
}

/// Resolves once SIGTERM or SIGINT arrives.
async fn wait_for_termination() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

/// Run the watcher in this process until a termination signal.
pub(crate) async fn run_watcher_process(config: AppConfig, no_notify: bool) -> Result<()> {
    let paths = daemon_paths(&config);
    let _lock = acquire_instance_lock(&paths)?;

    let collaborators = prepare_collaborators(&config, no_notify).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = tokio::spawn(run_watch_daemon(config, collaborators, shutdown_rx));

    let signals = tokio::spawn(async move {
        if let Err(err) = wait_for_termination().await {
            error!(error = %err, "signal handling failed");
        }
        let _ = shutdown_tx.send(true);
    });

    let result = match daemon.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("watcher task failed: {err}")),
    };
    signals.abort();

    let _ = fs::remove_file(&paths.pid_file);
    result
}
