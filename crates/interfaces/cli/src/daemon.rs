use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{info, warn};

use waypoint_config::AppConfig;
use waypoint_runtime::{DaemonClient, DaemonStatus, EngineError, RuntimePaths, run_daemon};

/// Set on the re-spawned process so it knows to log to `daemon.log`.
pub(crate) const DAEMON_ENV: &str = "WAYPOINT_DAEMON_PROCESS";

const READY_POLL: Duration = Duration::from_millis(100);
const READY_ATTEMPTS: usize = 150;
/// Exit status the daemon process uses for configuration errors.
const CONFIG_EXIT: i32 = 2;

// ── Lifecycle commands ──────────────────────────────────────────────────────

pub(crate) async fn daemon_start(paths: &RuntimePaths) -> Result<ExitCode> {
    fs::create_dir_all(&paths.runtime_dir)?;
    let client = DaemonClient::new(&paths.socket);

    if client.ping().await.is_ok() {
        println!("waypoint already running for {}", paths.root.display());
        return Ok(ExitCode::from(1));
    }

    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            println!(
                "waypoint already running for {} (pid {pid})",
                paths.root.display()
            );
            return Ok(ExitCode::from(1));
        }
        let _ = fs::remove_file(&paths.pid_file);
    }

    if lock_is_held(&paths.lock_file)? {
        println!(
            "another waypoint daemon holds {}",
            paths.lock_file.display()
        );
        return Ok(ExitCode::from(1));
    }

    if paths.socket.exists() {
        let _ = fs::remove_file(&paths.socket);
    }

    let exe = std::env::current_exe()?;
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let err = out.try_clone()?;

    let mut child = Command::new(exe)
        .arg("run")
        .arg(&paths.root)
        .env(DAEMON_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()?;

    for _ in 0..READY_ATTEMPTS {
        if client.ping().await.is_ok() {
            println!("waypoint started");
            println!("- root: {}", paths.root.display());
            println!("- pid: {}", child.id());
            println!("- socket: {}", paths.socket.display());
            println!("- log: {}", paths.log_file.display());
            return Ok(ExitCode::SUCCESS);
        }

        if let Some(status) = child.try_wait()? {
            if status.code() == Some(CONFIG_EXIT) {
                return Err(EngineError::Configuration(format!(
                    "daemon rejected its configuration; check {}",
                    paths.log_file.display()
                ))
                .into());
            }
            bail!(
                "daemon exited during startup with status {status}; check {}",
                paths.log_file.display()
            );
        }

        tokio::time::sleep(READY_POLL).await;
    }

    bail!(
        "daemon did not become ready on socket {}; check {}",
        paths.socket.display(),
        paths.log_file.display()
    )
}

pub(crate) async fn daemon_stop(paths: &RuntimePaths, config: &AppConfig) -> Result<ExitCode> {
    let client = DaemonClient::new(&paths.socket);
    let requested = client.graceful_shutdown().await.is_ok();
    if requested {
        println!("stop requested; waiting for the current cycle to finish");
    }

    let Some(pid) = read_pid(&paths.pid_file)? else {
        if requested {
            println!("waypoint stopped");
            return Ok(ExitCode::SUCCESS);
        }
        println!("no waypoint instance running for {}", paths.root.display());
        return Ok(ExitCode::from(1));
    };

    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        if requested {
            println!("waypoint stopped (pid {pid})");
            return Ok(ExitCode::SUCCESS);
        }
        println!("waypoint was not running (stale pid file cleaned)");
        return Ok(ExitCode::from(1));
    }

    // Push grace plus a margin for the cycle in progress.
    let grace = Duration::from_secs(config.engine.shutdown_grace_secs + 5);
    if !requested || !wait_for_pid_exit(pid, grace).await {
        warn!(pid, "daemon did not exit on request; sending SIGTERM");
        terminate_pid(pid)?;
        wait_for_pid_exit(pid, Duration::from_secs(4)).await;
    }

    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    println!("waypoint stopped (pid {pid})");
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn daemon_status(paths: &RuntimePaths) -> Result<ExitCode> {
    let client = DaemonClient::new(&paths.socket);
    match client.get_status().await {
        Ok(status) => {
            print!("{}", format_status(&status, Utc::now()));
            Ok(ExitCode::SUCCESS)
        }
        Err(_) => match read_pid(&paths.pid_file)? {
            Some(pid) if is_pid_running(pid) => {
                println!("waypoint status: starting or unresponsive");
                println!("- pid: {pid}");
                println!("- log: {}", paths.log_file.display());
                Ok(ExitCode::SUCCESS)
            }
            _ => {
                println!("waypoint status: stopped");
                println!("- root: {}", paths.root.display());
                println!("- log: {}", paths.log_file.display());
                Ok(ExitCode::from(1))
            }
        },
    }
}

pub(crate) async fn request_checkpoint(paths: &RuntimePaths) -> Result<ExitCode> {
    let client = DaemonClient::new(&paths.socket);
    if client.ping().await.is_err() {
        println!("no waypoint instance running for {}", paths.root.display());
        return Ok(ExitCode::from(1));
    }
    let summary = client.checkpoint_now().await?;
    println!("{summary}");
    Ok(ExitCode::SUCCESS)
}

// ── Daemon process ──────────────────────────────────────────────────────────

pub(crate) async fn run_daemon_process(
    root: PathBuf,
    config: AppConfig,
    paths: &RuntimePaths,
) -> Result<()> {
    paths.ensure()?;
    let lock_file = File::create(&paths.lock_file)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another waypoint daemon already holds the lock"))?;

    fs::write(&paths.pid_file, std::process::id().to_string())?;
    info!(pid = std::process::id(), root = %root.display(), "daemon process starting");

    let daemon = run_daemon(root, config);

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await?;
        Ok::<(), anyhow::Error>(())
    };

    tokio::pin!(daemon);
    let result = tokio::select! {
        result = &mut daemon => result,
        signalled = terminate => {
            signalled?;
            info!("signal received; shutting down");
            let client = DaemonClient::new(&paths.socket);
            let _ = client.graceful_shutdown().await;
            daemon.await
        }
    };

    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    result
}

// ── Process helpers ─────────────────────────────────────────────────────────

fn lock_is_held(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let file = OpenOptions::new().write(true).open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(false)
        }
        Err(_) => Ok(true),
    }
}

pub(crate) fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    let pid = raw.trim().parse::<u32>().ok();
    Ok(pid)
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

/// Returns `true` once the process is gone.
pub(crate) async fn wait_for_pid_exit(pid: u32, timeout: Duration) -> bool {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if !is_pid_running(pid) {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    !is_pid_running(pid)
}

// ── Status rendering ────────────────────────────────────────────────────────

fn lower<T: std::fmt::Debug>(value: &T) -> String {
    format!("{value:?}").to_lowercase()
}

fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

fn ago(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0) as u64;
    format!("{} ({} ago)", at.format("%Y-%m-%d %H:%M:%S UTC"), format_uptime(secs))
}

pub(crate) fn format_status(status: &DaemonStatus, now: DateTime<Utc>) -> String {
    let engine = &status.engine;
    let mut out = String::new();
    let mut line = |text: String| {
        out.push_str(&text);
        out.push('\n');
    };

    line("waypoint status: running".to_string());
    line(format!("- root: {}", status.root));
    line(format!("- pid: {}", status.pid));
    line(format!("- uptime: {}", format_uptime(status.uptime_secs)));
    line(format!("- phase: {}", lower(&engine.phase)));
    line(format!(
        "- last scan: {}",
        engine
            .last_scan_at
            .map(|at| ago(at, now))
            .unwrap_or_else(|| "never".to_string())
    ));
    line(format!(
        "- buffer: {} changes, {} lines",
        engine.buffered_changes, engine.buffered_lines
    ));
    match &engine.last_checkpoint {
        Some(record) => line(format!(
            "- last checkpoint: {} at {} (push {})",
            record.commit_id,
            ago(record.created_at, now),
            record.push_status
        )),
        None => line(format!(
            "- last checkpoint: none since {}",
            ago(engine.last_checkpoint_at, now)
        )),
    }
    line(format!("- advisory: {}", lower(&engine.advisory)));
    line(format!(
        "- push: {}",
        if engine.push_enabled { "enabled" } else { "disabled" }
    ));

    if !engine.recent_checkpoints.is_empty() {
        line("recent checkpoints:".to_string());
        for record in engine.recent_checkpoints.iter().rev() {
            let hooks = if record.bypassed_hooks { " [hooks bypassed]" } else { "" };
            line(format!(
                "  {}  {}  {}  [{}]{hooks}",
                record.commit_id,
                record.created_at.format("%H:%M:%S"),
                record.message,
                record.push_status
            ));
        }
    }

    if !engine.errors.is_empty() {
        line("errors:".to_string());
        for error in &engine.errors {
            line(format!(
                "  {}: {} ({})",
                lower(&error.component),
                error.message,
                error.at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
    }

    out
}
