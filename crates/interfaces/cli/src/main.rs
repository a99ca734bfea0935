mod daemon;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use waypoint_config::{AppConfig, GitConfig};
use waypoint_exec::GitCli;
use waypoint_runtime::{EngineError, RuntimePaths, preflight};

#[derive(Debug, Parser)]
#[command(
    name = "waypoint",
    version,
    about = "Watches a git work tree and commits checkpoints at meaningful moments"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the background daemon for a repository.
    Start {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Stop the daemon, letting the current cycle finish.
    Stop {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Show engine phase, buffered changes and recent checkpoints.
    Status {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    Restart {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Commit everything pending now, regardless of trigger thresholds.
    Checkpoint {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Run the daemon in the foreground.
    #[command(hide = true)]
    Run {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
}

impl Commands {
    fn path(&self) -> Option<&Path> {
        match self {
            Commands::Start { path }
            | Commands::Stop { path }
            | Commands::Status { path }
            | Commands::Restart { path }
            | Commands::Checkpoint { path }
            | Commands::Run { path } => path.as_deref(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("waypoint: {err:#}");
            ExitCode::from(exit_status(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let root = resolve_root(cli.command.path()).await?;
    let config = AppConfig::load_for_root(&root)
        .map_err(|err| EngineError::Configuration(format!("{err:#}")))?;
    let paths = RuntimePaths::for_root(&root);

    let in_daemon = std::env::var(daemon::DAEMON_ENV).ok().as_deref() == Some("1");
    let _guard = init_tracing(&config.telemetry.log_level, in_daemon.then_some(&paths))?;

    match cli.command {
        Commands::Start { .. } => {
            let git = GitCli::new(&root, &config.git);
            preflight(&root, &config, &git).await?;
            daemon::daemon_start(&paths).await
        }
        Commands::Stop { .. } => daemon::daemon_stop(&paths, &config).await,
        Commands::Status { .. } => daemon::daemon_status(&paths).await,
        Commands::Restart { .. } => {
            let git = GitCli::new(&root, &config.git);
            preflight(&root, &config, &git).await?;
            daemon::daemon_stop(&paths, &config).await?;
            daemon::daemon_start(&paths).await
        }
        Commands::Checkpoint { .. } => daemon::request_checkpoint(&paths).await,
        Commands::Run { .. } => {
            daemon::run_daemon_process(root, config, &paths).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Top-level directory of the work tree containing `path` (default: cwd).
async fn resolve_root(path: Option<&Path>) -> Result<PathBuf> {
    let start = path.unwrap_or(Path::new("."));
    let start = std::fs::canonicalize(start).map_err(|err| {
        EngineError::Configuration(format!("cannot resolve {}: {err}", start.display()))
    })?;

    let root = GitCli::new(&start, &GitConfig::default())
        .toplevel()
        .await
        .map_err(|_| {
            EngineError::Configuration(format!(
                "{} is not inside a git work tree",
                start.display()
            ))
        })?;
    Ok(root)
}

/// `RUST_LOG` wins over the configured level. The daemon process logs to
/// `daemon.log`; everything else logs to stderr.
fn init_tracing(level: &str, daemon_log: Option<&RuntimePaths>) -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match daemon_log {
        Some(paths) => {
            paths.ensure()?;
            let appender = tracing_appender::rolling::never(&paths.runtime_dir, "daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// `2` for configuration errors, `1` for everything else.
fn exit_status(err: &anyhow::Error) -> u8 {
    let configuration = err.chain().any(|cause| {
        cause
            .downcast_ref::<EngineError>()
            .is_some_and(EngineError::is_fatal)
    });
    if configuration { 2 } else { 1 }
}
