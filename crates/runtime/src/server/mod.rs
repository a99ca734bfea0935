//! Daemon server: owns the engine task and the control socket.

mod connection;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use waypoint_config::AppConfig;
use waypoint_exec::{GitCli, Vcs};

use crate::engine::{Engine, EngineRequest, EngineStatus, preflight};
use crate::error::EngineError;
use crate::paths::RuntimePaths;
use crate::DaemonStatus;

struct ServerContext {
    root: PathBuf,
    started_at: Instant,
    status_rx: watch::Receiver<EngineStatus>,
    requests: mpsc::Sender<EngineRequest>,
}

impl ServerContext {
    fn status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: std::process::id(),
            root: self.root.display().to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            engine: self.status_rx.borrow().clone(),
        }
    }
}

/// Run the checkpoint engine for `root` and serve the control socket until
/// a shutdown command arrives.
pub async fn run_daemon(root: PathBuf, config: AppConfig) -> Result<()> {
    let paths = RuntimePaths::for_root(&root);
    paths.ensure()?;
    if paths.socket.exists() {
        let _ = std::fs::remove_file(&paths.socket);
    }

    let vcs: Arc<dyn Vcs> = Arc::new(GitCli::new(&root, &config.git));
    preflight(&root, &config, vcs.as_ref()).await?;

    let advisory = waypoint_llm::build_advisory_service(&config.advisory)
        .map_err(|err| EngineError::Configuration(err.to_string()))?;
    let reachable = match &advisory {
        Some(service) => {
            let reachable = service.ping().await;
            if reachable {
                info!(provider = service.name(), "advisory service reachable");
            } else {
                warn!(
                    provider = service.name(),
                    url = %config.advisory.base_url,
                    "advisory service not reachable; deterministic rules apply until it answers"
                );
            }
            Some(reachable)
        }
        None => {
            info!("advisory disabled; deterministic rules only");
            None
        }
    };

    let mut engine = Engine::new(&root, config, vcs, advisory).await?;
    if let Some(reachable) = reachable {
        engine.set_advisory_reachable(reachable);
    }
    let status_rx = engine.subscribe();

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (request_tx, request_rx) = mpsc::channel::<EngineRequest>(8);
    let mut engine_task = tokio::spawn(engine.run(shutdown_tx.subscribe(), request_rx));

    let listener = UnixListener::bind(&paths.socket)?;
    info!(socket = %paths.socket.display(), root = %root.display(), "daemon listening");

    let context = Arc::new(ServerContext {
        root: root.clone(),
        started_at: Instant::now(),
        status_rx,
        requests: request_tx,
    });

    let mut engine_done = false;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            finished = &mut engine_task => {
                engine_done = true;
                match finished {
                    Ok(status) => warn!(phase = ?status.phase, "engine task ended unexpectedly"),
                    Err(err) => error!(?err, "engine task panicked"),
                }
                break;
            }
            accept = listener.accept() => {
                let (stream, _) = accept?;
                let context = context.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection::handle_connection(stream, context, shutdown_tx).await {
                        error!(?err, "daemon connection handler failed");
                    }
                });
            }
        }
    }

    info!("daemon shutting down gracefully");
    let _ = shutdown_tx.send(true);
    if !engine_done {
        match engine_task.await {
            Ok(status) => info!(
                checkpoints = status.recent_checkpoints.len(),
                "engine drained"
            ),
            Err(err) => error!(?err, "engine task failed during shutdown"),
        }
    }
    let _ = std::fs::remove_file(&paths.socket);
    Ok(())
}
