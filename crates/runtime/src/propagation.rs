//! Detached push worker.
//!
//! Push requests queued while a push is running are coalesced: one
//! successful push propagates every local checkpoint.  A failed push is not
//! retried on its own beyond `retries`; the next checkpoint pushes again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use waypoint_exec::{PUSH_ATTEMPTS, Vcs, run_attempts};

use crate::executor::PushStatus;

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// Checkpoints covered by this push.
    pub commit_ids: Vec<String>,
    pub status: PushStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PushSettings {
    pub retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

/// Push with bounded retries.  Each attempt walks [`PUSH_ATTEMPTS`].
pub async fn push_with_retries(vcs: &dyn Vcs, settings: PushSettings) -> (PushStatus, Option<String>) {
    if !vcs.has_upstream().await {
        return (
            PushStatus::Skipped,
            Some("current branch has no upstream".to_string()),
        );
    }

    let tries = settings.retries.max(1);
    let mut last_error = String::new();
    for attempt in 1..=tries {
        let report = run_attempts("push", PUSH_ATTEMPTS, |strategy| vcs.push(strategy)).await;
        match report.result {
            Ok(()) => return (PushStatus::Succeeded, None),
            Err(err) => {
                warn!(attempt, tries, error = %err, "push failed");
                last_error = err.to_string();
            }
        }
        if attempt < tries {
            tokio::time::sleep(settings.backoff * attempt).await;
        }
    }
    (PushStatus::Failed, Some(last_error))
}

pub fn spawn_propagator(
    vcs: Arc<dyn Vcs>,
    settings: PushSettings,
    mut requests: mpsc::UnboundedReceiver<PushRequest>,
    reports: mpsc::UnboundedSender<PushReport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(first) = requests.recv().await {
            let mut commit_ids = vec![first.commit_id];
            while let Ok(more) = requests.try_recv() {
                commit_ids.push(more.commit_id);
            }

            let (status, error) = push_with_retries(vcs.as_ref(), settings).await;
            info!(commits = commit_ids.len(), %status, "push finished");
            let report = PushReport {
                commit_ids,
                status,
                error,
            };
            if reports.send(report).is_err() {
                break;
            }
        }
    })
}
