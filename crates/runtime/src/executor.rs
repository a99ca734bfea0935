//! Checkpoint commits.
//!
//! Commits are serialised through a mutex: only one checkpoint touches the
//! index at a time.  Exactly the buffered paths are staged and committed;
//! anything else the user staged stays in the index untouched.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use waypoint_exec::{COMMIT_ATTEMPTS, Vcs, VcsError, run_attempts};

use crate::buffer::ChangeBuffer;
use crate::detector::hash_file;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for PushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub commit_id: String,
    pub message: String,
    pub change_count: usize,
    pub created_at: DateTime<Utc>,
    pub push_status: PushStatus,
    /// The commit only went through with local hooks skipped.
    #[serde(default)]
    pub bypassed_hooks: bool,
}

/// A path as it was captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedPath {
    pub path: String,
    /// `None` when the commit recorded a deletion.
    pub hash: Option<String>,
}

/// A buffered path git refused to stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedPath {
    pub path: String,
    pub hash: Option<String>,
    pub reason: String,
}

impl RejectedPath {
    pub fn to_error(&self) -> EngineError {
        EngineError::ScanIo {
            path: self.path.clone(),
            message: format!("git refused to stage it: {}", self.reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointOutcome {
    /// `None` when git had nothing to commit (the tree already matched HEAD)
    /// or when every path was rejected.
    pub record: Option<CheckpointRecord>,
    pub committed: Vec<CommittedPath>,
    /// Left out of the commit; the rest went ahead without them.
    pub rejected: Vec<RejectedPath>,
}

impl CheckpointOutcome {
    pub fn committed_pairs(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.committed
            .iter()
            .map(|c| (c.path.as_str(), c.hash.as_deref()))
    }
}

pub struct CheckpointExecutor {
    vcs: Arc<dyn Vcs>,
    root: PathBuf,
    lock: Mutex<()>,
}

impl CheckpointExecutor {
    pub fn new(vcs: Arc<dyn Vcs>, root: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Stage and commit every buffered path.
    ///
    /// Paths are re-hashed right before staging so the returned hashes
    /// describe what the commit actually captured.
    pub async fn checkpoint(
        &self,
        buffer: &ChangeBuffer,
        message: &str,
    ) -> Result<CheckpointOutcome, EngineError> {
        let _guard = self.lock.lock().await;

        let mut committed = Vec::with_capacity(buffer.len());
        for record in buffer.iter() {
            match hash_file(&self.root.join(&record.path)) {
                Ok(hash) => committed.push(CommittedPath {
                    path: record.path.clone(),
                    hash: Some(hash),
                }),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    committed.push(CommittedPath {
                        path: record.path.clone(),
                        hash: None,
                    });
                }
                Err(err) => {
                    warn!(path = %record.path, error = %err, "cannot re-hash path; leaving it for the next checkpoint");
                }
            }
        }

        if committed.is_empty() {
            return Ok(CheckpointOutcome {
                record: None,
                committed,
                rejected: Vec::new(),
            });
        }

        let paths: Vec<String> = committed.iter().map(|c| c.path.clone()).collect();
        let (committed, rejected) = match self.vcs.stage(&paths).await {
            Ok(()) => (committed, Vec::new()),
            Err(err @ VcsError::Failed { .. }) => self.stage_each(committed, err).await?,
            Err(err) => return Err(err.into()),
        };
        if committed.is_empty() {
            return Ok(CheckpointOutcome {
                record: None,
                committed,
                rejected,
            });
        }
        let paths: Vec<String> = committed.iter().map(|c| c.path.clone()).collect();

        let report = run_attempts("commit", COMMIT_ATTEMPTS, |attempt| {
            self.vcs.commit(message, &paths, attempt)
        })
        .await;
        let bypassed_hooks = report.bypassed_hooks();

        match report.result {
            Ok(commit_id) => {
                info!(
                    commit = %commit_id,
                    files = committed.len(),
                    bypassed_hooks,
                    "checkpoint committed"
                );
                Ok(CheckpointOutcome {
                    record: Some(CheckpointRecord {
                        commit_id,
                        message: message.to_string(),
                        change_count: committed.len(),
                        created_at: Utc::now(),
                        push_status: PushStatus::Pending,
                        bypassed_hooks,
                    }),
                    committed,
                    rejected,
                })
            }
            Err(VcsError::NothingToCommit) => {
                info!("working tree already matches HEAD; nothing to commit");
                Ok(CheckpointOutcome {
                    record: None,
                    committed,
                    rejected,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stage paths one at a time after a batch `git add` failed, splitting
    /// them into staged and rejected.  When no single path stages, only the
    /// paths git reports as ignored are rejected; if there are none the
    /// batch failure is returned as is.
    async fn stage_each(
        &self,
        candidates: Vec<CommittedPath>,
        batch_err: VcsError,
    ) -> Result<(Vec<CommittedPath>, Vec<RejectedPath>), EngineError> {
        warn!(error = %batch_err, "staging failed; retrying path by path");
        let mut staged = Vec::new();
        let mut refused = Vec::new();
        for candidate in candidates {
            match self.vcs.stage(std::slice::from_ref(&candidate.path)).await {
                Ok(()) => staged.push(candidate),
                Err(VcsError::Failed { stderr, .. }) => refused.push((candidate, stderr)),
                Err(err) => return Err(err.into()),
            }
        }

        if staged.is_empty() {
            let names: Vec<String> = refused.iter().map(|(c, _)| c.path.clone()).collect();
            let ignored = self.vcs.ignored(&names).await?;
            if ignored.is_empty() {
                return Err(batch_err.into());
            }
            refused.retain(|(candidate, _)| ignored.contains(&candidate.path));
        }

        let rejected = refused
            .into_iter()
            .map(|(candidate, reason)| {
                let rejected = RejectedPath {
                    path: candidate.path,
                    hash: candidate.hash,
                    reason,
                };
                warn!(error = %rejected.to_error(), "leaving path out of the checkpoint");
                rejected
            })
            .collect();
        Ok((staged, rejected))
    }
}
