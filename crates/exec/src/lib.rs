//! Version-control collaborator for the checkpoint engine.
//!
//! Everything the engine needs from git goes through the [`Vcs`] trait so the
//! decision and retry logic can be exercised against an in-memory fake.  The
//! production implementation, [`git::GitCli`], shells out to the `git` binary
//! with every call timeboxed.

pub mod git;

use std::collections::{HashMap, HashSet};
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use git::GitCli;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VcsError {
    #[error("version-control binary not found: {0}")]
    BinaryMissing(String),
    #[error("{op} timed out after {secs}s")]
    TimedOut { op: String, secs: u64 },
    /// A local hook (pre-commit, commit-msg, pre-push) refused the operation.
    #[error("{op} rejected by hook: {stderr}")]
    HookRejected { op: String, stderr: String },
    #[error("nothing to commit")]
    NothingToCommit,
    #[error("{op} failed: {stderr}")]
    Failed { op: String, stderr: String },
    #[error("i/o error running {op}: {message}")]
    Io { op: String, message: String },
}

impl VcsError {
    /// Whether the next [`Attempt`] in a strategy list may succeed where this
    /// one failed.
    pub fn is_hook_rejection(&self) -> bool {
        matches!(self, Self::HookRejected { .. })
    }
}

// ── Attempt strategies ───────────────────────────────────────────────────────

/// One way of running a mutating git operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attempt {
    /// Plain invocation; local hooks run.
    Standard,
    /// `--no-verify`: local hooks are skipped.  Always logged.
    BypassHooks,
}

/// Commit strategies in evaluation order.
pub const COMMIT_ATTEMPTS: &[Attempt] = &[Attempt::Standard, Attempt::BypassHooks];

/// Push strategies in evaluation order.
pub const PUSH_ATTEMPTS: &[Attempt] = &[Attempt::Standard, Attempt::BypassHooks];

/// Result of evaluating an ordered attempt list.
#[derive(Debug, Clone)]
pub struct AttemptReport<T> {
    pub result: Result<T, VcsError>,
    /// Strategy that produced `result`.
    pub used: Attempt,
    /// Failed attempts that preceded `used`.
    pub failures: Vec<(Attempt, VcsError)>,
}

impl<T> AttemptReport<T> {
    pub fn bypassed_hooks(&self) -> bool {
        self.result.is_ok() && self.used == Attempt::BypassHooks
    }
}

/// Evaluate `attempts` in order.  Only a hook rejection advances to the next
/// strategy; any other error (or success) ends the evaluation.
pub async fn run_attempts<T, F, Fut>(op: &str, attempts: &[Attempt], mut run: F) -> AttemptReport<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, VcsError>>,
{
    let mut failures = Vec::new();
    let mut last = Err(VcsError::Failed {
        op: op.to_string(),
        stderr: "no attempt strategies configured".to_string(),
    });
    let mut used = Attempt::Standard;

    for (index, &attempt) in attempts.iter().enumerate() {
        used = attempt;
        if attempt == Attempt::BypassHooks {
            warn!(op, "retrying with local hooks bypassed (--no-verify)");
        }
        match run(attempt).await {
            Ok(value) => {
                return AttemptReport {
                    result: Ok(value),
                    used,
                    failures,
                };
            }
            Err(err) if err.is_hook_rejection() && index + 1 < attempts.len() => {
                warn!(op, ?attempt, error = %err, "attempt rejected by hook");
                failures.push((attempt, err));
            }
            Err(err) => {
                last = Err(err);
                break;
            }
        }
    }

    AttemptReport {
        result: last,
        used,
        failures,
    }
}

// ── Collaborator surface ─────────────────────────────────────────────────────

/// Added / removed line counts for one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDelta {
    pub added: u64,
    pub removed: u64,
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Whether the configured root is inside a work tree.
    async fn is_repository(&self) -> bool;

    async fn current_branch(&self) -> Result<String, VcsError>;

    /// Paths git reports as modified, deleted, or untracked (relative to the
    /// root, `/`-separated).
    async fn dirty_paths(&self) -> Result<Vec<String>, VcsError>;

    /// Line statistics of `paths` against the last commit.  Paths git does
    /// not track are absent from the map.
    async fn numstat(&self, paths: &[String]) -> Result<HashMap<String, LineDelta>, VcsError>;

    /// Subset of `paths` that git's ignore rules (`.gitignore`, the global
    /// excludes file, `info/exclude`) exclude.  Tracked paths are never
    /// reported.
    async fn ignored(&self, paths: &[String]) -> Result<HashSet<String>, VcsError>;

    /// Stage exactly `paths`, including deletions.
    async fn stage(&self, paths: &[String]) -> Result<(), VcsError>;

    /// Commit the staged `paths` and return the new commit id.
    async fn commit(&self, message: &str, paths: &[String], attempt: Attempt) -> Result<String, VcsError>;

    async fn push(&self, attempt: Attempt) -> Result<(), VcsError>;

    /// Whether the current branch tracks a remote branch.
    async fn has_upstream(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn hook_err() -> VcsError {
        VcsError::HookRejected {
            op: "commit".to_string(),
            stderr: "lint failed".to_string(),
        }
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let calls = RefCell::new(Vec::new());
        let report = run_attempts("commit", COMMIT_ATTEMPTS, |attempt| {
            calls.borrow_mut().push(attempt);
            async { Ok::<_, VcsError>("abc123".to_string()) }
        })
        .await;
        assert_eq!(report.result.unwrap(), "abc123");
        assert_eq!(report.used, Attempt::Standard);
        assert!(report.failures.is_empty());
        assert_eq!(calls.into_inner(), vec![Attempt::Standard]);
    }

    #[tokio::test]
    async fn hook_rejection_falls_through_to_bypass() {
        let report = run_attempts("commit", COMMIT_ATTEMPTS, |attempt| async move {
            match attempt {
                Attempt::Standard => Err(hook_err()),
                Attempt::BypassHooks => Ok(7u32),
            }
        })
        .await;
        assert_eq!(report.result.clone().unwrap(), 7);
        assert!(report.bypassed_hooks());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, Attempt::Standard);
    }

    #[tokio::test]
    async fn other_errors_do_not_retry() {
        let calls = RefCell::new(0);
        let report = run_attempts("commit", COMMIT_ATTEMPTS, |_| {
            *calls.borrow_mut() += 1;
            async {
                Err::<(), _>(VcsError::Failed {
                    op: "commit".to_string(),
                    stderr: "index.lock exists".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(report.result, Err(VcsError::Failed { .. })));
        assert_eq!(calls.into_inner(), 1);
        assert!(!report.bypassed_hooks());
    }

    #[tokio::test]
    async fn hook_rejection_on_last_attempt_is_returned() {
        let report = run_attempts("push", PUSH_ATTEMPTS, |_| async { Err::<(), _>(hook_err()) }).await;
        assert!(report.result.unwrap_err().is_hook_rejection());
        assert_eq!(report.used, Attempt::BypassHooks);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn empty_strategy_list_fails() {
        let report = run_attempts("commit", &[], |_| async { Ok::<_, VcsError>(()) }).await;
        assert!(report.result.is_err());
    }
}
