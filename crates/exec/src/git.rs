//! `git` subprocess implementation of [`Vcs`].
//!
//! Every invocation runs with `current_dir` set to the repository root, is
//! wrapped in a timeout, and is killed if the timeout drops the future.
//! Prompts are disabled so a push waiting on credentials fails instead of
//! hanging.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use waypoint_config::GitConfig;

use crate::{Attempt, LineDelta, Vcs, VcsError};

const COMMIT_HOOKS: &[&str] = &["pre-commit", "prepare-commit-msg", "commit-msg"];
const PUSH_HOOKS: &[&str] = &["pre-push"];

#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    binary: String,
    command_timeout: Duration,
    push_timeout: Duration,
    author: Option<(String, String)>,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>, config: &GitConfig) -> Self {
        let author = if config.author_name.trim().is_empty() || config.author_email.trim().is_empty() {
            None
        } else {
            Some((config.author_name.clone(), config.author_email.clone()))
        };
        Self {
            root: root.into(),
            binary: config.binary.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs.max(1)),
            push_timeout: Duration::from_secs(config.push_timeout_secs.max(1)),
            author,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute top-level directory of the work tree containing the root.
    pub async fn toplevel(&self) -> Result<PathBuf, VcsError> {
        let out = self.run("rev-parse", &["rev-parse", "--show-toplevel"], self.command_timeout).await?;
        if !out.status.success() {
            return Err(failed("rev-parse", &out));
        }
        Ok(PathBuf::from(String::from_utf8_lossy(&out.stdout).trim()))
    }

    async fn run(&self, op: &str, args: &[&str], timeout: Duration) -> Result<Output, VcsError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some((name, email)) = &self.author {
            command
                .env("GIT_AUTHOR_NAME", name)
                .env("GIT_AUTHOR_EMAIL", email)
                .env("GIT_COMMITTER_NAME", name)
                .env("GIT_COMMITTER_EMAIL", email);
        }

        debug!(op, ?args, "running git");
        match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => Err(VcsError::TimedOut {
                op: op.to_string(),
                secs: timeout.as_secs(),
            }),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(VcsError::BinaryMissing(self.binary.clone()))
            }
            Ok(Err(err)) => Err(VcsError::Io {
                op: op.to_string(),
                message: err.to_string(),
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// Whether any of `names` exists in the effective hooks directory
    /// (honours `core.hooksPath`).
    async fn has_hooks(&self, names: &[&str]) -> bool {
        let Ok(out) = self
            .run("rev-parse", &["rev-parse", "--git-path", "hooks"], self.command_timeout)
            .await
        else {
            return false;
        };
        if !out.status.success() {
            return false;
        }
        let hooks_dir = self.root.join(String::from_utf8_lossy(&out.stdout).trim());
        names.iter().any(|name| hooks_dir.join(name).is_file())
    }
}

fn failed(op: &str, out: &Output) -> VcsError {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    } else {
        stderr
    };
    VcsError::Failed {
        op: op.to_string(),
        stderr,
    }
}

/// Parse `git status --porcelain=v1 -z` output.  Rename entries carry the
/// original path as an extra NUL-separated field; both sides are reported.
pub(crate) fn parse_porcelain_z(raw: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut fields = raw.split('\0').filter(|field| !field.is_empty());
    while let Some(entry) = fields.next() {
        if entry.len() < 4 {
            continue;
        }
        let status = &entry[..2];
        paths.push(entry[3..].to_string());
        if status.starts_with('R') || status.starts_with('C') {
            if let Some(original) = fields.next() {
                paths.push(original.to_string());
            }
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

/// Parse `git diff --numstat -z --no-renames` output.  Binary files report
/// `-` for both columns and count as zero lines.
pub(crate) fn parse_numstat_z(raw: &str) -> HashMap<String, LineDelta> {
    let mut stats = HashMap::new();
    for record in raw.split('\0').filter(|record| !record.trim().is_empty()) {
        let mut columns = record.trim_start_matches('\n').splitn(3, '\t');
        let (Some(added), Some(removed), Some(path)) = (columns.next(), columns.next(), columns.next())
        else {
            continue;
        };
        stats.insert(
            path.to_string(),
            LineDelta {
                added: added.parse().unwrap_or(0),
                removed: removed.parse().unwrap_or(0),
            },
        );
    }
    stats
}

fn mentions_nothing_to_commit(out: &Output) -> bool {
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    text.contains("nothing to commit") || text.contains("no changes added to commit")
}

#[async_trait]
impl Vcs for GitCli {
    async fn is_repository(&self) -> bool {
        match self
            .run("rev-parse", &["rev-parse", "--is-inside-work-tree"], self.command_timeout)
            .await
        {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(_) => false,
        }
    }

    async fn current_branch(&self) -> Result<String, VcsError> {
        let out = self
            .run("symbolic-ref", &["symbolic-ref", "--quiet", "--short", "HEAD"], self.command_timeout)
            .await?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).trim().to_string());
        }
        // Detached HEAD.
        Ok("HEAD".to_string())
    }

    async fn dirty_paths(&self) -> Result<Vec<String>, VcsError> {
        let out = self
            .run(
                "status",
                &["status", "--porcelain=v1", "-z", "--untracked-files=all"],
                self.command_timeout,
            )
            .await?;
        if !out.status.success() {
            return Err(failed("status", &out));
        }
        Ok(parse_porcelain_z(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn numstat(&self, paths: &[String]) -> Result<HashMap<String, LineDelta>, VcsError> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let mut args = vec!["diff", "--numstat", "-z", "--no-renames", "HEAD", "--"];
        args.extend(paths.iter().map(String::as_str));
        let out = self.run("diff", &args, self.command_timeout).await?;
        if !out.status.success() {
            // No HEAD yet (fresh repository): nothing is tracked.
            return Ok(HashMap::new());
        }
        Ok(parse_numstat_z(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn ignored(&self, paths: &[String]) -> Result<HashSet<String>, VcsError> {
        if paths.is_empty() {
            return Ok(HashSet::new());
        }
        let mut args = vec!["check-ignore", "-z", "--"];
        args.extend(paths.iter().map(String::as_str));
        let out = self.run("check-ignore", &args, self.command_timeout).await?;
        // Exit 1: none of the paths is ignored.
        match out.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&out.stdout)
                .split('\0')
                .filter(|path| !path.is_empty())
                .map(str::to_string)
                .collect()),
            Some(1) => Ok(HashSet::new()),
            _ => Err(failed("check-ignore", &out)),
        }
    }

    async fn stage(&self, paths: &[String]) -> Result<(), VcsError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--all", "--"];
        args.extend(paths.iter().map(String::as_str));
        let out = self.run("add", &args, self.command_timeout).await?;
        if !out.status.success() {
            return Err(failed("add", &out));
        }
        Ok(())
    }

    async fn commit(&self, message: &str, paths: &[String], attempt: Attempt) -> Result<String, VcsError> {
        let mut args = vec!["commit", "--quiet", "-m", message];
        if attempt == Attempt::BypassHooks {
            args.push("--no-verify");
        }
        // Limit the commit to our paths so unrelated staged work stays staged.
        if !paths.is_empty() {
            args.push("--only");
            args.push("--");
            args.extend(paths.iter().map(String::as_str));
        }

        let out = self.run("commit", &args, self.command_timeout).await?;
        if !out.status.success() {
            if mentions_nothing_to_commit(&out) {
                return Err(VcsError::NothingToCommit);
            }
            if attempt == Attempt::Standard && self.has_hooks(COMMIT_HOOKS).await {
                return Err(VcsError::HookRejected {
                    op: "commit".to_string(),
                    stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
                });
            }
            return Err(failed("commit", &out));
        }

        let head = self.run("rev-parse", &["rev-parse", "HEAD"], self.command_timeout).await?;
        if !head.status.success() {
            return Err(failed("rev-parse", &head));
        }
        let id = String::from_utf8_lossy(&head.stdout).trim().to_string();
        info!(commit = %id, ?attempt, "checkpoint committed");
        Ok(id)
    }

    async fn push(&self, attempt: Attempt) -> Result<(), VcsError> {
        let mut args = vec!["push", "--quiet"];
        if attempt == Attempt::BypassHooks {
            args.push("--no-verify");
        }
        let out = self.run("push", &args, self.push_timeout).await?;
        if out.status.success() {
            return Ok(());
        }
        if attempt == Attempt::Standard && self.has_hooks(PUSH_HOOKS).await {
            return Err(VcsError::HookRejected {
                op: "push".to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Err(failed("push", &out))
    }

    async fn has_upstream(&self) -> bool {
        self.run(
            "rev-parse",
            &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
            self.command_timeout,
        )
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
