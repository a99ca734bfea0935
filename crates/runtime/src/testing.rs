//! In-memory collaborators for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use waypoint_exec::{Attempt, LineDelta, Vcs, VcsError};
use waypoint_llm::{AdvisoryError, AdvisoryRequest, AdvisoryResponse, AdvisoryService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    Stage(Vec<String>),
    Commit {
        message: String,
        paths: Vec<String>,
        attempt: Attempt,
    },
    Push(Attempt),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<VcsCall>,
    commits: usize,
    commit_hook_rejections: usize,
    commit_failure: Option<VcsError>,
    push_failures: usize,
    push_error: Option<VcsError>,
    numstat: HashMap<String, LineDelta>,
    active_commits: usize,
    max_active_commits: usize,
}

pub struct FakeVcs {
    state: Mutex<FakeState>,
    upstream: bool,
    nothing_to_commit: bool,
    dirty: Vec<String>,
    ignored: HashSet<String>,
    unstageable: HashSet<String>,
    commit_delay: Option<Duration>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            upstream: true,
            nothing_to_commit: false,
            dirty: Vec::new(),
            ignored: HashSet::new(),
            unstageable: HashSet::new(),
            commit_delay: None,
        }
    }

    /// Reject the next `n` commit attempts as a pre-commit hook would.
    pub fn reject_commit_hooks(self, n: usize) -> Self {
        self.state.lock().unwrap().commit_hook_rejections = n;
        self
    }

    pub fn failing_commits(self, err: VcsError) -> Self {
        self.state.lock().unwrap().commit_failure = Some(err);
        self
    }

    pub fn nothing_to_commit(mut self) -> Self {
        self.nothing_to_commit = true;
        self
    }

    pub fn without_upstream(mut self) -> Self {
        self.upstream = false;
        self
    }

    pub fn with_dirty(mut self, paths: &[&str]) -> Self {
        self.dirty = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Report `paths` as excluded by ignore rules.  `git add` refuses them.
    pub fn ignoring(mut self, paths: &[&str]) -> Self {
        self.ignored = paths.iter().map(|p| p.to_string()).collect();
        self.unstageable.extend(self.ignored.iter().cloned());
        self
    }

    /// Refuse to stage `paths` without reporting them as ignored.
    pub fn rejecting_stage(mut self, paths: &[&str]) -> Self {
        self.unstageable.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Fail the next `n` push calls with `err`.
    pub fn fail_pushes(self, n: usize, err: VcsError) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.push_failures = n;
            state.push_error = Some(err);
        }
        self
    }

    pub fn set_numstat(&self, path: &str, delta: LineDelta) {
        self.state.lock().unwrap().numstat.insert(path.to_string(), delta);
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn commit_messages(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                VcsCall::Commit { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn max_concurrent_commits(&self) -> usize {
        self.state.lock().unwrap().max_active_commits
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn is_repository(&self) -> bool {
        true
    }

    async fn current_branch(&self) -> Result<String, VcsError> {
        Ok("main".to_string())
    }

    async fn dirty_paths(&self) -> Result<Vec<String>, VcsError> {
        Ok(self.dirty.clone())
    }

    async fn numstat(&self, paths: &[String]) -> Result<HashMap<String, LineDelta>, VcsError> {
        let state = self.state.lock().unwrap();
        Ok(paths
            .iter()
            .filter_map(|p| state.numstat.get(p).map(|d| (p.clone(), *d)))
            .collect())
    }

    async fn ignored(&self, paths: &[String]) -> Result<HashSet<String>, VcsError> {
        Ok(paths.iter().filter(|p| self.ignored.contains(*p)).cloned().collect())
    }

    async fn stage(&self, paths: &[String]) -> Result<(), VcsError> {
        self.state.lock().unwrap().calls.push(VcsCall::Stage(paths.to_vec()));
        if let Some(refused) = paths.iter().find(|p| self.unstageable.contains(*p)) {
            return Err(VcsError::Failed {
                op: "add".to_string(),
                stderr: format!("The following paths are ignored by one of your .gitignore files:\n{refused}"),
            });
        }
        Ok(())
    }

    async fn commit(&self, message: &str, paths: &[String], attempt: Attempt) -> Result<String, VcsError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(VcsCall::Commit {
                message: message.to_string(),
                paths: paths.to_vec(),
                attempt,
            });
            state.active_commits += 1;
            state.max_active_commits = state.max_active_commits.max(state.active_commits);
        }

        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.active_commits -= 1;
        if state.commit_hook_rejections > 0 {
            state.commit_hook_rejections -= 1;
            return Err(VcsError::HookRejected {
                op: "commit".to_string(),
                stderr: "pre-commit: lint failed".to_string(),
            });
        }
        if let Some(err) = state.commit_failure.clone() {
            return Err(err);
        }
        if self.nothing_to_commit {
            return Err(VcsError::NothingToCommit);
        }
        state.commits += 1;
        Ok(format!("c{:04}", state.commits))
    }

    async fn push(&self, attempt: Attempt) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(VcsCall::Push(attempt));
        if state.push_failures > 0 {
            state.push_failures -= 1;
            if let Some(err) = state.push_error.clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn has_upstream(&self) -> bool {
        self.upstream
    }
}

// ── Advisory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Script {
    Answer(AdvisoryResponse),
    Transport(String),
    Malformed(String),
}

pub struct ScriptedAdvisor {
    script: Mutex<Script>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedAdvisor {
    pub fn answering(response: AdvisoryResponse) -> Self {
        Self::with_script(Script::Answer(response))
    }

    pub fn failing(err: AdvisoryError) -> Self {
        Self::with_script(match err {
            AdvisoryError::Transport(reason) => Script::Transport(reason),
            AdvisoryError::Malformed(reason) => Script::Malformed(reason),
        })
    }

    fn with_script(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn answer(&self, response: AdvisoryResponse) {
        *self.script.lock().unwrap() = Script::Answer(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvisoryService for ScriptedAdvisor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn advise(&self, _request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Answer(response) => Ok(response),
            Script::Transport(reason) => Err(AdvisoryError::Transport(reason)),
            Script::Malformed(reason) => Err(AdvisoryError::Malformed(reason)),
        }
    }

    async fn ping(&self) -> bool {
        !matches!(*self.script.lock().unwrap(), Script::Transport(_))
    }
}
