//! The checkpoint engine: scan → classify → evaluate → (advise) → decide →
//! commit → propagate.
//!
//! One task owns all mutable engine state.  Advisory calls and pushes run on
//! their own workers and report back over channels, so a slow model or a slow
//! remote never blocks scanning.  Commits run inline, one at a time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use waypoint_config::{AppConfig, Priority};
use waypoint_exec::{LineDelta, Vcs};
use waypoint_llm::{AdvisoryResult, AdvisoryService};

use crate::advisor::{AdvisorHandle, AdvisoryReply, build_request, spawn_advisor};
use crate::buffer::{ChangeBuffer, Observation};
use crate::classifier::Classifier;
use crate::detector::{ChangeDetector, ChangeKind, DetectedChange, TreeListing};
use crate::error::EngineError;
use crate::executor::{CheckpointExecutor, CheckpointRecord, PushStatus};
use crate::paths::RuntimePaths;
use crate::policy::{Decision, DecisionPolicy};
use crate::propagation::{PushReport, PushRequest, PushSettings, spawn_propagator};
use crate::snapshot::{SnapshotLoad, SnapshotState, SnapshotStore};
use crate::trigger::{Rule, TriggerEvaluator, TriggerSignal};

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePhase {
    Idle,
    Scanning,
    Classifying,
    Evaluating,
    Advising,
    Deciding,
    Committing,
    Propagating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisoryHealth {
    Unknown,
    Reachable,
    Unreachable,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Detector,
    Snapshot,
    Advisory,
    Executor,
    Propagation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentError {
    pub component: Component,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: EnginePhase,
    pub started_at: DateTime<Utc>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub scans: u64,
    pub buffered_changes: usize,
    pub buffered_lines: u64,
    pub last_checkpoint_at: DateTime<Utc>,
    pub last_checkpoint: Option<CheckpointRecord>,
    /// Oldest first.
    pub recent_checkpoints: Vec<CheckpointRecord>,
    pub advisory: AdvisoryHealth,
    pub push_enabled: bool,
    /// Most recent error of each component.
    pub errors: Vec<ComponentError>,
}

/// What a scan cycle, advisory reply or manual request led to.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No trigger fired.
    Quiet,
    /// A trigger fired and the advisory call is in flight.
    AwaitingAdvice { job: u64 },
    /// A trigger fired while an earlier advisory call is still running.
    Deferred,
    /// The decision was not to commit; the buffer is kept.
    Held(Decision),
    /// git refused every pending path; they were dropped from the buffer.
    Excluded(Vec<String>),
    Committed(CheckpointRecord),
    /// git had nothing to commit; the snapshot was resynchronised.
    AlreadyCommitted,
    /// The commit failed; the buffer is kept for the next cycle.
    Failed(String),
}

impl CycleOutcome {
    pub fn describe(&self) -> String {
        match self {
            Self::Quiet => "no pending changes".to_string(),
            Self::AwaitingAdvice { .. } | Self::Deferred => "waiting for advisory reply".to_string(),
            Self::Held(decision) => format!("checkpoint held ({:?})", decision.basis),
            Self::Committed(record) => format!(
                "checkpoint {} ({} files): {}",
                short_id(&record.commit_id),
                record.change_count,
                record.message
            ),
            Self::AlreadyCommitted => "working tree already committed".to_string(),
            Self::Excluded(paths) => format!("nothing committed: git refused {}", paths.join(", ")),
            Self::Failed(reason) => format!("checkpoint failed: {reason}"),
        }
    }
}

fn short_id(commit_id: &str) -> &str {
    crate::message::safe_truncate(commit_id, 10)
}

/// Requests sent to the engine task from the control socket.
#[derive(Debug)]
pub enum EngineRequest {
    CheckpointNow { reply: oneshot::Sender<CycleOutcome> },
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// A buffer the policy declined to commit.  Re-evaluating it is pointless
/// until its contents change or a stronger rule fires.
#[derive(Debug, Clone)]
struct HeldBuffer {
    fingerprint: Vec<(String, Option<String>)>,
    priority: Option<Priority>,
    decision: Decision,
}

impl HeldBuffer {
    fn still_holds(&self, buffer: &ChangeBuffer, signal: &TriggerSignal) -> bool {
        signal.priority <= self.priority
            && !signal.includes(Rule::TimeCeiling)
            && buffer.fingerprint() == self.fingerprint
    }
}

pub struct Engine {
    config: AppConfig,
    detector: Arc<ChangeDetector>,
    classifier: Classifier,
    evaluator: TriggerEvaluator,
    policy: DecisionPolicy,
    vcs: Arc<dyn Vcs>,
    executor: CheckpointExecutor,
    store: SnapshotStore,
    snapshot: SnapshotState,
    buffer: ChangeBuffer,
    history: VecDeque<CheckpointRecord>,
    /// Paths git will not stage, with the content hash they were refused at.
    excluded: HashMap<String, Option<String>>,
    held: Option<HeldBuffer>,

    advisor: Option<AdvisorHandle>,
    advisor_worker: Option<JoinHandle<()>>,
    advice_rx: mpsc::Receiver<AdvisoryReply>,

    push_tx: Option<mpsc::UnboundedSender<PushRequest>>,
    push_rx: mpsc::UnboundedReceiver<PushReport>,
    push_worker: Option<JoinHandle<()>>,
    pending_pushes: HashSet<String>,

    status: EngineStatus,
    status_tx: watch::Sender<EngineStatus>,
}

impl Engine {
    /// Build the engine for `root`, loading (or seeding) the snapshot and
    /// starting the advisory and push workers.
    pub async fn new(
        root: &Path,
        config: AppConfig,
        vcs: Arc<dyn Vcs>,
        advisory: Option<Arc<dyn AdvisoryService>>,
    ) -> Result<Self, EngineError> {
        let classifier = Classifier::new(&config.classifier)?;
        let detector = Arc::new(ChangeDetector::new(root, &config.classifier)?);
        let paths = RuntimePaths::for_root(root);
        let store = SnapshotStore::new(&paths.state_file);
        let now = Utc::now();

        let mut startup_errors = Vec::new();
        let (snapshot, seeded) = match store.load() {
            SnapshotLoad::Loaded(state) => (state, false),
            SnapshotLoad::Missing => (seed_snapshot(&detector, vcs.as_ref(), now).await, true),
            SnapshotLoad::Corrupt(err) => {
                startup_errors.push(ComponentError {
                    component: Component::Snapshot,
                    message: err.to_string(),
                    at: now,
                });
                (seed_snapshot(&detector, vcs.as_ref(), now).await, true)
            }
        };
        if seeded {
            info!(paths = snapshot.path_hashes.len(), "first run: snapshot seeded from working tree");
            if let Err(err) = store.save(&snapshot).await {
                warn!(error = %err, "cannot persist seeded snapshot");
                startup_errors.push(ComponentError {
                    component: Component::Snapshot,
                    message: err.to_string(),
                    at: now,
                });
            }
        }

        let (advice_tx, advice_rx) = mpsc::channel(1);
        let (advisor, advisor_worker) = match advisory {
            Some(service) => {
                let timeout = Duration::from_secs(config.advisory.timeout_secs.max(1));
                let (handle, worker) = spawn_advisor(service, timeout, advice_tx);
                (Some(handle), Some(worker))
            }
            None => (None, None),
        };

        let (report_tx, push_rx) = mpsc::unbounded_channel();
        let (push_tx, push_worker) = if config.git.push_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            let settings = PushSettings {
                retries: config.git.push_retries,
                backoff: Duration::from_secs(2),
            };
            let worker = spawn_propagator(vcs.clone(), settings, rx, report_tx);
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        let status = EngineStatus {
            phase: EnginePhase::Idle,
            started_at: now,
            last_scan_at: None,
            scans: 0,
            buffered_changes: 0,
            buffered_lines: 0,
            last_checkpoint_at: snapshot.last_checkpoint_at,
            last_checkpoint: None,
            recent_checkpoints: Vec::new(),
            advisory: if advisor.is_some() {
                AdvisoryHealth::Unknown
            } else {
                AdvisoryHealth::Disabled
            },
            push_enabled: config.git.push_enabled,
            errors: startup_errors,
        };
        let (status_tx, _) = watch::channel(status.clone());

        Ok(Self {
            executor: CheckpointExecutor::new(vcs.clone(), root),
            evaluator: TriggerEvaluator::new(config.trigger.clone()),
            policy: DecisionPolicy::new(&config.advisory),
            config,
            detector,
            classifier,
            vcs,
            store,
            snapshot,
            buffer: ChangeBuffer::new(),
            history: VecDeque::new(),
            excluded: HashMap::new(),
            held: None,
            advisor,
            advisor_worker,
            advice_rx,
            push_tx,
            push_rx,
            push_worker,
            pending_pushes: HashSet::new(),
            status,
            status_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> &EngineStatus {
        &self.status
    }

    pub fn buffer(&self) -> &ChangeBuffer {
        &self.buffer
    }

    pub fn snapshot(&self) -> &SnapshotState {
        &self.snapshot
    }

    pub fn history(&self) -> &VecDeque<CheckpointRecord> {
        &self.history
    }

    /// Seed advisory health from a startup ping, before any call completes.
    pub fn set_advisory_reachable(&mut self, reachable: bool) {
        if self.advisor.is_none() {
            return;
        }
        self.status.advisory = if reachable {
            AdvisoryHealth::Reachable
        } else {
            AdvisoryHealth::Unreachable
        };
        self.publish();
    }

    // ── Status bookkeeping ────────────────────────────────────────────────

    fn publish(&mut self) {
        self.status.buffered_changes = self.buffer.len();
        self.status.buffered_lines = self.buffer.total_lines();
        self.status_tx.send_replace(self.status.clone());
    }

    fn set_phase(&mut self, phase: EnginePhase) {
        if self.status.phase != phase {
            debug!(?phase, "engine phase");
        }
        self.status.phase = phase;
        self.publish();
    }

    fn record_error(&mut self, component: Component, message: impl Into<String>) {
        let entry = ComponentError {
            component,
            message: message.into(),
            at: Utc::now(),
        };
        match self.status.errors.iter_mut().find(|e| e.component == component) {
            Some(existing) => *existing = entry,
            None => self.status.errors.push(entry),
        }
    }

    // ── Cycle ─────────────────────────────────────────────────────────────

    /// One full scan cycle.
    pub async fn scan_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        self.scan(now).await;
        self.evaluate(now).await
    }

    /// Detect and classify changes, folding them into the buffer.
    async fn scan(&mut self, now: DateTime<Utc>) {
        self.set_phase(EnginePhase::Scanning);
        let detector = self.detector.clone();
        let listing = match tokio::task::spawn_blocking(move || detector.list()).await {
            Ok(listing) => listing,
            Err(err) => {
                error!(error = %err, "scan task failed");
                self.record_error(Component::Detector, err.to_string());
                self.publish();
                return;
            }
        };
        let report = self.detector.diff(listing, &self.snapshot, &self.buffer);
        self.status.last_scan_at = Some(now);
        self.status.scans += 1;
        for err in &report.errors {
            self.record_error(Component::Detector, err.to_string());
        }
        let changes = self.drop_excluded(report.changes).await;

        self.set_phase(EnginePhase::Classifying);
        let mut touched = Vec::new();
        for change in changes {
            let category = self.classifier.classify(&change.path);
            let baseline = self.snapshot.hash_of(&change.path);
            let observation = self
                .buffer
                .observe(&change.path, category, change.hash, baseline, now);
            debug!(path = %change.path, %category, ?observation, "change observed");
            if matches!(observation, Observation::Inserted | Observation::Updated) {
                touched.push((change.path, change.kind));
            }
        }
        self.refresh_line_stats(touched).await;
        self.publish();
    }

    /// Drop changes git will never stage: paths refused earlier at the same
    /// content, and new paths matched by git's ignore rules.
    async fn drop_excluded(&mut self, changes: Vec<DetectedChange>) -> Vec<DetectedChange> {
        let mut changes: Vec<DetectedChange> = changes
            .into_iter()
            .filter(|c| self.excluded.get(&c.path) != Some(&c.hash))
            .collect();
        let unseen: Vec<String> = changes
            .iter()
            .filter(|c| c.hash.is_some() && !self.buffer.contains(&c.path))
            .map(|c| c.path.clone())
            .collect();
        if unseen.is_empty() {
            return changes;
        }

        let ignored = match self.vcs.ignored(&unseen).await {
            Ok(ignored) => ignored,
            Err(err) => {
                warn!(error = %err, "cannot check ignore rules");
                self.record_error(Component::Detector, err.to_string());
                return changes;
            }
        };
        changes.retain(|c| {
            if !ignored.contains(&c.path) {
                return true;
            }
            debug!(path = %c.path, "ignored by git; not buffering");
            self.excluded.insert(c.path.clone(), c.hash.clone());
            false
        });
        changes
    }

    async fn refresh_line_stats(&mut self, touched: Vec<(String, ChangeKind)>) {
        if touched.is_empty() {
            return;
        }
        let paths: Vec<String> = touched.iter().map(|(path, _)| path.clone()).collect();
        let stats = match self.vcs.numstat(&paths).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "line statistics unavailable");
                self.record_error(Component::Detector, err.to_string());
                HashMap::new()
            }
        };

        let untracked: Vec<String> = touched
            .iter()
            .filter(|(path, kind)| *kind == ChangeKind::Created && !stats.contains_key(path))
            .map(|(path, _)| path.clone())
            .collect();
        let counts = self.count_untracked_lines(untracked).await;

        for (path, kind) in touched {
            let delta = match stats.get(&path) {
                Some(delta) => *delta,
                None if kind == ChangeKind::Created => LineDelta {
                    added: counts.get(&path).copied().unwrap_or(0),
                    removed: 0,
                },
                None => LineDelta::default(),
            };
            self.buffer.set_line_stats(&path, delta);
        }
    }

    async fn count_untracked_lines(&mut self, paths: Vec<String>) -> HashMap<String, u64> {
        if paths.is_empty() {
            return HashMap::new();
        }
        let detector = self.detector.clone();
        let max_bytes = self.config.classifier.max_line_count_bytes;
        let counted = tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .filter_map(|path| detector.count_lines(&path, max_bytes).map(|n| (path, n)))
                .collect::<HashMap<_, _>>()
        })
        .await;
        match counted {
            Ok(counts) => counts,
            Err(err) => {
                warn!(error = %err, "line counting task failed");
                self.record_error(Component::Detector, err.to_string());
                HashMap::new()
            }
        }
    }

    /// Evaluate the trigger rules and act on a fired signal.
    async fn evaluate(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        self.set_phase(EnginePhase::Evaluating);
        let signal = self
            .evaluator
            .evaluate(&self.buffer, self.snapshot.last_checkpoint_at, now);
        if !signal.fired {
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Quiet;
        }
        if let Some(held) = self.held.as_ref().filter(|h| h.still_holds(&self.buffer, &signal)) {
            debug!(rule = ?signal.matched_rule, "buffer unchanged since it was held; not re-asking");
            let decision = held.decision.clone();
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Held(decision);
        }
        info!(
            rule = ?signal.matched_rule,
            priority = ?signal.priority,
            reason = %signal.reason,
            "trigger fired"
        );

        let busy = match self.advisor.as_ref() {
            None => return self.decide_and_commit(&signal, AdvisoryResult::Disabled, now).await,
            Some(advisor) => advisor.is_busy(),
        };
        if busy {
            self.set_phase(EnginePhase::Advising);
            return CycleOutcome::Deferred;
        }

        let branch = match self.vcs.current_branch().await {
            Ok(branch) => branch,
            Err(err) => {
                debug!(error = %err, "branch lookup failed");
                "HEAD".to_string()
            }
        };
        let elapsed_secs = now
            .signed_duration_since(self.snapshot.last_checkpoint_at)
            .num_seconds()
            .max(0) as u64;
        let request = build_request(&self.buffer, &self.history, &branch, elapsed_secs, &signal);

        let dispatched = self.advisor.as_mut().and_then(|advisor| advisor.dispatch(request));
        match dispatched {
            Some(job) => {
                self.set_phase(EnginePhase::Advising);
                CycleOutcome::AwaitingAdvice { job }
            }
            None => {
                let result = AdvisoryResult::Unavailable("advisory worker not running".to_string());
                self.decide_and_commit(&signal, result, now).await
            }
        }
    }

    /// Handle an advisory reply: re-evaluate against the current buffer, then
    /// decide.
    pub async fn on_advice(&mut self, reply: AdvisoryReply, now: DateTime<Utc>) -> CycleOutcome {
        let fresh = self
            .advisor
            .as_mut()
            .is_some_and(|advisor| advisor.complete(reply.id));
        if !fresh {
            debug!(id = reply.id, "ignoring stale advisory reply");
            return CycleOutcome::Quiet;
        }

        debug!(id = reply.id, elapsed_ms = reply.elapsed.as_millis() as u64, "advisory reply received");
        self.note_advisory_health(&reply.result);

        self.set_phase(EnginePhase::Evaluating);
        let signal = self
            .evaluator
            .evaluate(&self.buffer, self.snapshot.last_checkpoint_at, now);
        if !signal.fired {
            debug!("trigger no longer holds after advisory reply");
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Quiet;
        }
        self.decide_and_commit(&signal, reply.result, now).await
    }

    fn note_advisory_health(&mut self, result: &AdvisoryResult) {
        match result.reachable() {
            Some(true) => self.status.advisory = AdvisoryHealth::Reachable,
            Some(false) => self.status.advisory = AdvisoryHealth::Unreachable,
            None => {}
        }
        match result {
            AdvisoryResult::Advice(_) | AdvisoryResult::Disabled => {}
            AdvisoryResult::Timeout => {
                warn!("advisory call timed out; using deterministic rules");
                self.record_error(Component::Advisory, "advisory call timed out");
            }
            AdvisoryResult::Malformed(reason) | AdvisoryResult::Unavailable(reason) => {
                warn!(outcome = result.label(), %reason, "advisory unusable; using deterministic rules");
                let err = EngineError::AdvisoryUnavailable(reason.clone());
                self.record_error(Component::Advisory, err.to_string());
            }
        }
    }

    /// Checkpoint everything pending now, bypassing the trigger rules and the
    /// advisory service.
    pub async fn checkpoint_now(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        self.scan(now).await;
        if self.buffer.is_empty() {
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Quiet;
        }
        self.decide_and_commit(&TriggerSignal::manual(), AdvisoryResult::Disabled, now)
            .await
    }

    async fn decide_and_commit(
        &mut self,
        signal: &TriggerSignal,
        advisory: AdvisoryResult,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        self.set_phase(EnginePhase::Deciding);
        let decision = self.policy.decide(signal, &advisory, &self.buffer);
        info!(
            commit = decision.commit,
            basis = ?decision.basis,
            advisory = advisory.label(),
            message = %decision.message,
            "checkpoint decision"
        );
        if !decision.commit {
            self.held = Some(HeldBuffer {
                fingerprint: self.buffer.fingerprint(),
                priority: signal.priority,
                decision: decision.clone(),
            });
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Held(decision);
        }
        self.held = None;

        self.set_phase(EnginePhase::Committing);
        let outcome = match self.executor.checkpoint(&self.buffer, &decision.message).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "checkpoint failed; changes stay buffered");
                self.record_error(Component::Executor, err.to_string());
                self.set_phase(EnginePhase::Idle);
                return CycleOutcome::Failed(err.to_string());
            }
        };

        for rejected in &outcome.rejected {
            error!(error = %rejected.to_error(), "path dropped from the buffer until its content changes");
            self.record_error(Component::Detector, rejected.to_error().to_string());
            self.excluded.insert(rejected.path.clone(), rejected.hash.clone());
            self.buffer.remove(&rejected.path);
        }
        if outcome.committed.is_empty() && !outcome.rejected.is_empty() {
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Excluded(outcome.rejected.iter().map(|r| r.path.clone()).collect());
        }

        self.snapshot.apply(outcome.committed_pairs(), now);
        if let Err(err) = self.store.save(&self.snapshot).await {
            error!(error = %err, "cannot persist snapshot");
            self.record_error(Component::Snapshot, err.to_string());
        }
        let cleared = self.buffer.clear_committed(outcome.committed_pairs());
        debug!(cleared, remaining = self.buffer.len(), "buffer cleared");
        self.status.last_checkpoint_at = self.snapshot.last_checkpoint_at;

        let Some(mut record) = outcome.record else {
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::AlreadyCommitted;
        };

        match self.push_tx.clone() {
            Some(push_tx) => {
                self.set_phase(EnginePhase::Propagating);
                let request = PushRequest {
                    commit_id: record.commit_id.clone(),
                };
                if push_tx.send(request).is_ok() {
                    self.pending_pushes.insert(record.commit_id.clone());
                } else {
                    record.push_status = PushStatus::Failed;
                    self.record_error(Component::Propagation, "push worker not running");
                }
            }
            None => record.push_status = PushStatus::Skipped,
        }

        self.remember(record.clone());
        self.set_phase(EnginePhase::Idle);
        CycleOutcome::Committed(record)
    }

    fn remember(&mut self, record: CheckpointRecord) {
        self.history.push_back(record.clone());
        while self.history.len() > self.config.engine.history_size.max(1) {
            self.history.pop_front();
        }
        self.status.last_checkpoint = Some(record);
        self.status.recent_checkpoints = self.history.iter().cloned().collect();
    }

    pub fn on_push_report(&mut self, report: PushReport) {
        for commit_id in &report.commit_ids {
            self.pending_pushes.remove(commit_id);
        }
        // A successful push carries every earlier commit on the branch.
        let covers = |record: &CheckpointRecord| {
            report.commit_ids.contains(&record.commit_id)
                || (report.status == PushStatus::Succeeded && record.push_status == PushStatus::Failed)
        };
        for record in self.history.iter_mut() {
            if covers(record) {
                record.push_status = report.status;
            }
        }
        if let Some(last) = self.status.last_checkpoint.as_mut() {
            if covers(last) {
                last.push_status = report.status;
            }
        }
        self.status.recent_checkpoints = self.history.iter().cloned().collect();

        match (report.status, report.error) {
            (PushStatus::Failed, error) => {
                let err = EngineError::PushFailed(error.unwrap_or_default());
                warn!(error = %err, "checkpoint not propagated; will retry after the next checkpoint");
                self.record_error(Component::Propagation, err.to_string());
            }
            (PushStatus::Skipped, Some(reason)) => info!(%reason, "push skipped"),
            _ => {}
        }
        self.publish();
    }

    // ── Loop ──────────────────────────────────────────────────────────────

    /// Run until `shutdown` flips to `true`.  The cycle in progress always
    /// completes; no advisory call is started after the request.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut requests: mpsc::Receiver<EngineRequest>,
    ) -> EngineStatus {
        let interval = Duration::from_secs(self.config.engine.scan_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(root = %self.detector.root().display(), interval_secs = interval.as_secs(), "engine started");

        loop {
            let awaiting_advice = self.advisor.as_ref().is_some_and(AdvisorHandle::is_busy);
            let awaiting_push = !self.pending_pushes.is_empty();

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let outcome = self.scan_cycle(Utc::now()).await;
                    debug!(?outcome, "scan cycle finished");
                }
                Some(reply) = self.advice_rx.recv(), if awaiting_advice => {
                    self.on_advice(reply, Utc::now()).await;
                }
                Some(report) = self.push_rx.recv(), if awaiting_push => {
                    self.on_push_report(report);
                }
                Some(request) = requests.recv() => {
                    match request {
                        EngineRequest::CheckpointNow { reply } => {
                            let outcome = self.checkpoint_now(Utc::now()).await;
                            let _ = reply.send(outcome);
                        }
                    }
                }
            }
        }

        self.stop().await
    }

    async fn stop(mut self) -> EngineStatus {
        info!("engine stopping");

        // A trigger that was waiting on advice is decided without it.
        let abandoned = self.advisor.as_mut().and_then(AdvisorHandle::abandon);
        if abandoned.is_some() {
            let now = Utc::now();
            let signal = self
                .evaluator
                .evaluate(&self.buffer, self.snapshot.last_checkpoint_at, now);
            if signal.fired {
                let result = AdvisoryResult::Unavailable("engine shutting down".to_string());
                self.decide_and_commit(&signal, result, now).await;
            }
        }
        self.advisor = None;
        if let Some(worker) = self.advisor_worker.take() {
            worker.abort();
        }

        self.push_tx = None;
        if let Some(mut worker) = self.push_worker.take() {
            let grace = Duration::from_secs(self.config.engine.shutdown_grace_secs);
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "push still running after grace period; abandoning it");
                worker.abort();
            }
        }
        while let Ok(report) = self.push_rx.try_recv() {
            self.on_push_report(report);
        }

        self.set_phase(EnginePhase::Stopped);
        info!(checkpoints = self.history.len(), "engine stopped");
        self.status
    }
}

/// First-run snapshot: everything on disk except what git reports as dirty,
/// so pre-existing uncommitted work is picked up by the first scan.
async fn seed_snapshot(detector: &Arc<ChangeDetector>, vcs: &dyn Vcs, now: DateTime<Utc>) -> SnapshotState {
    let walker = detector.clone();
    let listing = match tokio::task::spawn_blocking(move || walker.list()).await {
        Ok(listing) => listing,
        Err(err) => {
            warn!(error = %err, "cannot list the working tree; seeding an empty snapshot");
            TreeListing::default()
        }
    };
    let dirty: HashSet<String> = match vcs.dirty_paths().await {
        Ok(paths) => paths.into_iter().collect(),
        Err(err) => {
            warn!(error = %err, "cannot list dirty paths; treating the working tree as clean");
            HashSet::new()
        }
    };
    let hashes = listing
        .hashes
        .into_iter()
        .filter(|(path, _)| !dirty.contains(path))
        .collect();
    SnapshotState::new(now, hashes)
}

/// Validate everything that would make the engine refuse to start.
pub async fn preflight(root: &Path, config: &AppConfig, vcs: &dyn Vcs) -> Result<(), EngineError> {
    if !vcs.is_repository().await {
        return Err(EngineError::Configuration(format!(
            "{} is not inside a git work tree",
            root.display()
        )));
    }
    Classifier::new(&config.classifier)?;
    ChangeDetector::new(root, &config.classifier)?;
    waypoint_llm::build_advisory_service(&config.advisory)
        .map_err(|err| EngineError::Configuration(err.to_string()))?;
    Ok(())
}
