//! Off-loop advisory calls.
//!
//! A single worker task owns the advisory service; the engine hands it at
//! most one job at a time and keeps scanning while the call is in flight.
//! Every job yields exactly one reply: the service's advice, or a
//! [`AdvisoryResult`] failure variant once the deadline has passed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use waypoint_llm::{AdvisoryError, AdvisoryRequest, AdvisoryResult, AdvisoryService};

use crate::buffer::ChangeBuffer;
use crate::executor::CheckpointRecord;
use crate::trigger::TriggerSignal;

/// Checkpoint messages included as context.
const RECENT_MESSAGES: usize = 5;

#[derive(Debug, Clone)]
pub struct AdvisoryJob {
    pub id: u64,
    pub request: AdvisoryRequest,
}

#[derive(Debug, Clone)]
pub struct AdvisoryReply {
    pub id: u64,
    pub result: AdvisoryResult,
    pub elapsed: Duration,
}

/// Build the request sent to the advisory service.  File contents are never
/// included.
pub fn build_request(
    buffer: &ChangeBuffer,
    history: &VecDeque<CheckpointRecord>,
    branch: &str,
    elapsed_secs: u64,
    trigger: &TriggerSignal,
) -> AdvisoryRequest {
    let skip = history.len().saturating_sub(RECENT_MESSAGES);
    AdvisoryRequest {
        counts: buffer.counts(),
        critical_paths: buffer.paths_in(crate::classifier::ChangeCategory::Critical),
        recent_messages: history.iter().skip(skip).map(|r| r.message.clone()).collect(),
        branch: branch.to_string(),
        elapsed_secs,
        lines_changed: buffer.total_lines(),
        trigger_reason: trigger.reason.clone(),
    }
}

/// Call the service with a hard deadline.  The future is dropped (and the
/// connection abandoned) when the deadline passes.
pub async fn consult(
    service: &dyn AdvisoryService,
    request: &AdvisoryRequest,
    timeout: Duration,
) -> AdvisoryResult {
    match tokio::time::timeout(timeout, service.advise(request)).await {
        Ok(Ok(advice)) => AdvisoryResult::Advice(advice),
        Ok(Err(AdvisoryError::Malformed(reason))) => AdvisoryResult::Malformed(reason),
        Ok(Err(AdvisoryError::Transport(reason))) => AdvisoryResult::Unavailable(reason),
        Err(_) => AdvisoryResult::Timeout,
    }
}

/// Sending side of the advisory worker.
pub struct AdvisorHandle {
    jobs: mpsc::Sender<AdvisoryJob>,
    next_id: u64,
    in_flight: Option<u64>,
}

impl AdvisorHandle {
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Queue a job unless one is already in flight.  Returns the job id.
    pub fn dispatch(&mut self, request: AdvisoryRequest) -> Option<u64> {
        if self.in_flight.is_some() {
            return None;
        }
        self.next_id += 1;
        let id = self.next_id;
        match self.jobs.try_send(AdvisoryJob { id, request }) {
            Ok(()) => {
                self.in_flight = Some(id);
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, "advisory worker unavailable");
                None
            }
        }
    }

    /// Mark the reply for `id` as received.  Returns `false` for stale ids.
    pub fn complete(&mut self, id: u64) -> bool {
        if self.in_flight == Some(id) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Forget the in-flight job; its reply will be ignored as stale.
    pub fn abandon(&mut self) -> Option<u64> {
        self.in_flight.take()
    }
}

pub fn spawn_advisor(
    service: Arc<dyn AdvisoryService>,
    timeout: Duration,
    replies: mpsc::Sender<AdvisoryReply>,
) -> (AdvisorHandle, JoinHandle<()>) {
    let (jobs_tx, mut jobs_rx) = mpsc::channel::<AdvisoryJob>(1);

    let worker = tokio::spawn(async move {
        while let Some(job) = jobs_rx.recv().await {
            let started = Instant::now();
            let result = consult(service.as_ref(), &job.request, timeout).await;
            let elapsed = started.elapsed();
            debug!(
                id = job.id,
                provider = service.name(),
                outcome = result.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                "advisory call finished"
            );
            let reply = AdvisoryReply {
                id: job.id,
                result,
                elapsed,
            };
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    });

    let handle = AdvisorHandle {
        jobs: jobs_tx,
        next_id: 0,
        in_flight: None,
    };
    (handle, worker)
}
