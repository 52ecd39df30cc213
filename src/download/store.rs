// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory job store, wait queue, and state machine.
//!
//! The store is owned by the download coordinator task and is never shared,
//! so none of these methods lock anything. Every mutation goes through
//! [`DownloadStatus::can_transition_to`].

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use serde::Serialize;

use super::error::DownloadError;
use super::types::{DownloadJob, DownloadRequest, DownloadStatus, JobId, JobOutcome};

/// Message recorded when a queued job is cancelled.
pub const CANCELLED_BEFORE_START: &str = "Cancelled before download started.";

/// Message shown while a running job waits for its worker to stop.
pub const CANCELLING: &str = "Cancelling download...";

/// Message recorded once a worker has observed cancellation.
pub const CANCELLED: &str = "Download cancelled.";

/// Message recorded when a worker exits without reporting an outcome.
pub const WORKER_EXITED: &str = "Download worker exited unexpectedly.";

#[derive(Debug)]
struct Entry {
    /// Submission sequence, breaks `created_at` ties
    seq: u64,
    job: DownloadJob,
    /// Flipped to Cancelled while the worker is still running
    cancel_pending: bool,
    /// The post-completion hook already wrote its note
    annotated: bool,
}

/// What a cancel request did.
#[derive(Debug, Clone)]
pub enum CancelEffect {
    /// Job was already terminal; nothing changed
    Unchanged(DownloadJob),
    /// Job was queued and is now cancelled
    Dequeued(DownloadJob),
    /// Job is running; its worker must be signalled
    Signalled(DownloadJob),
}

impl CancelEffect {
    pub fn job(&self) -> &DownloadJob {
        match self {
            CancelEffect::Unchanged(job)
            | CancelEffect::Dequeued(job)
            | CancelEffect::Signalled(job) => job,
        }
    }

    pub fn into_job(self) -> DownloadJob {
        match self {
            CancelEffect::Unchanged(job)
            | CancelEffect::Dequeued(job)
            | CancelEffect::Signalled(job) => job,
        }
    }
}

/// Status counts for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Authoritative storage for every download job.
#[derive(Debug)]
pub struct JobStore {
    entries: HashMap<JobId, Entry>,
    queue: VecDeque<JobId>,
    next_seq: u64,
    max_parallel: usize,
    max_history: usize,
}

impl JobStore {
    /// Create a store allowing `max_parallel` running jobs and keeping at
    /// most `max_history` terminal records (never fewer than one).
    pub fn new(max_parallel: usize, max_history: usize) -> Self {
        Self {
            entries: HashMap::new(),
            queue: VecDeque::new(),
            next_seq: 0,
            max_parallel: max_parallel.max(1),
            max_history: max_history.max(1),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Record a new queued job and append it to the wait queue.
    pub fn submit(&mut self, request: DownloadRequest) -> DownloadJob {
        let mut job = DownloadJob::new(request);
        while self.entries.contains_key(&job.id) {
            job.id = JobId::generate();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(job.id.clone());
        self.entries.insert(
            job.id.clone(),
            Entry {
                seq,
                job: job.clone(),
                cancel_pending: false,
                annotated: false,
            },
        );
        job
    }

    pub fn get(&self, id: &JobId) -> Option<&DownloadJob> {
        self.entries.get(id).map(|e| &e.job)
    }

    /// Snapshot of all jobs, newest first.
    pub fn list(&self) -> Vec<DownloadJob> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Ids waiting to start, in start order.
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.queue.iter().cloned().collect()
    }

    /// Number of jobs whose worker has not exited yet.
    ///
    /// A running job that was optimistically cancelled still holds its slot
    /// until the worker stops.
    pub fn running_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.job.status == DownloadStatus::Running || e.cancel_pending)
            .count()
    }

    pub fn has_capacity(&self) -> bool {
        self.running_count() < self.max_parallel
    }

    /// Pop the queue head and mark it running, if a slot is free.
    pub fn start_next(&mut self) -> Option<DownloadJob> {
        while self.has_capacity() {
            let id = self.queue.pop_front()?;
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if !entry.job.transition(DownloadStatus::Running) {
                tracing::warn!(job_id = %id, status = %entry.job.status, "Skipping non-queued job in wait queue");
                continue;
            }
            return Some(entry.job.clone());
        }
        None
    }

    /// Cancel a job. `None` if the id is unknown.
    pub fn cancel(&mut self, id: &JobId) -> Option<CancelEffect> {
        let entry = self.entries.get_mut(id)?;

        match entry.job.status {
            status if status.is_terminal() => Some(CancelEffect::Unchanged(entry.job.clone())),
            DownloadStatus::Queued => {
                self.queue.retain(|queued| queued != id);
                entry.job.transition(DownloadStatus::Cancelled);
                entry.job.message = Some(CANCELLED_BEFORE_START.to_string());
                let job = entry.job.clone();
                self.evict_history();
                Some(CancelEffect::Dequeued(job))
            }
            _ => {
                entry.job.transition(DownloadStatus::Cancelled);
                // The worker writes the final record.
                entry.job.completed_at = None;
                entry.job.message = Some(CANCELLING.to_string());
                entry.cancel_pending = true;
                Some(CancelEffect::Signalled(entry.job.clone()))
            }
        }
    }

    /// Apply a transfer progress report. Returns false when discarded.
    pub fn update_progress(&mut self, id: &JobId, downloaded: u64, total: Option<u64>) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => entry.job.apply_progress(downloaded, total),
            None => false,
        }
    }

    /// Record the outcome reported by a job's worker.
    ///
    /// A job cancelled while running stays cancelled whatever the worker
    /// reports.
    pub fn finish(&mut self, id: &JobId, outcome: JobOutcome) -> Result<DownloadJob, DownloadError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| DownloadError::NotFound(id.clone()))?;

        if entry.cancel_pending {
            entry.cancel_pending = false;
            let now = Utc::now();
            entry.job.completed_at = Some(now);
            entry.job.updated_at = now;
            entry.job.message = Some(CANCELLED.to_string());
        } else {
            let from = entry.job.status;
            let to = outcome.status();
            if !entry.job.transition(to) {
                return Err(DownloadError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to,
                });
            }
            entry.job.message = match outcome {
                JobOutcome::Completed { message } => Some(message),
                JobOutcome::Failed { error } => Some(error),
                JobOutcome::Cancelled => Some(CANCELLED.to_string()),
            };
        }

        let job = entry.job.clone();
        self.evict_history();
        Ok(job)
    }

    /// Replace the message of a completed job once, for the
    /// post-completion hook. Returns false when refused.
    pub fn annotate(&mut self, id: &JobId, message: impl Into<String>) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.job.status != DownloadStatus::Completed || entry.annotated {
            return false;
        }
        entry.annotated = true;
        entry.job.message = Some(message.into());
        entry.job.updated_at = Utc::now();
        true
    }

    /// Called when a job's worker has exited, on every exit path.
    ///
    /// Settles jobs whose worker died without reporting an outcome.
    pub fn worker_exited(&mut self, id: &JobId) -> Option<DownloadJob> {
        let entry = self.entries.get(id)?;
        if entry.cancel_pending {
            return self.finish(id, JobOutcome::Cancelled).ok();
        }
        if entry.job.status == DownloadStatus::Running {
            return self
                .finish(
                    id,
                    JobOutcome::Failed {
                        error: WORKER_EXITED.to_string(),
                    },
                )
                .ok();
        }
        None
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.entries.values() {
            match entry.job.status {
                DownloadStatus::Queued => counts.queued += 1,
                DownloadStatus::Running => counts.running += 1,
                DownloadStatus::Completed => counts.completed += 1,
                DownloadStatus::Failed => counts.failed += 1,
                DownloadStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Drop the oldest terminal records beyond the history cap.
    fn evict_history(&mut self) {
        let mut terminal: Vec<(u64, JobId)> = self
            .entries
            .values()
            .filter(|e| e.job.is_terminal() && !e.cancel_pending)
            .map(|e| (e.seq, e.job.id.clone()))
            .collect();
        if terminal.len() <= self.max_history {
            return;
        }

        terminal.sort_by_key(|(seq, _)| *seq);
        let excess = terminal.len() - self.max_history;
        for (_, id) in terminal.into_iter().take(excess) {
            tracing::debug!(job_id = %id, "Evicting finished download from history");
            self.entries.remove(&id);
        }
    }
}
