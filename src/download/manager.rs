// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager for background model downloading.
//!
//! A single coordinator task owns the [`JobStore`] and the map of active
//! workers. Callers and workers only talk to it through one command
//! channel, so every transition for a job is applied in order and the
//! capacity rebalance always runs to completion before the next command.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::activation::ModelActivator;
use super::error::DownloadError;
use super::store::{CancelEffect, JobStore, StatusCounts};
use super::transfer::Transfer;
use super::types::{DownloadJob, DownloadRequest, JobId, JobOutcome};
use super::worker::{self, WorkerContext};

/// Upper bound for concurrently running downloads.
pub const MAX_PARALLEL_DOWNLOADS: usize = 4;

/// Default number of finished jobs kept for listing.
pub const DEFAULT_MAX_HISTORY: usize = 256;

/// Scheduler configuration (read-only once the manager starts).
#[derive(Clone)]
pub struct DownloadConfig {
    /// Maximum concurrently running jobs, clamped to 1..=4
    pub max_parallel: usize,
    /// Root directory snapshots are written under
    pub download_root: PathBuf,
    /// Token used when a request carries none
    pub default_token: Option<String>,
    /// Finished jobs kept in memory
    pub max_history: usize,
    /// Provider the post-completion hook activates models on
    pub provider_id: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            download_root: PathBuf::from("./models"),
            default_token: None,
            max_history: DEFAULT_MAX_HISTORY,
            provider_id: "huggingface".to_string(),
        }
    }
}

impl std::fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("max_parallel", &self.max_parallel)
            .field("download_root", &self.download_root)
            .field("default_token", &self.default_token.as_ref().map(|_| "[REDACTED]"))
            .field("max_history", &self.max_history)
            .field("provider_id", &self.provider_id)
            .finish()
    }
}

/// Commands processed by the coordinator task.
#[derive(Debug)]
pub enum DownloadCommand {
    /// Queue a new download
    Submit {
        request: DownloadRequest,
        reply: oneshot::Sender<Result<DownloadJob, DownloadError>>,
    },
    /// Snapshot of all jobs, newest first
    List { reply: oneshot::Sender<Vec<DownloadJob>> },
    /// Look up one job
    Get {
        id: JobId,
        reply: oneshot::Sender<Option<DownloadJob>>,
    },
    /// Cancel a queued or running job
    Cancel {
        id: JobId,
        reply: oneshot::Sender<Option<DownloadJob>>,
    },
    /// Status counts
    Stats { reply: oneshot::Sender<StatusCounts> },
    /// Progress reported by a transfer
    Progress {
        id: JobId,
        downloaded: u64,
        total: Option<u64>,
    },
    /// Terminal outcome reported by a worker
    Finished { id: JobId, outcome: JobOutcome },
    /// Post-completion note from a worker
    Annotate { id: JobId, message: String },
    /// A worker has exited (sent on every exit path)
    Exited { id: JobId },
    /// Cancel everything and stop once all workers have exited
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to the background download scheduler.
///
/// Cheap to clone. The coordinator stops once [`shutdown`](Self::shutdown)
/// completes or every handle has been dropped.
#[derive(Clone)]
pub struct DownloadManager {
    command_tx: mpsc::UnboundedSender<DownloadCommand>,
    max_parallel: usize,
}

impl DownloadManager {
    /// Start the coordinator. Must be called within a tokio runtime.
    pub fn new(
        config: DownloadConfig,
        transfer: Arc<dyn Transfer>,
        activator: Option<Arc<dyn ModelActivator>>,
    ) -> Self {
        let max_parallel = config.max_parallel.clamp(1, MAX_PARALLEL_DOWNLOADS);
        if max_parallel != config.max_parallel {
            tracing::warn!(
                requested = config.max_parallel,
                using = max_parallel,
                "Parallel download limit out of range, clamping"
            );
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            store: JobStore::new(max_parallel, config.max_history),
            active: HashMap::new(),
            ctx: WorkerContext {
                transfer,
                activator,
                config: Arc::new(DownloadConfig {
                    max_parallel,
                    ..config
                }),
            },
            events: command_tx.downgrade(),
            shutdown_waiters: Vec::new(),
        };

        tokio::spawn(coordinator.run(command_rx));

        Self {
            command_tx,
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Queue a model for download.
    ///
    /// Returns the job as created (status `Queued`); it may already be
    /// running by the time the caller looks again. Fails with
    /// [`DownloadError::ManagerClosed`] once shutdown has begun.
    pub async fn submit(&self, request: DownloadRequest) -> Result<DownloadJob, DownloadError> {
        self.request(|reply| DownloadCommand::Submit { request, reply }).await?
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> Result<Vec<DownloadJob>, DownloadError> {
        self.request(|reply| DownloadCommand::List { reply }).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<DownloadJob>, DownloadError> {
        let id = id.clone();
        self.request(|reply| DownloadCommand::Get { id, reply }).await
    }

    /// Cancel a job. Idempotent on finished jobs; `None` if unknown.
    pub async fn cancel(&self, id: &JobId) -> Result<Option<DownloadJob>, DownloadError> {
        let id = id.clone();
        self.request(|reply| DownloadCommand::Cancel { id, reply }).await
    }

    pub async fn stats(&self) -> Result<StatusCounts, DownloadError> {
        self.request(|reply| DownloadCommand::Stats { reply }).await
    }

    /// Cancel queued and running jobs, interrupt any post-download
    /// activation, and wait for every worker to exit.
    ///
    /// Calling it again after the coordinator stopped is a no-op.
    pub async fn shutdown(&self) -> Result<(), DownloadError> {
        match self.request(|reply| DownloadCommand::Shutdown { reply }).await {
            Err(DownloadError::ManagerClosed) => Ok(()),
            other => other,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DownloadCommand,
    ) -> Result<T, DownloadError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .map_err(|_| DownloadError::ManagerClosed)?;
        rx.await.map_err(|_| DownloadError::ManagerClosed)
    }
}

/// Owns all scheduler state; runs as a single task.
struct Coordinator {
    store: JobStore,
    /// Running workers; the cancellation handle is taken once signalled
    active: HashMap<JobId, Option<oneshot::Sender<()>>>,
    ctx: WorkerContext,
    /// Upgraded only to hand a sender to new workers, so dropped handles
    /// can still close the channel.
    events: mpsc::WeakUnboundedSender<DownloadCommand>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Coordinator {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<DownloadCommand>) {
        tracing::debug!(max_parallel = self.store.max_parallel(), "Download coordinator started");

        while let Some(command) = command_rx.recv().await {
            self.handle(command);

            if !self.shutdown_waiters.is_empty() && self.active.is_empty() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }
        }

        // Handles dropped without a shutdown: stop whatever is still running.
        for (id, cancel) in self.active.drain() {
            if let Some(cancel) = cancel {
                tracing::debug!(job_id = %id, "Cancelling download on coordinator exit");
                let _ = cancel.send(());
            }
        }
        tracing::debug!("Download coordinator stopped");
    }

    fn handle(&mut self, command: DownloadCommand) {
        match command {
            DownloadCommand::Submit { request, reply } => {
                if self.shutting_down() {
                    tracing::debug!(model_id = %request.model_id, "Rejecting download submitted during shutdown");
                    let _ = reply.send(Err(DownloadError::ManagerClosed));
                    return;
                }
                let job = self.store.submit(request);
                tracing::info!(job_id = %job.id, model_id = %job.model_id(), "Download queued");
                let _ = reply.send(Ok(job));
                self.rebalance();
            }
            DownloadCommand::List { reply } => {
                let _ = reply.send(self.store.list());
            }
            DownloadCommand::Get { id, reply } => {
                let _ = reply.send(self.store.get(&id).cloned());
            }
            DownloadCommand::Cancel { id, reply } => {
                let result = self.cancel(&id);
                let _ = reply.send(result);
                self.rebalance();
            }
            DownloadCommand::Stats { reply } => {
                let _ = reply.send(self.store.status_counts());
            }
            DownloadCommand::Progress { id, downloaded, total } => {
                if !self.store.update_progress(&id, downloaded, total) {
                    tracing::trace!(job_id = %id, downloaded, "Discarding late progress report");
                }
            }
            DownloadCommand::Finished { id, outcome } => {
                if let Err(e) = self.store.finish(&id, outcome) {
                    tracing::warn!(job_id = %id, error = %e, "Ignoring worker outcome");
                }
            }
            DownloadCommand::Annotate { id, message } => {
                if !self.store.annotate(&id, message) {
                    tracing::debug!(job_id = %id, "Ignoring post-completion note");
                }
            }
            DownloadCommand::Exited { id } => {
                self.active.remove(&id);
                if let Some(job) = self.store.worker_exited(&id) {
                    tracing::warn!(job_id = %id, status = %job.status, "Worker exited without reporting an outcome");
                }
                self.rebalance();
            }
            DownloadCommand::Shutdown { reply } => {
                self.begin_shutdown();
                self.shutdown_waiters.push(reply);
            }
        }
    }

    fn cancel(&mut self, id: &JobId) -> Option<DownloadJob> {
        let effect = self.store.cancel(id)?;
        match &effect {
            CancelEffect::Unchanged(job) => {
                tracing::debug!(job_id = %id, status = %job.status, "Cancel on finished download ignored");
            }
            CancelEffect::Dequeued(_) => {
                tracing::info!(job_id = %id, "Queued download cancelled");
            }
            CancelEffect::Signalled(_) => {
                tracing::info!(job_id = %id, "Cancelling running download");
                // The entry stays until the worker exits and frees its slot.
                if let Some(cancel) = self.active.get_mut(id).and_then(Option::take) {
                    let _ = cancel.send(());
                }
            }
        }
        Some(effect.into_job())
    }

    /// Start queued jobs while capacity remains.
    fn rebalance(&mut self) {
        if self.shutting_down() {
            return;
        }

        while self.store.has_capacity() && !self.store.queued_ids().is_empty() {
            let Some(events) = self.events.upgrade() else {
                tracing::debug!("All manager handles dropped, not starting new downloads");
                return;
            };
            let Some(job) = self.store.start_next() else {
                return;
            };

            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.active.insert(job.id.clone(), Some(cancel_tx));
            worker::spawn(job, self.ctx.clone(), cancel_rx, events);
        }
    }

    fn shutting_down(&self) -> bool {
        !self.shutdown_waiters.is_empty()
    }

    fn begin_shutdown(&mut self) {
        tracing::info!(active = self.active.len(), "Shutting down download manager");

        for id in self.store.queued_ids() {
            self.store.cancel(&id);
        }
        let running: Vec<JobId> = self.active.keys().cloned().collect();
        for id in running {
            self.cancel(&id);
        }
        // Workers of finished jobs may still be activating the model.
        for (id, cancel) in self.active.iter_mut() {
            if let Some(cancel) = cancel.take() {
                tracing::debug!(job_id = %id, "Interrupting post-download activation");
                let _ = cancel.send(());
            }
        }
    }
}
