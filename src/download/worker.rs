// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker execution unit: runs exactly one transfer.
//!
//! A worker owns no job state. It reports progress, its outcome, the
//! optional activation note, and finally its own exit, all as commands on
//! the coordinator channel.

use std::any::Any;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::activation::{self, ModelActivator};
use super::manager::{DownloadCommand, DownloadConfig};
use super::transfer::{FetchRequest, ProgressSink, Transfer};
use super::types::{DownloadJob, JobId, JobOutcome};
use crate::utils::redact_secrets;

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub transfer: Arc<dyn Transfer>,
    pub activator: Option<Arc<dyn ModelActivator>>,
    pub config: Arc<DownloadConfig>,
}

/// Directory a model's snapshot lives in under `root`.
///
/// Only normal path components of the model id are kept, so ids cannot
/// escape the download root.
pub fn snapshot_dir(root: &Path, model_id: &str) -> PathBuf {
    let mut dir = root.to_path_buf();
    for component in Path::new(model_id).components() {
        if let Component::Normal(part) = component {
            dir.push(part);
        }
    }
    dir
}

/// Sends `Exited` when dropped, including during a panic unwind.
struct ExitGuard {
    id: JobId,
    events: mpsc::UnboundedSender<DownloadCommand>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.events.send(DownloadCommand::Exited { id: self.id.clone() });
    }
}

/// Launch a worker for a job that was just marked running.
pub(crate) fn spawn(
    job: DownloadJob,
    ctx: WorkerContext,
    cancel_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<DownloadCommand>,
) {
    tokio::spawn(run(job, ctx, cancel_rx, events));
}

async fn run(
    job: DownloadJob,
    ctx: WorkerContext,
    mut cancel_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<DownloadCommand>,
) {
    let _guard = ExitGuard {
        id: job.id.clone(),
        events: events.clone(),
    };

    tracing::info!(job_id = %job.id, model_id = %job.model_id(), "Download started");

    let outcome = execute(&job, &ctx, &mut cancel_rx, &events).await;
    let completed = matches!(outcome, JobOutcome::Completed { .. });

    match &outcome {
        JobOutcome::Completed { .. } => {
            tracing::info!(job_id = %job.id, model_id = %job.model_id(), "Download completed")
        }
        JobOutcome::Failed { error } => {
            tracing::warn!(job_id = %job.id, model_id = %job.model_id(), error = %error, "Download failed")
        }
        JobOutcome::Cancelled => {
            tracing::info!(job_id = %job.id, model_id = %job.model_id(), "Download cancelled")
        }
    }

    let _ = events.send(DownloadCommand::Finished {
        id: job.id.clone(),
        outcome,
    });

    if !completed || !job.request.auto_load {
        return;
    }
    // Cancelled just as the transfer finished: the job stays cancelled,
    // so the model is not activated either.
    if !matches!(cancel_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
        return;
    }
    let Some(activator) = ctx.activator.as_ref() else {
        return;
    };

    let activation = activator.activate(
        &ctx.config.provider_id,
        job.model_id(),
        job.request.revision.as_deref(),
        job.request.quantization.as_deref(),
    );
    let result = tokio::select! {
        result = activation => result,
        // Shutdown interrupts activation; the job stays completed.
        _ = &mut cancel_rx => {
            tracing::info!(job_id = %job.id, model_id = %job.model_id(), "Model activation interrupted");
            return;
        }
    };

    let note = match result {
        Ok(()) => activation::LOADED.to_string(),
        Err(e) => {
            tracing::warn!(job_id = %job.id, model_id = %job.model_id(), error = %e, "Automatic model load failed");
            activation::degraded_message(&e)
        }
    };

    let _ = events.send(DownloadCommand::Annotate {
        id: job.id.clone(),
        message: note,
    });
}

/// Run the transfer until it finishes or cancellation is observed.
async fn execute(
    job: &DownloadJob,
    ctx: &WorkerContext,
    cancel_rx: &mut oneshot::Receiver<()>,
    events: &mpsc::UnboundedSender<DownloadCommand>,
) -> JobOutcome {
    let destination = snapshot_dir(&ctx.config.download_root, job.model_id());
    if let Err(e) = tokio::fs::create_dir_all(&destination).await {
        return JobOutcome::Failed {
            error: format!("Failed to create download directory {}: {}", destination.display(), e),
        };
    }

    let token = job
        .request
        .token
        .clone()
        .or_else(|| ctx.config.default_token.clone());

    let request = FetchRequest {
        model_id: job.request.model_id.clone(),
        revision: job.request.revision.clone(),
        destination,
        token,
    };
    let sink = ProgressSink::new(job.id.clone(), events.clone());
    let transfer = Arc::clone(&ctx.transfer);

    // The transfer runs in its own task so a panic there is observed here
    // as a join error instead of taking the worker down.
    let mut handle = tokio::spawn(async move { transfer.fetch(request, sink).await });

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(path)) => JobOutcome::Completed {
                message: format!("Model cached under {}", path.display()),
            },
            Ok(Err(e)) => JobOutcome::Failed {
                error: redact_secrets(&e.to_string()),
            },
            Err(e) if e.is_panic() => JobOutcome::Failed {
                error: format!("Download worker crashed: {}", panic_message(e.into_panic())),
            },
            Err(_) => JobOutcome::Cancelled,
        },
        // A dropped sender means the manager shut down; treat it the same.
        _ = &mut *cancel_rx => {
            handle.abort();
            JobOutcome::Cancelled
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
