// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The byte-transfer seam used by download workers.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::TransferError;
use super::manager::DownloadCommand;
use super::types::JobId;

/// Everything a transfer needs to fetch one model snapshot.
#[derive(Clone)]
pub struct FetchRequest {
    pub model_id: String,
    pub revision: Option<String>,
    /// Directory the snapshot is written into (already created)
    pub destination: PathBuf,
    pub token: Option<String>,
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("model_id", &self.model_id)
            .field("revision", &self.revision)
            .field("destination", &self.destination)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Thread-safe progress hand-off from a transfer to the coordinator.
///
/// Reports are posted onto the coordinator's command channel; nothing is
/// written to job state from the transfer's context. Safe to call from
/// blocking threads.
#[derive(Clone)]
pub struct ProgressSink {
    job_id: JobId,
    events: mpsc::UnboundedSender<DownloadCommand>,
}

impl ProgressSink {
    pub(crate) fn new(job_id: JobId, events: mpsc::UnboundedSender<DownloadCommand>) -> Self {
        Self { job_id, events }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Report cumulative bytes. `total` is `None` until known.
    pub fn report(&self, downloaded: u64, total: Option<u64>) {
        // A closed channel means the manager is gone; nobody is listening.
        let _ = self.events.send(DownloadCommand::Progress {
            id: self.job_id.clone(),
            downloaded,
            total,
        });
    }
}

/// Fetches a model snapshot into a destination directory.
///
/// Cancellation is cooperative: the worker drops (aborts) the future, so
/// implementations must not rely on running to completion.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Download the snapshot, returning the directory it was written to.
    async fn fetch(&self, request: FetchRequest, progress: ProgressSink) -> Result<PathBuf, TransferError>;
}
