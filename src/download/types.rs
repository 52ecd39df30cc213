// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types for background model downloading.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};

/// Highest progress ratio a job may show before it is `Completed`.
///
/// A transfer can report `downloaded == total` well before the worker
/// finishes writing files, so running jobs stay just below 1.0.
pub const MAX_RUNNING_PROGRESS: f64 = 0.999;

/// Opaque job identifier (`hfjob-<32 hex chars>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let hex: String = (0..32)
            .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect();
        Self(format!("hfjob-{}", hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A caller's request to fetch one model snapshot.
#[derive(Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Repository id on the Hub (e.g. "Qwen/Qwen2.5-0.5B-Instruct")
    pub model_id: String,
    /// Branch, tag or commit; defaults to the repository's main branch
    #[serde(default)]
    pub revision: Option<String>,
    /// Task tag (e.g. "text-generation")
    #[serde(default)]
    pub task: Option<String>,
    /// Quantization tag forwarded to the activation step
    #[serde(default)]
    pub quantization: Option<String>,
    /// Access token overriding the configured default
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// Activate the model once the download finishes
    #[serde(default = "default_auto_load")]
    pub auto_load: bool,
}

fn default_auto_load() -> bool {
    true
}

impl DownloadRequest {
    /// Request a model at its default revision with auto-load enabled.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: None,
            task: None,
            quantization: None,
            token: None,
            auto_load: true,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }

    pub fn with_auto_load(mut self, auto_load: bool) -> Self {
        self.auto_load = auto_load;
        self
    }
}

// The token never shows up in logs.
impl std::fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("model_id", &self.model_id)
            .field("revision", &self.revision)
            .field("task", &self.task)
            .field("quantization", &self.quantization)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("auto_load", &self.auto_load)
            .finish()
    }
}

/// Lifecycle state of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting in queue
    Queued,
    /// Transfer in flight
    Running,
    /// Successfully completed
    Completed,
    /// Transfer raised an error
    Failed,
    /// Cancelled before or during the transfer
    Cancelled,
}

impl DownloadStatus {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// The only legal edges of the job state machine.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Running => "running",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker's transfer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Transfer finished; carries the status message to record
    Completed { message: String },
    /// Transfer raised an error
    Failed { error: String },
    /// Cancellation signal was observed
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> DownloadStatus {
        match self {
            JobOutcome::Completed { .. } => DownloadStatus::Completed,
            JobOutcome::Failed { .. } => DownloadStatus::Failed,
            JobOutcome::Cancelled => DownloadStatus::Cancelled,
        }
    }
}

/// A tracked download job.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: JobId,
    #[serde(flatten)]
    pub request: DownloadRequest,
    pub status: DownloadStatus,
    #[serde(serialize_with = "serialize_progress")]
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn serialize_progress<S: Serializer>(progress: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((progress * 10_000.0).round() / 10_000.0)
}

impl DownloadJob {
    /// Create a queued job for a request.
    pub fn new(request: DownloadRequest) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            request,
            status: DownloadStatus::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.request.model_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a progress report from the transfer.
    ///
    /// Returns false (and changes nothing) when the job is already terminal.
    pub fn apply_progress(&mut self, downloaded: u64, total: Option<u64>) -> bool {
        if self.is_terminal() {
            return false;
        }

        match total {
            Some(total) if total > 0 => {
                self.downloaded_bytes = downloaded.min(total);
                self.total_bytes = Some(total);
                let ratio = self.downloaded_bytes as f64 / total as f64;
                self.progress = ratio.clamp(0.0, MAX_RUNNING_PROGRESS);
            }
            Some(total) => {
                self.downloaded_bytes = downloaded.min(total);
                self.total_bytes = Some(total);
            }
            None => {
                self.downloaded_bytes = downloaded;
            }
        }
        self.updated_at = Utc::now();
        true
    }

    /// Move to `next`, stamping timestamps. Refuses illegal edges.
    pub fn transition(&mut self, next: DownloadStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if next == DownloadStatus::Completed {
            self.progress = 1.0;
            if let Some(total) = self.total_bytes {
                self.downloaded_bytes = total;
            }
        }
        true
    }
}
