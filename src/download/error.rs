// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the download scheduler and its collaborators.

use thiserror::Error;

use super::types::{DownloadStatus, JobId};

/// Errors raised by the download manager itself.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download manager is shut down")]
    ManagerClosed,

    #[error("Download job not found: {0}")]
    NotFound(JobId),

    #[error("Illegal transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: DownloadStatus,
        to: DownloadStatus,
    },
}

/// Errors raised by a transfer collaborator.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Authentication failed for '{0}'. Check the access token.")]
    Unauthorized(String),

    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Hub API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to write '{path}': {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// Errors raised while activating a downloaded model.
#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Model files missing under {0}")]
    MissingFiles(String),

    #[error("{0}")]
    Other(String),
}
