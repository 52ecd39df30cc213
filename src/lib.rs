// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! playground - model playground backend library
//!
//! Fetches Hugging Face model snapshots in the background so the API stays
//! responsive while large downloads run.
//!
//! **Submit** -> **Wait Queue** -> **Worker (transfer)** -> **Activate**
//!
//! # Core Modules
//!
//! - [`download`] - Bounded download scheduler, job store, and Hub transfer
//! - [`local`] - Registry of models activated for local serving
//! - [`server`] - HTTP API over the scheduler
//! - [`config`] - Settings from defaults, config file, and environment
//! - [`errors`] - API error responses with reference codes
//! - [`utils`] - Secret masking and redaction

pub mod config;
pub mod download;
pub mod errors;
pub mod local;
pub mod server;
pub mod utils;

// Re-export the scheduler surface
pub use download::{
    DownloadConfig, DownloadJob, DownloadManager, DownloadRequest, DownloadStatus, HubTransfer,
    JobId,
};

pub use config::{ConfigError, Settings};
pub use local::LocalModelRegistry;
pub use server::Server;
pub use utils::{mask_sensitive, redact_secrets};

// Re-export error handling
pub use errors::{generate_reference_code, ApiResult, ErrorResponse, UserError};
