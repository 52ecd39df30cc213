// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background Download System
//!
//! Fetches model snapshots in the background with:
//! - A bounded number of concurrent transfers (1 to 4)
//! - Strict FIFO start order for queued jobs
//! - Byte-level progress reporting
//! - Cancellation of queued and in-flight downloads
//! - Optional activation of the model once it is on disk
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ commands ┌─────────────────┐
//! │ DownloadManager │─────────▶│ Coordinator     │
//! │ (handle)        │          │ JobStore + queue│
//! └─────────────────┘          └───┬─────────▲───┘
//!                          spawn   │         │ progress / outcome / exit
//!                                  ▼         │
//!                          ┌─────────────────┴───┐
//!                          │ Worker ──▶ Transfer │
//!                          │        ──▶ Activator│
//!                          └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use playground::download::{DownloadConfig, DownloadManager, DownloadRequest, HubTransfer};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::new(
//!     DownloadConfig::default(),
//!     Arc::new(HubTransfer::new()),
//!     None,
//! );
//!
//! let job = manager.submit(DownloadRequest::new("Qwen/Qwen2.5-0.5B-Instruct")).await?;
//! let latest = manager.get(&job.id).await?;
//! println!("{:?}", latest.map(|j| j.status));
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod error;
pub mod hub;
pub mod manager;
pub mod store;
pub mod transfer;
pub mod types;
mod worker;

// Re-export commonly used items
pub use activation::ModelActivator;
pub use error::{ActivationError, DownloadError, TransferError};
pub use hub::HubTransfer;
pub use manager::{DownloadCommand, DownloadConfig, DownloadManager, MAX_PARALLEL_DOWNLOADS};
pub use store::{JobStore, StatusCounts};
pub use transfer::{FetchRequest, ProgressSink, Transfer};
pub use types::{DownloadJob, DownloadRequest, DownloadStatus, JobId, JobOutcome};
pub use worker::snapshot_dir;
