// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared test doubles for the download scheduler.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, Notify};

use playground::download::{
    ActivationError, DownloadConfig, DownloadJob, DownloadManager, DownloadStatus, FetchRequest,
    JobId, ModelActivator, ProgressSink, Transfer, TransferError,
};

/// How long helpers wait for the scheduler before failing a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// One invocation of [`ScriptedTransfer::fetch`], held by the test until it
/// decides how the transfer ends.
pub struct FetchCall {
    pub request: FetchRequest,
    pub progress: ProgressSink,
    finish: oneshot::Sender<Result<PathBuf, TransferError>>,
}

impl FetchCall {
    pub fn succeed(self) {
        let destination = self.request.destination.clone();
        let _ = self.finish.send(Ok(destination));
    }

    pub fn fail(self, message: &str) {
        let _ = self.finish.send(Err(TransferError::Other(message.to_string())));
    }
}

/// Transfer whose every call blocks until the test resolves it.
pub struct ScriptedTransfer {
    calls: mpsc::UnboundedSender<FetchCall>,
    started: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransfer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FetchCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let transfer = Arc::new(Self {
            calls,
            started: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        });
        (transfer, rx)
    }

    /// Number of fetch calls made so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Fetch futures currently alive (dropped futures are not counted).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transfer for ScriptedTransfer {
    async fn fetch(&self, request: FetchRequest, progress: ProgressSink) -> Result<PathBuf, TransferError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        let (finish, result) = oneshot::channel();
        self.calls
            .send(FetchCall {
                request,
                progress,
                finish,
            })
            .map_err(|_| TransferError::Other("test harness gone".to_string()))?;

        result
            .await
            .unwrap_or_else(|_| Err(TransferError::Other("call dropped by test".to_string())))
    }
}

/// Transfer that panics as soon as it is called.
pub struct PanickingTransfer;

#[async_trait]
impl Transfer for PanickingTransfer {
    async fn fetch(&self, _request: FetchRequest, _progress: ProgressSink) -> Result<PathBuf, TransferError> {
        panic!("disk controller on fire");
    }
}

/// Transfer that cancels its own job through the manager, then reports
/// success: the cancel lands after the bytes are in but before the
/// outcome reaches the coordinator.
#[derive(Default)]
pub struct CancelOnFinishTransfer {
    manager: OnceLock<DownloadManager>,
}

impl CancelOnFinishTransfer {
    pub fn attach(&self, manager: DownloadManager) {
        let _ = self.manager.set(manager);
    }
}

#[async_trait]
impl Transfer for CancelOnFinishTransfer {
    async fn fetch(&self, request: FetchRequest, progress: ProgressSink) -> Result<PathBuf, TransferError> {
        let manager = self
            .manager
            .get()
            .cloned()
            .ok_or_else(|| TransferError::Other("manager not attached".to_string()))?;
        progress.report(10, Some(10));
        manager
            .cancel(progress.job_id())
            .await
            .map_err(|e| TransferError::Other(e.to_string()))?;
        Ok(request.destination)
    }
}

/// Activator that never finishes; `started` fires once it is entered.
#[derive(Default)]
pub struct StallingActivator {
    pub started: Notify,
}

#[async_trait]
impl ModelActivator for StallingActivator {
    async fn activate(
        &self,
        _provider_id: &str,
        _model_id: &str,
        _revision: Option<&str>,
        _quantization: Option<&str>,
    ) -> Result<(), ActivationError> {
        self.started.notify_one();
        std::future::pending().await
    }
}

/// Activator that records calls and succeeds or fails on demand.
#[derive(Default)]
pub struct RecordingActivator {
    pub fail_with: Option<String>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl RecordingActivator {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelActivator for RecordingActivator {
    async fn activate(
        &self,
        provider_id: &str,
        model_id: &str,
        _revision: Option<&str>,
        _quantization: Option<&str>,
    ) -> Result<(), ActivationError> {
        self.calls
            .lock()
            .unwrap()
            .push((provider_id.to_string(), model_id.to_string()));
        match &self.fail_with {
            Some(message) => Err(ActivationError::Other(message.clone())),
            None => Ok(()),
        }
    }
}

/// Scheduler config writing under a temporary directory.
pub fn config(tmp: &TempDir, max_parallel: usize) -> DownloadConfig {
    DownloadConfig {
        max_parallel,
        download_root: tmp.path().to_path_buf(),
        ..DownloadConfig::default()
    }
}

/// Receive the next fetch call, failing the test if none arrives.
pub async fn next_call(calls: &mut mpsc::UnboundedReceiver<FetchCall>) -> FetchCall {
    tokio::time::timeout(WAIT, calls.recv())
        .await
        .expect("timed out waiting for a transfer to start")
        .expect("transfer channel closed")
}

/// Poll until `id` satisfies `check`, returning the matching snapshot.
pub async fn wait_until(
    manager: &DownloadManager,
    id: &JobId,
    check: impl Fn(&DownloadJob) -> bool,
) -> DownloadJob {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let job = manager.get(id).await.unwrap().expect("job should exist");
        if check(&job) {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting on job {}: last seen {:?}", id, job.status);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(manager: &DownloadManager, id: &JobId, status: DownloadStatus) -> DownloadJob {
    wait_until(manager, id, |job| job.status == status).await
}
