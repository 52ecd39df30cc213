// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API tests driven through the router without a socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use common::{config, next_call, wait_for_status, ScriptedTransfer};
use playground::config::Provider;
use playground::download::{DownloadManager, DownloadStatus, JobId};
use playground::local::LocalModelRegistry;
use playground::server::{router, AppState};

struct Harness {
    app: Router,
    manager: DownloadManager,
    calls: tokio::sync::mpsc::UnboundedReceiver<common::FetchCall>,
    _tmp: TempDir,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let (transfer, calls) = ScriptedTransfer::new();
    let manager = DownloadManager::new(config(&tmp, 1), transfer, None);
    let state = Arc::new(AppState {
        manager: manager.clone(),
        registry: Arc::new(LocalModelRegistry::new(tmp.path())),
        default_provider: Provider::HuggingFace,
    });
    Harness {
        app: router(state, Duration::from_secs(5)),
        manager,
        calls,
        _tmp: tmp,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_reports_download_counts() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    send(&h.app, Method::POST, "/api/huggingface/downloads", Some(json!({"model_id": "a/one"}))).await;
    send(&h.app, Method::POST, "/api/huggingface/downloads", Some(json!({"model_id": "a/two"}))).await;

    let (status, body) = send(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["default_provider"], "huggingface");
    assert_eq!(body["active_downloads"], 1);
    assert_eq!(body["queued_downloads"], 1);
    assert!(body["loaded_models"].as_array().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_create_download_returns_accepted() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Method::POST,
        "/api/huggingface/downloads",
        Some(json!({"model_id": "  org/model  ", "revision": "v1", "token": "hf_secret_value_123456789"})),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["model_id"], "org/model");
    assert_eq!(body["revision"], "v1");
    assert_eq!(body["status"], "queued");
    assert_eq!(body["auto_load"], true);
    assert!(body["id"].as_str().unwrap().starts_with("hfjob-"));
    assert!(body.get("token").is_none(), "token must never be echoed");
    Ok(())
}

#[tokio::test]
async fn test_create_download_rejects_empty_model_id() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Method::POST,
        "/api/huggingface/downloads",
        Some(json!({"model_id": "   "})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
    assert_eq!(body["error"]["error_type"], "invalid_request");
    assert_eq!(body["error"]["field"], "model_id");
    assert!(body["error"]["reference"].as_str().unwrap().starts_with("ERR-"));
    assert!(h.manager.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_create_download_rejects_malformed_body() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Method::POST,
        "/api/huggingface/downloads",
        Some(json!({"revision": "main"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["error_type"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn test_get_and_list_downloads() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (_, first) = send(&h.app, Method::POST, "/api/huggingface/downloads", Some(json!({"model_id": "a/one"}))).await;
    let (_, second) = send(&h.app, Method::POST, "/api/huggingface/downloads", Some(json!({"model_id": "a/two"}))).await;

    let (status, list) = send(&h.app, Method::GET, "/api/huggingface/downloads", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|job| job["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![second["id"].as_str().unwrap(), first["id"].as_str().unwrap()]);

    let uri = format!("/api/huggingface/downloads/{}", first["id"].as_str().unwrap());
    let (status, job) = send(&h.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "running");
    Ok(())
}

#[tokio::test]
async fn test_unknown_job_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (status, body) = send(&h.app, Method::GET, "/api/huggingface/downloads/hfjob-nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["error_type"], "not_found");

    let (status, _) = send(&h.app, Method::DELETE, "/api/huggingface/downloads/hfjob-nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_delete_cancels_and_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (_, job) = send(&h.app, Method::POST, "/api/huggingface/downloads", Some(json!({"model_id": "a/one"}))).await;
    let id = job["id"].as_str().unwrap().to_string();
    let _call = next_call(&mut h.calls).await;

    let uri = format!("/api/huggingface/downloads/{}", id);
    let (status, body) = send(&h.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    wait_for_status(&h.manager, &JobId::from(id.as_str()), DownloadStatus::Cancelled).await;
    let (status, body) = send(&h.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    Ok(())
}

#[tokio::test]
async fn test_completed_job_progress_serialized() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (_, job) = send(
        &h.app,
        Method::POST,
        "/api/huggingface/downloads",
        Some(json!({"model_id": "a/one", "auto_load": false})),
    )
    .await;
    let id = JobId::from(job["id"].as_str().unwrap());

    let call = next_call(&mut h.calls).await;
    call.progress.report(1, Some(3));
    let uri = format!("/api/huggingface/downloads/{}", id);
    let (_, running) = send(&h.app, Method::GET, &uri, None).await;
    assert_eq!(running["progress"], 0.3333);

    call.succeed();
    wait_for_status(&h.manager, &id, DownloadStatus::Completed).await;
    let (_, done) = send(&h.app, Method::GET, &uri, None).await;
    assert_eq!(done["progress"], 1.0);
    assert_eq!(done["status"], "completed");
    assert!(done["completed_at"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_health_degraded_after_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.manager.shutdown().await?;

    let (status, body) = send(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");

    let (status, body) = send(&h.app, Method::GET, "/api/huggingface/downloads", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["error_type"], "service_unavailable");
    Ok(())
}
