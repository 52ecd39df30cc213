//! API server
//!
//! Exposes the download scheduler over HTTP.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with download counts
//! - `GET /api/huggingface/downloads` - List download jobs, newest first
//! - `POST /api/huggingface/downloads` - Queue a model download (202)
//! - `GET /api/huggingface/downloads/:id` - One download job
//! - `DELETE /api/huggingface/downloads/:id` - Cancel a download job
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use playground::download::{DownloadConfig, DownloadManager, HubTransfer};
//! use playground::local::LocalModelRegistry;
//! use playground::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Arc::new(LocalModelRegistry::new("./models"));
//! let manager = DownloadManager::new(
//!     DownloadConfig::default(),
//!     Arc::new(HubTransfer::new()),
//!     Some(registry.clone()),
//! );
//! Server::new(8000, manager, registry).start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use crate::config::Provider;
use crate::download::{DownloadJob, DownloadManager, DownloadRequest, JobId};
use crate::errors::{ApiResult, UserError};
use crate::local::{LoadedModel, LocalModelRegistry};

// Maximum request body size (1MB)
const MAX_BODY_SIZE: usize = 1024 * 1024;
// Maximum accepted model id length
const MAX_MODEL_ID_LENGTH: usize = 256;
// Default per-request timeout (in seconds)
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Server state shared across handlers.
pub struct AppState {
    /// Background download scheduler.
    pub manager: DownloadManager,
    /// Models activated after download.
    pub registry: Arc<LocalModelRegistry>,
    /// Default chat provider, reported on `/health`.
    pub default_provider: Provider,
}

/// API server configuration.
pub struct Server {
    /// Port to listen on.
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
    /// Per-request timeout.
    request_timeout: Duration,
    default_provider: Provider,
    manager: DownloadManager,
    registry: Arc<LocalModelRegistry>,
}

impl Server {
    /// Create a new server with the specified port.
    /// By default, binds to 127.0.0.1 (localhost only) for security.
    pub fn new(port: u16, manager: DownloadManager, registry: Arc<LocalModelRegistry>) -> Self {
        Self {
            port,
            bind_address: "127.0.0.1".to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            default_provider: Provider::OpenRouter,
            manager,
            registry,
        }
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the provider reported on `/health`.
    pub fn with_default_provider(mut self, provider: Provider) -> Self {
        self.default_provider = provider;
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        let state = Arc::new(AppState {
            manager: self.manager.clone(),
            registry: self.registry.clone(),
            default_provider: self.default_provider,
        });
        router(state, self.request_timeout)
    }

    /// Start the server with graceful shutdown.
    ///
    /// Once the listener stops, running downloads are cancelled and their
    /// workers awaited.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    Another playground server may be running; stop it or pass --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.manager.shutdown().await?;
        tracing::info!("Cleanup complete, server stopped");

        Ok(())
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Router over shared state; used by [`Server`] and by tests.
pub fn router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/huggingface/downloads",
            get(list_downloads_handler).post(create_download_handler),
        )
        .route(
            "/api/huggingface/downloads/:id",
            get(get_download_handler).delete(cancel_download_handler),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(request_timeout))
                .layer(DefaultBodyLimit::max(MAX_BODY_SIZE)),
        )
        .with_state(state)
}

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    default_provider: &'static str,
    active_downloads: usize,
    queued_downloads: usize,
    loaded_models: Vec<LoadedModel>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler.
///
/// Reports "degraded" when the download coordinator is no longer running.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, counts) = match state.manager.stats().await {
        Ok(counts) => ("ok", counts),
        Err(_) => ("degraded", Default::default()),
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        default_provider: state.default_provider.as_str(),
        active_downloads: counts.running,
        queued_downloads: counts.queued,
        loaded_models: state.registry.loaded(),
    })
}

async fn list_downloads_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<DownloadJob>>> {
    Ok(Json(state.manager.list().await?))
}

/// Queue a download. Returns 202 with the job as created.
async fn create_download_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DownloadJob>)> {
    let Json(mut request) = payload.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            UserError::payload_too_large(MAX_BODY_SIZE as u64)
        } else {
            UserError::invalid_request(
                "Request body must be JSON with a model_id field.",
                None,
                Some(&rejection.body_text()),
            )
        }
    })?;

    let model_id = request.model_id.trim();
    if model_id.is_empty() {
        return Err(UserError::invalid_request(
            "model_id must not be empty.",
            Some("model_id"),
            None,
        ));
    }
    if model_id.len() > MAX_MODEL_ID_LENGTH {
        return Err(UserError::invalid_request(
            &format!("model_id is too long (max: {} characters).", MAX_MODEL_ID_LENGTH),
            Some("model_id"),
            None,
        ));
    }
    request.model_id = model_id.to_string();

    let job = state.manager.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_download_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadJob>> {
    let id = JobId::from(id);
    match state.manager.get(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(UserError::not_found("download job")),
    }
}

/// Cancel a download. Finished jobs are returned unchanged.
async fn cancel_download_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadJob>> {
    let id = JobId::from(id);
    match state.manager.cancel(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(UserError::not_found("download job")),
    }
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM (Ctrl+C on non-Unix platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to install signal handlers: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
