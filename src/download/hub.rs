// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hugging Face Hub snapshot transfer.
//!
//! Lists the files of a repository revision, then streams each one into the
//! destination directory, reporting cumulative bytes after every chunk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::error::TransferError;
use super::transfer::{FetchRequest, ProgressSink, Transfer};
use super::worker::snapshot_dir;

/// Default Hub endpoint.
pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";

/// Revision used when a request names none.
const DEFAULT_REVISION: &str = "main";

/// Timeout for establishing a connection (in seconds).
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Repository metadata returned by `/api/models/{id}/revision/{rev}`.
#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<RepoFile>,
}

#[derive(Debug, Deserialize)]
struct RepoFile {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Downloads model snapshots from a Hugging Face compatible Hub.
#[derive(Debug, Clone)]
pub struct HubTransfer {
    client: reqwest::Client,
    endpoint: String,
}

impl Default for HubTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl HubTransfer {
    /// Create a transfer against the public Hub.
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_HUB_URL)
    }

    /// Create a transfer against a mirror or a local test server.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("playground/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Endpoint URL with `segments` appended, each percent-encoded.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<reqwest::Url, TransferError> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| TransferError::Api(format!("Invalid Hub endpoint '{}': {}", self.endpoint, e)))?;
        url.path_segments_mut()
            .map_err(|_| TransferError::Api(format!("Invalid Hub endpoint '{}'", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn repo_info_url(&self, model_id: &str, revision: &str) -> Result<reqwest::Url, TransferError> {
        let mut url = self.url(
            ["api", "models"]
                .into_iter()
                .chain(model_id.split('/'))
                .chain(["revision", revision]),
        )?;
        url.set_query(Some("blobs=true"));
        Ok(url)
    }

    fn resolve_url(&self, model_id: &str, revision: &str, file: &str) -> Result<reqwest::Url, TransferError> {
        self.url(
            model_id
                .split('/')
                .chain(["resolve", revision])
                .chain(file.split('/')),
        )
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token {
            Some(token) if !token.is_empty() => builder.bearer_auth(token),
            _ => builder,
        }
    }

    async fn check_status(
        response: reqwest::Response,
        model_id: &str,
    ) -> Result<reqwest::Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status.as_u16() {
            401 | 403 => Err(TransferError::Unauthorized(model_id.to_string())),
            404 => Err(TransferError::NotFound(model_id.to_string())),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(TransferError::Api(format!("HTTP {} - {}", status, body.trim())))
            }
        }
    }

    async fn list_files(
        &self,
        model_id: &str,
        revision: &str,
        token: Option<&str>,
    ) -> Result<Vec<RepoFile>, TransferError> {
        let url = self.repo_info_url(model_id, revision)?;
        let response = self.authorized(self.client.get(url), token).send().await?;
        let info: RepoInfo = Self::check_status(response, model_id).await?.json().await?;
        Ok(info.siblings)
    }

    async fn download_file(
        &self,
        request: &FetchRequest,
        revision: &str,
        file: &RepoFile,
        target: &Path,
        downloaded: &mut u64,
        total: Option<u64>,
        progress: &ProgressSink,
    ) -> Result<(), TransferError> {
        let url = self.resolve_url(&request.model_id, revision, &file.rfilename)?;
        let response = self
            .authorized(self.client.get(url), request.token.as_deref())
            .send()
            .await?;
        let response = Self::check_status(response, &request.model_id).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| TransferError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let partial = target.with_extension(match target.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });
        let io_err = |source| TransferError::Io {
            path: partial.clone(),
            source,
        };

        let mut guard = PartialFile {
            path: partial.clone(),
            armed: true,
        };
        let mut out = tokio::fs::File::create(&partial).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await.map_err(io_err)?;
            *downloaded += chunk.len() as u64;
            progress.report(*downloaded, total);
        }
        out.flush().await.map_err(io_err)?;
        drop(out);

        tokio::fs::rename(&partial, target)
            .await
            .map_err(|source| TransferError::Io {
                path: target.to_path_buf(),
                source,
            })?;
        guard.armed = false;
        Ok(())
    }
}

/// Removes an unfinished `.part` file on error, or when the transfer is
/// aborted mid-stream.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove partial download");
                }
            }
        }
    }
}

/// Size of an existing file, if it matches the expected size.
async fn already_present(path: &Path, expected: Option<u64>) -> Option<u64> {
    let expected = expected?;
    let meta = tokio::fs::metadata(path).await.ok()?;
    (meta.is_file() && meta.len() == expected).then_some(expected)
}

#[async_trait]
impl Transfer for HubTransfer {
    async fn fetch(&self, request: FetchRequest, progress: ProgressSink) -> Result<PathBuf, TransferError> {
        let revision = request
            .revision
            .clone()
            .unwrap_or_else(|| DEFAULT_REVISION.to_string());

        let files = self
            .list_files(&request.model_id, &revision, request.token.as_deref())
            .await?;
        if files.is_empty() {
            return Err(TransferError::Api(format!(
                "Repository {}@{} has no files",
                request.model_id, revision
            )));
        }

        let total = files
            .iter()
            .map(|f| f.size)
            .sum::<Option<u64>>();
        tracing::debug!(
            job_id = %progress.job_id(),
            model_id = %request.model_id,
            files = files.len(),
            total_bytes = ?total,
            "Resolved snapshot file list"
        );

        let mut downloaded = 0u64;
        progress.report(downloaded, total);

        for file in &files {
            let target = snapshot_dir(&request.destination, &file.rfilename);
            if let Some(size) = already_present(&target, file.size).await {
                downloaded += size;
                progress.report(downloaded, total);
                continue;
            }
            self.download_file(&request, &revision, file, &target, &mut downloaded, total, &progress)
                .await?;
        }

        Ok(request.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trailing_slash() {
        let transfer = HubTransfer::with_endpoint("http://localhost:9000/");
        assert_eq!(transfer.endpoint(), "http://localhost:9000");
    }

    #[test]
    fn test_urls_are_percent_encoded() {
        let transfer = HubTransfer::with_endpoint("http://localhost:9000/");
        let url = transfer
            .resolve_url("org/model", "refs/pr/1", "docs/read me#1?.txt")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/org/model/resolve/refs%2Fpr%2F1/docs/read%20me%231%3F.txt"
        );

        let url = transfer.repo_info_url("org/model", "main").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/api/models/org/model/revision/main?blobs=true");
    }

    #[test]
    fn test_endpoint_with_base_path() {
        let transfer = HubTransfer::with_endpoint("https://mirror.example/hf");
        let url = transfer.resolve_url("org/model", "main", "config.json").unwrap();
        assert_eq!(url.as_str(), "https://mirror.example/hf/org/model/resolve/main/config.json");
    }

    #[test]
    fn test_repo_info_parsing() {
        let info: RepoInfo = serde_json::from_str(
            r#"{"id":"a/b","siblings":[{"rfilename":"config.json","size":12},{"rfilename":"model.safetensors"}]}"#,
        )
        .unwrap();
        assert_eq!(info.siblings.len(), 2);
        assert_eq!(info.siblings[0].size, Some(12));
        assert_eq!(info.siblings[1].size, None);
    }
}
