// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local model registry.
//!
//! Tracks which downloaded snapshots have been activated for local serving.
//! This is the activation collaborator used by the download scheduler's
//! post-completion hook.
//!
//! # Example
//!
//! ```no_run
//! use playground::local::LocalModelRegistry;
//! use playground::download::ModelActivator;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = LocalModelRegistry::new("./models");
//! registry.activate("huggingface", "Qwen/Qwen2.5-0.5B-Instruct", None, None).await?;
//! println!("{} model(s) loaded", registry.loaded().len());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::download::{snapshot_dir, ActivationError, ModelActivator};

/// Provider id for models served from the local download directory.
pub const LOCAL_PROVIDER: &str = "huggingface";

/// Files that mark a directory as a usable model snapshot.
const MODEL_MARKERS: &[&str] = &[
    "config.json",
    "model.safetensors",
    "model.safetensors.index.json",
    "pytorch_model.bin",
];

/// A model activated for serving.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadedModel {
    pub model_id: String,
    pub revision: Option<String>,
    pub quantization: Option<String>,
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

/// Registry of locally activated models.
#[derive(Debug)]
pub struct LocalModelRegistry {
    root: PathBuf,
    loaded: RwLock<Vec<LoadedModel>>,
}

impl LocalModelRegistry {
    /// Create a registry over the download root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: RwLock::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of activated models, most recent first.
    pub fn loaded(&self) -> Vec<LoadedModel> {
        let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
        loaded.iter().rev().cloned().collect()
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
        loaded.iter().any(|m| m.model_id == model_id)
    }

    fn has_model_files(dir: &Path) -> bool {
        MODEL_MARKERS.iter().any(|marker| dir.join(marker).is_file())
    }
}

#[async_trait]
impl ModelActivator for LocalModelRegistry {
    async fn activate(
        &self,
        provider_id: &str,
        model_id: &str,
        revision: Option<&str>,
        quantization: Option<&str>,
    ) -> Result<(), ActivationError> {
        if provider_id != LOCAL_PROVIDER {
            return Err(ActivationError::UnknownProvider(provider_id.to_string()));
        }

        let dir = snapshot_dir(&self.root, model_id);
        let check_dir = dir.clone();
        let present = tokio::task::spawn_blocking(move || Self::has_model_files(&check_dir))
            .await
            .map_err(|e| ActivationError::Other(e.to_string()))?;
        if !present {
            return Err(ActivationError::MissingFiles(dir.display().to_string()));
        }

        let model = LoadedModel {
            model_id: model_id.to_string(),
            revision: revision.map(str::to_string),
            quantization: quantization.map(str::to_string),
            path: dir,
            loaded_at: Utc::now(),
        };

        let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
        loaded.retain(|m| m.model_id != model.model_id);
        loaded.push(model);

        tracing::info!(model_id, revision = ?revision, "Model activated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_activate_registers_model() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("org").join("tiny");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), "{}").unwrap();

        let registry = LocalModelRegistry::new(tmp.path());
        registry
            .activate(LOCAL_PROVIDER, "org/tiny", Some("main"), Some("q4"))
            .await
            .unwrap();

        assert!(registry.is_loaded("org/tiny"));
        let loaded = registry.loaded();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].quantization.as_deref(), Some("q4"));
        assert_eq!(loaded[0].path, dir);
    }

    #[tokio::test]
    async fn test_activate_twice_keeps_one_entry() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tiny");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.safetensors"), b"weights").unwrap();

        let registry = LocalModelRegistry::new(tmp.path());
        registry.activate(LOCAL_PROVIDER, "tiny", None, None).await.unwrap();
        registry.activate(LOCAL_PROVIDER, "tiny", Some("v2"), None).await.unwrap();

        let loaded = registry.loaded();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].revision.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_activate_missing_files() {
        let tmp = TempDir::new().unwrap();
        let registry = LocalModelRegistry::new(tmp.path());
        let err = registry
            .activate(LOCAL_PROVIDER, "org/absent", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::MissingFiles(_)));
        assert!(registry.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_activate_unknown_provider() {
        let registry = LocalModelRegistry::new("./models");
        let err = registry
            .activate("openrouter", "anthropic/claude-3-haiku", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::UnknownProvider(_)));
    }
}
