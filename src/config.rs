// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Application configuration.
//!
//! Settings are resolved in three layers: built-in defaults, the JSON file
//! at `<config dir>/playground/config.json`, then environment variables.
//! CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::{DownloadConfig, MAX_PARALLEL_DOWNLOADS};
use crate::download::manager::DEFAULT_MAX_HISTORY;
use crate::download::hub::DEFAULT_HUB_URL;
use crate::local::LOCAL_PROVIDER;
use crate::utils::mask_sensitive;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Could not determine the configuration directory")]
    NoConfigDir,
}

/// Provider used for chat when a request names none.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenRouter,
    HuggingFace,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenRouter => "openrouter",
            Provider::HuggingFace => LOCAL_PROVIDER,
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openrouter" => Ok(Provider::OpenRouter),
            "huggingface" => Ok(Provider::HuggingFace),
            _ => Err("expected 'openrouter' or 'huggingface'".to_string()),
        }
    }
}

/// Device local inference runs on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
    Mps,
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda),
            "mps" => Ok(Device::Mps),
            _ => Err("expected 'cpu', 'cuda' or 'mps'".to_string()),
        }
    }
}

/// Resolved application settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP server binds to
    pub backend_host: String,
    /// Port the HTTP server listens on
    pub backend_port: u16,
    /// OpenRouter API key for remote chat
    pub openrouter_api_key: Option<String>,
    pub default_provider: Provider,
    /// Root directory for downloaded snapshots
    pub huggingface_download_path: PathBuf,
    /// Default Hub token used when a request carries none
    pub huggingface_token: Option<String>,
    /// Concurrently running downloads (1 to 4)
    pub huggingface_max_parallel_downloads: usize,
    pub huggingface_endpoint: String,
    /// Finished download jobs kept for listing
    pub max_job_history: usize,
    pub device: Device,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_host: "127.0.0.1".to_string(),
            backend_port: 8000,
            openrouter_api_key: None,
            default_provider: Provider::OpenRouter,
            huggingface_download_path: PathBuf::from("./models"),
            huggingface_token: None,
            huggingface_max_parallel_downloads: 1,
            huggingface_endpoint: DEFAULT_HUB_URL.to_string(),
            max_job_history: DEFAULT_MAX_HISTORY,
            device: Device::Cpu,
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let masked = |s: &Option<String>| s.as_deref().map(|v| mask_sensitive(v, 6));
        f.debug_struct("Settings")
            .field("backend_host", &self.backend_host)
            .field("backend_port", &self.backend_port)
            .field("openrouter_api_key", &masked(&self.openrouter_api_key))
            .field("default_provider", &self.default_provider)
            .field("huggingface_download_path", &self.huggingface_download_path)
            .field("huggingface_token", &masked(&self.huggingface_token))
            .field("huggingface_max_parallel_downloads", &self.huggingface_max_parallel_downloads)
            .field("huggingface_endpoint", &self.huggingface_endpoint)
            .field("max_job_history", &self.max_job_history)
            .field("device", &self.device)
            .finish()
    }
}

/// Directory holding `config.json`.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("playground"))
        .ok_or(ConfigError::NoConfigDir)
}

impl Settings {
    /// Load defaults, the config file (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_dir()?.join("config.json");
        let settings = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        settings.with_env(|key| std::env::var(key).ok())
    }

    /// Read settings from a JSON file; missing keys take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply environment overrides using `lookup`, then validate.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BACKEND_HOST") {
            self.backend_host = v;
        }
        if let Some(v) = get("BACKEND_PORT") {
            self.backend_port = parse("BACKEND_PORT", &v)?;
        }
        if let Some(v) = get("OPENROUTER_API_KEY") {
            self.openrouter_api_key = Some(v);
        }
        if let Some(v) = get("DEFAULT_PROVIDER") {
            self.default_provider = parse("DEFAULT_PROVIDER", &v)?;
        }
        if let Some(v) = get("HUGGINGFACE_DOWNLOAD_PATH") {
            self.huggingface_download_path = PathBuf::from(v);
        }
        if let Some(v) = get("HUGGINGFACE_TOKEN") {
            self.huggingface_token = Some(v);
        }
        if let Some(v) = get("HUGGINGFACE_MAX_PARALLEL_DOWNLOADS") {
            self.huggingface_max_parallel_downloads = parse("HUGGINGFACE_MAX_PARALLEL_DOWNLOADS", &v)?;
        }
        if let Some(v) = get("HUGGINGFACE_ENDPOINT") {
            self.huggingface_endpoint = v;
        }
        if let Some(v) = get("MAX_JOB_HISTORY") {
            self.max_job_history = parse("MAX_JOB_HISTORY", &v)?;
        }
        if let Some(v) = get("DEVICE") {
            self.device = parse("DEVICE", &v)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parallel = self.huggingface_max_parallel_downloads;
        if !(1..=MAX_PARALLEL_DOWNLOADS).contains(&parallel) {
            return Err(ConfigError::InvalidValue {
                key: "huggingface_max_parallel_downloads",
                value: parallel.to_string(),
                reason: format!("must be between 1 and {}", MAX_PARALLEL_DOWNLOADS),
            });
        }
        if self.max_job_history == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_job_history",
                value: "0".to_string(),
                reason: "must keep at least one finished job".to_string(),
            });
        }
        if self.backend_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "backend_port",
                value: "0".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Scheduler configuration derived from these settings.
    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_parallel: self.huggingface_max_parallel_downloads,
            download_root: self.huggingface_download_path.clone(),
            default_token: self.huggingface_token.clone(),
            max_history: self.max_job_history,
            provider_id: LOCAL_PROVIDER.to_string(),
        }
    }

    /// Settings as JSON with secrets masked, for display.
    pub fn to_masked_json(&self) -> serde_json::Value {
        let mut shown = self.clone();
        shown.openrouter_api_key = shown.openrouter_api_key.map(|k| mask_sensitive(&k, 6));
        shown.huggingface_token = shown.huggingface_token.map(|t| mask_sensitive(&t, 6));
        serde_json::to_value(shown).unwrap_or(serde_json::Value::Null)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
