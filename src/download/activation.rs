// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Post-completion hook: activate a freshly downloaded model.

use async_trait::async_trait;

use super::error::ActivationError;

/// Makes a downloaded model available for serving.
#[async_trait]
pub trait ModelActivator: Send + Sync {
    async fn activate(
        &self,
        provider_id: &str,
        model_id: &str,
        revision: Option<&str>,
        quantization: Option<&str>,
    ) -> Result<(), ActivationError>;
}

/// Message recorded when activation succeeds.
pub const LOADED: &str = "Model downloaded and loaded successfully.";

/// Message recorded when the download worked but activation did not.
pub fn degraded_message(error: &ActivationError) -> String {
    format!("Downloaded but failed to load automatically: {}", error)
}
