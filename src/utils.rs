// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Utility functions for secret handling.

use regex::Regex;
use std::sync::LazyLock;

/// Redaction patterns for credentials that can end up in error text.
static REDACTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"hf_[a-zA-Z0-9]{20,}").expect("Hugging Face token regex is valid"), "[REDACTED_HF_TOKEN]"),
        (Regex::new(r"sk-or-[a-zA-Z0-9-]{20,}").expect("OpenRouter key regex is valid"), "[REDACTED_API_KEY]"),
        (Regex::new(r"sk-[a-zA-Z0-9]{20,}").expect("OpenAI key regex is valid"), "[REDACTED_API_KEY]"),
        (Regex::new(r"Bearer [a-zA-Z0-9-._~+/]+=*").expect("Bearer token regex is valid"), "Bearer [REDACTED]"),
        (Regex::new(r"([?&](?:token|access_token)=)[^&\s]+").expect("Query token regex is valid"), "${1}[REDACTED]"),
    ]
});

/// Redact secrets from text before it is logged or stored on a job.
pub fn redact_secrets(text: &str) -> String {
    let mut result = text.to_string();
    for (pattern, replacement) in REDACTION_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

/// Mask a sensitive string, showing only the first few characters.
///
/// # Example
///
/// ```
/// use playground::utils::mask_sensitive;
///
/// let token = "hf_abcdefghijklmnopqrstuvwxyz123456";
/// assert_eq!(mask_sensitive(token, 6), "hf_abc...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    // Short secrets would be shown in full
    if input.chars().count() <= visible_prefix {
        return "***".to_string();
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}
