pub mod advisory;
mod http;
mod ollama;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use thiserror::Error;

use waypoint_config::AdvisoryConfig;

pub use advisory::{
    AdvisoryRequest, AdvisoryResponse, AdvisoryResult, CategoryCounts, DetectedPattern, Urgency,
    parse_advisory_response,
};
pub use http::HttpAdvisor;
pub use ollama::OllamaAdvisor;

#[derive(Debug, Error)]
pub enum AdvisoryError {
    /// Connection refused, DNS failure, non-success status, ...
    #[error("advisory transport failed: {0}")]
    Transport(String),
    /// The service answered but the body could not be validated.
    #[error("advisory response malformed: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for AdvisoryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// A request/response advisory collaborator.
///
/// Implementations do not enforce the decision deadline themselves; the
/// caller wraps [`AdvisoryService::advise`] in a timeout and abandons the
/// future when it elapses.
#[async_trait]
pub trait AdvisoryService: Send + Sync {
    fn name(&self) -> &str;

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError>;

    /// Cheap reachability check used for health reporting.
    async fn ping(&self) -> bool;
}

/// Build the configured advisory service.  Returns `Ok(None)` when the
/// provider is `disabled`.
pub fn build_advisory_service(config: &AdvisoryConfig) -> Result<Option<Arc<dyn AdvisoryService>>> {
    if config.is_disabled() {
        return Ok(None);
    }

    // The per-call deadline is enforced by the caller; the client timeout is
    // a backstop so abandoned connections do not linger.
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs.max(1) * 2))
        .build()?;

    let service: Arc<dyn AdvisoryService> = match config.provider.to_ascii_lowercase().as_str() {
        "ollama" => Arc::new(OllamaAdvisor::new(client, &config.base_url, &config.model)),
        "http" => Arc::new(HttpAdvisor::new(client, &config.base_url)),
        other => bail!("unknown advisory provider '{other}' (expected ollama, http or disabled)"),
    };
    Ok(Some(service))
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract the first valid JSON object from a model reply.
///
/// Looks for a fenced ` ```json ` block first, then falls back to the span
/// between the first `{` and the last `}`.  Returns `None` when neither
/// parses.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after_fence.find("```") {
            let json_str = after_fence[..fence_end].trim();
            if let Ok(val) = serde_json::from_str(json_str) {
                return Some(val);
            }
        }
    }

    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

// ── Tests ────────────────────────────────────────────────────────────────────
