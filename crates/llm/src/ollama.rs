use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{AdvisoryError, AdvisoryRequest, AdvisoryResponse, AdvisoryService, parse_advisory_response};

/// Advisory backed by a local Ollama model.  The request summary is rendered
/// into a prompt and the model is asked for a JSON verdict.
#[derive(Debug, Clone)]
pub struct OllamaAdvisor {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaAdvisor {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

pub(crate) fn render_prompt(request: &AdvisoryRequest) -> String {
    let counts = &request.counts;
    let critical = if request.critical_paths.is_empty() {
        "none".to_string()
    } else {
        request.critical_paths.join(", ")
    };
    let recent = if request.recent_messages.is_empty() {
        "none yet".to_string()
    } else {
        request
            .recent_messages
            .iter()
            .map(|message| format!("- {message}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You decide whether uncommitted work in a git repository has reached a \
         meaningful checkpoint.  A deterministic rule already flagged a possible \
         boundary: {reason}.\n\
         Respond only with valid JSON:\n\
         {{\"should_commit\":true|false,\"confidence\":0.0-1.0,\
         \"detected_pattern\":\"feature\"|\"fix\"|\"test\"|\"docs\"|\"refactor\"|\"chore\"|\"unknown\",\
         \"suggested_message\":\"<type>: <summary, at most 72 chars>\",\
         \"urgency\":\"low\"|\"normal\"|\"high\"}}\n\n\
         BRANCH: {branch}\n\
         MINUTES_SINCE_LAST_CHECKPOINT: {minutes}\n\
         CHANGED_FILES: source={source} test={test} config={config} doc={doc} \
         critical={critical_count} other={other}\n\
         LINES_CHANGED: {lines}\n\
         CRITICAL_FILES: {critical}\n\
         RECENT_CHECKPOINTS:\n{recent}",
        reason = request.trigger_reason,
        branch = request.branch,
        minutes = request.elapsed_secs / 60,
        source = counts.source,
        test = counts.test,
        config = counts.config,
        doc = counts.doc,
        critical_count = counts.critical,
        other = counts.other,
        lines = request.lines_changed,
    )
}

#[async_trait]
impl AdvisoryService for OllamaAdvisor {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let payload = json!({
            "model": self.model,
            "prompt": render_prompt(request),
            "stream": false,
            "format": "json",
        });

        let response = self.client.post(endpoint).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdvisoryError::Transport(format!("ollama returned {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| AdvisoryError::Malformed(err.to_string()))?;
        let text = body
            .get("response")
            .and_then(|value| value.as_str())
            .ok_or_else(|| AdvisoryError::Malformed("ollama body has no `response`".to_string()))?;
        debug!(chars = text.len(), "ollama advisory reply received");

        parse_advisory_response(text).map_err(AdvisoryError::Malformed)
    }

    async fn ping(&self) -> bool {
        let endpoint = format!("{}/api/tags", self.base_url);
        self.client
            .get(endpoint)
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }
}
