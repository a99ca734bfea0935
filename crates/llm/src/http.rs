use async_trait::async_trait;

use crate::{AdvisoryError, AdvisoryRequest, AdvisoryResponse, AdvisoryService, parse_advisory_response};

/// Advisory reached over a plain JSON endpoint: `POST {base}/advise` with the
/// serialized [`AdvisoryRequest`], answered by an advisory JSON object.
#[derive(Debug, Clone)]
pub struct HttpAdvisor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAdvisor {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AdvisoryService for HttpAdvisor {
    fn name(&self) -> &str {
        "http"
    }

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError> {
        let response = self
            .client
            .post(format!("{}/advise", self.base_url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdvisoryError::Transport(format!("advisory endpoint returned {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|err| AdvisoryError::Malformed(err.to_string()))?;
        parse_advisory_response(&body).map_err(AdvisoryError::Malformed)
    }

    async fn ping(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }
}
