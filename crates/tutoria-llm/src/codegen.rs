use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use tutoria_core::{CodeGenerator, GenerationError};

#[derive(Serialize)]
struct GenerateRequest<'a> {
    workspace: &'a serde_json::Value,
    language: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    code: String,
}

/// Code generator behind an HTTP endpoint:
/// `POST {"workspace", "language"}` returns `{"code": "..."}`.
pub struct HttpCodeGenerator {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpCodeGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    #[instrument(skip(self, workspace))]
    async fn generate(
        &self,
        workspace: &serde_json::Value,
        language: &str,
    ) -> Result<String, GenerationError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&GenerateRequest { workspace, language })
            .send()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        debug!(bytes = parsed.code.len(), "source generated");
        Ok(parsed.code)
    }
}

/// Stand-in used when no generator endpoint is configured.
pub struct UnconfiguredCodeGenerator;

#[async_trait]
impl CodeGenerator for UnconfiguredCodeGenerator {
    async fn generate(
        &self,
        _workspace: &serde_json::Value,
        _language: &str,
    ) -> Result<String, GenerationError> {
        Err(GenerationError::Network("no code generator endpoint configured".into()))
    }
}
