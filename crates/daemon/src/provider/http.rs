// HTTP provider: POSTs a neutral JSON envelope and reads `{"content": str}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{GenerateRequest, ProviderClient, ProviderError};

const MAX_ERROR_BODY_CHARS: usize = 512;

pub struct HttpProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    content: String,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::with_client(name, endpoint, reqwest::Client::new())
    }

    /// Create a provider with a shared HTTP client.
    pub fn with_client(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self { name: name.into(), endpoint: endpoint.into(), api_key: None, client }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn build_headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|error| ProviderError::Request(format!("invalid api key: {error}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(provider = %self.name, tool = %request.tool))]
    async fn generate(
        &self,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "prompt": request.prompt,
            "model": request.model,
            "temperature": request.temperature,
            "tool": request.tool,
        });
        debug!(prompt_chars = request.prompt.len(), "sending provider request");

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.build_headers()?)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Request(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Malformed(error.to_string()))?;
        Ok(parsed.content)
    }
}
