// Model provider collaborators.
//
// The core only needs `generate(prompt, params, timeout)`. Concrete clients
// (HTTP endpoint, local command, in-process function) plug in behind
// `ProviderClient`, and `ProviderRouter` picks one per request.

mod blocking;
mod http;

pub use blocking::{BlockingPool, BlockingProvider, CommandProvider};
pub use http::HttpProvider;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Tool on whose behalf the call is made.
    pub tool: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Named provider to route to; `None` selects the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl GenerateRequest {
    pub fn new(tool: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            prompt: prompt.into(),
            model: None,
            temperature: None,
            provider: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no provider configured{}", named_suffix(.0))]
    NotConfigured(Option<String>),

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider response was malformed: {0}")]
    Malformed(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider worker failed: {0}")]
    Worker(String),
}

fn named_suffix(name: &Option<String>) -> String {
    name.as_deref().map(|name| format!(" named `{name}`")).unwrap_or_default()
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the model's text for `request`, giving up after `timeout`.
    async fn generate(
        &self,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError>;
}

/// Routes on `GenerateRequest::provider`, falling back to the default.
#[derive(Default, Clone)]
pub struct ProviderRouter {
    default: Option<Arc<dyn ProviderClient>>,
    named: BTreeMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own name. The first one registered
    /// becomes the default.
    pub fn with_provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        if self.default.is_none() {
            self.default = Some(Arc::clone(&provider));
        }
        self.named.insert(provider.name().to_string(), provider);
        self
    }

    pub fn with_default(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.named.insert(provider.name().to_string(), Arc::clone(&provider));
        self.default = Some(provider);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.named.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }

    fn select(&self, requested: Option<&str>) -> Result<&Arc<dyn ProviderClient>, ProviderError> {
        match requested {
            Some(name) => self
                .named
                .get(name)
                .ok_or_else(|| ProviderError::NotConfigured(Some(name.to_string()))),
            None => self.default.as_ref().ok_or(ProviderError::NotConfigured(None)),
        }
    }
}

#[async_trait]
impl ProviderClient for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let provider = self.select(request.provider.as_deref())?;
        tracing::debug!(provider = provider.name(), tool = %request.tool, "routing provider call");
        provider.generate(request, timeout).await
    }
}
