mod anthropic;
mod azure;
mod gemini;
mod http;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use core_types::{
    ChatCompletionRequest, ChatRole, GatewayError, GatewayResult, ModelDescriptor,
    ProviderAdapter, ProviderConfig, ProviderIdentity, ProviderKind,
};
use reqwest::Url;

pub use anthropic::AnthropicAdapter;
pub use azure::AzureOpenAiAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/// Per-adapter settings resolved from a [`ProviderConfig`] plus its credential.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
    pub api_version: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub models: Vec<ModelDescriptor>,
    pub timeout: Duration,
}

impl AdapterSettings {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            default_model: None,
            api_version: None,
            extra_headers: Vec::new(),
            models: Vec::new(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn from_config(config: &ProviderConfig, api_key: Option<String>) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            api_key,
            default_model: config.default_model.clone(),
            api_version: config.api_version.clone(),
            extra_headers: config.extra_headers.clone(),
            models: config.models.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_models(mut self, models: Vec<ModelDescriptor>) -> Self {
        self.models = models;
        self
    }

    /// Appends `segments` to the base URL one path segment at a time, so
    /// reserved characters inside a segment are percent-encoded and cannot
    /// escape it.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> GatewayResult<Url> {
        let invalid_base = |reason: String| {
            GatewayError::InvalidConfiguration(format!(
                "provider `{}` has an invalid base_url `{}`: {reason}",
                self.name, self.base_url
            ))
        };

        let mut url =
            Url::parse(self.base_url.trim()).map_err(|err| invalid_base(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid_base("cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub(crate) fn has_endpoint_and_key(&self) -> bool {
        !self.base_url.trim().is_empty() && self.api_key().is_some()
    }

    pub(crate) fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            provider_name: self.name.clone(),
            model: self.default_model.clone(),
        }
    }

    pub(crate) fn catalog(&self, available: bool) -> Vec<ModelDescriptor> {
        if available {
            self.models.clone()
        } else {
            Vec::new()
        }
    }
}

pub fn build_adapter(
    config: &ProviderConfig,
    api_key: Option<String>,
) -> GatewayResult<Arc<dyn ProviderAdapter>> {
    let settings = AdapterSettings::from_config(config, api_key);
    let adapter: Arc<dyn ProviderAdapter> = match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(settings)?),
        ProviderKind::AzureOpenAi => Arc::new(AzureOpenAiAdapter::new(settings)?),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(settings)?),
        ProviderKind::Gemini => Arc::new(GeminiAdapter::new(settings)?),
    };
    Ok(adapter)
}

/// Joins the request's system prompt with any system-role turns, for vendors
/// that take system instructions outside the message list.
pub(crate) fn merged_system_text(request: &ChatCompletionRequest) -> Option<String> {
    let parts: Vec<&str> = request
        .effective_system_prompt()
        .into_iter()
        .chain(
            request
                .messages
                .iter()
                .filter(|message| message.role == ChatRole::System)
                .map(|message| message.text.as_str()),
        )
        .filter(|text| !text.trim().is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// A model or deployment name used as a single URL path segment.
pub(crate) fn model_segment(model: &str) -> GatewayResult<&str> {
    let model = model.trim();
    if model.is_empty() || model == "." || model == ".." {
        return Err(GatewayError::InvalidRequest(format!(
            "`{model}` is not a usable model name"
        )));
    }
    Ok(model)
}
