use async_trait::async_trait;
use chrono::Utc;
use core_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, GatewayError, GatewayResult,
    ModelDescriptor, ProviderAdapter, ProviderIdentity, Usage,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::AdapterSettings;
use crate::http::{build_client, extra_header_map, post_json, require_api_key};

/// Adapter for OpenAI and any endpoint speaking the OpenAI chat completions
/// schema.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    http: Client,
    settings: AdapterSettings,
}

impl OpenAiAdapter {
    pub fn new(settings: AdapterSettings) -> GatewayResult<Self> {
        Ok(Self {
            http: build_client(&settings.name, settings.timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn identity(&self) -> ProviderIdentity {
        self.settings.identity()
    }

    fn is_available(&self) -> bool {
        self.settings.has_endpoint_and_key()
    }

    fn list_models(&self) -> Vec<ModelDescriptor> {
        self.settings.catalog(self.is_available())
    }

    async fn complete(
        &self,
        request: &ChatCompletionRequest,
        cancellation: &CancellationToken,
    ) -> GatewayResult<ChatCompletionResponse> {
        request.validate()?;
        let model = request.resolve_model(self.settings.default_model.as_deref())?;
        let backend = self.settings.name.as_str();
        let api_key = require_api_key(backend, self.settings.api_key())?;
        let headers = extra_header_map(&self.settings.extra_headers)
            .map_err(|err| GatewayError::provider(backend, err))?;

        let payload = to_chat_request(request, Some(model.clone()));
        let builder = self
            .http
            .post(self.settings.endpoint(&["chat", "completions"])?)
            .bearer_auth(api_key)
            .headers(headers);

        let output: OpenAiChatResponse = post_json(backend, builder, &payload, cancellation).await?;
        Ok(from_chat_response(backend, model, output))
    }
}

pub(crate) fn to_chat_request(
    request: &ChatCompletionRequest,
    model: Option<String>,
) -> OpenAiChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system_prompt) = request.effective_system_prompt() {
        messages.push(OpenAiMessage {
            role: "system".to_owned(),
            content: system_prompt.to_owned(),
        });
    }

    messages.extend(request.messages.iter().map(|message| OpenAiMessage {
        role: message.role.as_str().to_owned(),
        content: message.text.clone(),
    }));

    OpenAiChatRequest {
        model,
        messages,
        stream: false,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

pub(crate) fn from_chat_response(
    backend: &str,
    requested_model: String,
    output: OpenAiChatResponse,
) -> ChatCompletionResponse {
    let choice = output.choices.into_iter().next();
    let finish_reason = choice.as_ref().and_then(|choice| choice.finish_reason.clone());
    let content = choice
        .and_then(|choice| choice.message.content)
        .unwrap_or_default();

    if content.is_empty() {
        warn!(provider = %backend, model = %requested_model, "empty completion content");
    }

    ChatCompletionResponse {
        message: ChatMessage::assistant(content),
        provider: backend.to_owned(),
        model: output.model.unwrap_or(requested_model),
        usage: output.usage.map(|usage| Usage {
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            total_tokens: usage.total_tokens,
        }),
        finish_reason,
        created_at: Utc::now(),
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiAssistantMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiAssistantMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}
