use async_trait::async_trait;
use chrono::Utc;
use core_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole, GatewayError,
    GatewayResult, ModelDescriptor, ProviderAdapter, ProviderIdentity, Usage,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::http::{build_client, extra_header_map, post_json, require_api_key};
use crate::{AdapterSettings, merged_system_text, model_segment};

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    http: Client,
    settings: AdapterSettings,
}

impl GeminiAdapter {
    pub fn new(settings: AdapterSettings) -> GatewayResult<Self> {
        Ok(Self {
            http: build_client(&settings.name, settings.timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
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

        let method = format!("{}:generateContent", model_segment(&model)?);
        let url = self.settings.endpoint(&["v1beta", "models", &method])?;

        let payload = to_generate_request(request);
        let builder = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .headers(headers);

        let output: GeminiResponse = post_json(backend, builder, &payload, cancellation).await?;
        Ok(from_generate_response(backend, model, output))
    }
}

fn to_generate_request(request: &ChatCompletionRequest) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = request
        .messages
        .iter()
        .filter(|message| message.role != ChatRole::System)
        .map(|message| GeminiContent {
            role: Some(if message.role == ChatRole::Assistant {
                "model"
            } else {
                "user"
            }),
            parts: vec![GeminiPart {
                text: message.text.clone(),
            }],
        })
        .collect();

    let mut system = merged_system_text(request);
    if contents.is_empty()
        && let Some(text) = system.take()
    {
        contents.push(GeminiContent {
            role: Some("user"),
            parts: vec![GeminiPart { text }],
        });
    }

    let generation_config = (request.temperature.is_some() || request.max_tokens.is_some())
        .then_some(GeminiGenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
        });

    GeminiRequest {
        contents,
        system_instruction: system.map(|text| GeminiContent {
            role: None,
            parts: vec![GeminiPart { text }],
        }),
        generation_config,
    }
}

fn from_generate_response(
    backend: &str,
    requested_model: String,
    output: GeminiResponse,
) -> ChatCompletionResponse {
    let candidate = output.candidates.into_iter().next();
    let finish_reason = candidate
        .as_ref()
        .and_then(|candidate| candidate.finish_reason.clone());
    let content: String = candidate
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if content.is_empty() {
        warn!(provider = %backend, model = %requested_model, "empty completion content");
    }

    ChatCompletionResponse {
        message: ChatMessage::assistant(content),
        provider: backend.to_owned(),
        model: output.model_version.unwrap_or(requested_model),
        usage: output.usage_metadata.map(|usage| Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        }),
        finish_reason,
        created_at: Utc::now(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: Option<u64>,
}
