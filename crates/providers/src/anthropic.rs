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
use crate::{AdapterSettings, merged_system_text};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    http: Client,
    settings: AdapterSettings,
}

impl AnthropicAdapter {
    pub fn new(settings: AdapterSettings) -> GatewayResult<Self> {
        Ok(Self {
            http: build_client(&settings.name, settings.timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
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

        let payload = to_messages_request(request, &model);
        let builder = self
            .http
            .post(self.settings.endpoint(&["v1", "messages"])?)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .headers(headers);

        let output: AnthropicResponse = post_json(backend, builder, &payload, cancellation).await?;
        Ok(from_messages_response(backend, model, output))
    }
}

fn to_messages_request(request: &ChatCompletionRequest, model: &str) -> AnthropicRequest {
    let mut messages: Vec<AnthropicMessage> = request
        .messages
        .iter()
        .filter(|message| message.role != ChatRole::System)
        .map(|message| AnthropicMessage {
            role: match message.role {
                ChatRole::Assistant => "assistant",
                ChatRole::User | ChatRole::System => "user",
            },
            content: message.text.clone(),
        })
        .collect();

    let mut system = merged_system_text(request);

    // The Messages API needs at least one turn; a system-only request is sent
    // as a single user turn instead.
    if messages.is_empty()
        && let Some(text) = system.take()
    {
        messages.push(AnthropicMessage {
            role: "user",
            content: text,
        });
    }

    AnthropicRequest {
        model: model.to_owned(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system,
        messages,
        temperature: request.temperature,
    }
}

fn from_messages_response(
    backend: &str,
    requested_model: String,
    output: AnthropicResponse,
) -> ChatCompletionResponse {
    let content: String = output
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();

    if content.is_empty() {
        warn!(provider = %backend, model = %requested_model, "empty completion content");
    }

    ChatCompletionResponse {
        message: ChatMessage::assistant(content),
        provider: backend.to_owned(),
        model: output.model.unwrap_or(requested_model),
        usage: output.usage.map(|usage| Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: None,
        }),
        finish_reason: output.stop_reason,
        created_at: Utc::now(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn system_turns_move_to_top_level_field() {
        let request = ChatCompletionRequest::new(vec![
            ChatMessage::system("cite sources"),
            ChatMessage::user("what is rust?"),
        ])
        .with_system_prompt("you are a librarian");

        let payload = serde_json::to_value(to_messages_request(&request, "claude")).unwrap();
        assert_eq!(payload["system"], "you are a librarian\n\ncite sources");
        assert_eq!(payload["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn system_only_request_becomes_user_turn() {
        let request = ChatCompletionRequest::new(Vec::new()).with_system_prompt("say hi");
        let payload = serde_json::to_value(to_messages_request(&request, "claude")).unwrap();
        assert!(payload.get("system").is_none());
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"], "say hi");
    }

    #[tokio::test]
    async fn completes_against_messages_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ant-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "model": "claude-sonnet-4",
                "max_tokens": 256
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "Hello"},
                    {"type": "text", "text": " there"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 11, "output_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::new(
            AdapterSettings::new("anthropic", server.uri())
                .with_api_key("ant-key")
                .with_default_model("claude-sonnet-4"),
        )
        .expect("adapter");

        let response = adapter
            .complete(
                &ChatCompletionRequest::new(vec![ChatMessage::user("hi")]).with_max_tokens(256),
                &CancellationToken::new(),
            )
            .await
            .expect("completion");

        assert_eq!(response.message.text, "Hello there");
        assert_eq!(response.model, "claude-sonnet-4-20250514");
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage.map(|usage| usage.total()), Some(13));
    }

    #[tokio::test]
    async fn malformed_body_becomes_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::new(
            AdapterSettings::new("anthropic", server.uri())
                .with_api_key("ant-key")
                .with_default_model("claude-sonnet-4"),
        )
        .expect("adapter");

        let err = adapter
            .complete(
                &ChatCompletionRequest::new(vec![ChatMessage::user("hi")]),
                &CancellationToken::new(),
            )
            .await
            .expect_err("bad json");
        assert!(matches!(
            err,
            GatewayError::Provider { ref backend, .. } if backend == "anthropic"
        ));
    }
}
