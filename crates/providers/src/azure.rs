use async_trait::async_trait;
use core_types::{
    ChatCompletionRequest, ChatCompletionResponse, GatewayError, GatewayResult, ModelDescriptor,
    ProviderAdapter, ProviderIdentity,
};
use reqwest::{Client, Url};
use tokio_util::sync::CancellationToken;

use crate::{AdapterSettings, model_segment};
use crate::http::{build_client, extra_header_map, post_json, require_api_key};
use crate::openai::{OpenAiChatResponse, from_chat_response, to_chat_request};

const DEFAULT_API_VERSION: &str = "2024-10-21";

/// Azure OpenAI: same wire schema as OpenAI, but the model is addressed
/// through a deployment name in the URL and auth uses the `api-key` header.
#[derive(Debug, Clone)]
pub struct AzureOpenAiAdapter {
    http: Client,
    settings: AdapterSettings,
}

impl AzureOpenAiAdapter {
    pub fn new(settings: AdapterSettings) -> GatewayResult<Self> {
        Ok(Self {
            http: build_client(&settings.name, settings.timeout)?,
            settings,
        })
    }

    fn deployment_url(&self, deployment: &str) -> GatewayResult<Url> {
        let api_version = self
            .settings
            .api_version
            .as_deref()
            .unwrap_or(DEFAULT_API_VERSION);
        let mut url = self.settings.endpoint(&[
            "openai",
            "deployments",
            model_segment(deployment)?,
            "chat",
            "completions",
        ])?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }
}

#[async_trait]
impl ProviderAdapter for AzureOpenAiAdapter {
    fn identity(&self) -> ProviderIdentity {
        self.settings.identity()
    }

    fn is_available(&self) -> bool {
        self.settings.has_endpoint_and_key()
            && self
                .settings
                .default_model
                .as_deref()
                .is_some_and(|deployment| !deployment.trim().is_empty())
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
        let deployment = request.resolve_model(self.settings.default_model.as_deref())?;
        let backend = self.settings.name.as_str();
        let api_key = require_api_key(backend, self.settings.api_key())?;
        let headers = extra_header_map(&self.settings.extra_headers)
            .map_err(|err| GatewayError::provider(backend, err))?;

        let url = self.deployment_url(&deployment)?;

        let payload = to_chat_request(request, None);
        let builder = self
            .http
            .post(url)
            .header("api-key", api_key)
            .headers(headers);

        let output: OpenAiChatResponse = post_json(backend, builder, &payload, cancellation).await?;
        Ok(from_chat_response(backend, deployment, output))
    }
}
