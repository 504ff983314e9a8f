use std::borrow::Cow;
use std::sync::Arc;

use core_types::{
    ChatCompletionRequest, ChatCompletionResponse, GatewayResult, ModelDescriptor,
    ProviderAdapter, ProviderIdentity,
};
use rate_limiter::{RateLimiter, RateLimiterStats};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A resolved backend: the adapter together with its own rate limiter.
///
/// Handles are cheap to clone and never mutate the registered adapter; a
/// deployment override only affects calls made through this handle.
#[derive(Clone)]
pub struct ServiceHandle {
    name: Arc<str>,
    adapter: Arc<dyn ProviderAdapter>,
    limiter: Arc<RateLimiter>,
    deployment_override: Option<String>,
}

impl ServiceHandle {
    pub(crate) fn new(
        name: Arc<str>,
        adapter: Arc<dyn ProviderAdapter>,
        limiter: Arc<RateLimiter>,
        deployment_override: Option<String>,
    ) -> Self {
        Self {
            name,
            adapter,
            limiter,
            deployment_override,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> ProviderIdentity {
        let mut identity = self.adapter.identity();
        if let Some(deployment) = &self.deployment_override {
            identity.model = Some(deployment.clone());
        }
        identity
    }

    pub fn is_available(&self) -> bool {
        self.adapter.is_available()
    }

    pub fn list_models(&self) -> Vec<ModelDescriptor> {
        self.adapter.list_models()
    }

    pub fn max_requests_per_minute(&self) -> u32 {
        self.limiter.max_requests_per_minute()
    }

    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    /// Waits for this backend's rate limiter, then runs the completion.
    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        cancellation: &CancellationToken,
    ) -> GatewayResult<ChatCompletionResponse> {
        let admission = self.limiter.acquire(cancellation).await?;
        debug!(
            provider = %self.name,
            waited_ms = admission.waited.as_millis() as u64,
            "admitted by rate limiter"
        );

        let request = match &self.deployment_override {
            Some(deployment) => {
                let mut overridden = request.clone();
                overridden.model = Some(deployment.clone());
                Cow::Owned(overridden)
            }
            None => Cow::Borrowed(request),
        };

        self.adapter.complete(&request, cancellation).await
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("deployment_override", &self.deployment_override)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
