//! Inference gateway: owns the registered provider adapters, pairs each with
//! its own rate limiter, and routes completions to them.
//!
//! The registry is fixed once [`GatewayBuilder::build`] returns. Lookups are
//! lock-free; the only shared mutable state is inside each backend's
//! [`RateLimiter`], so a busy backend never slows down another.

mod service;

use std::sync::Arc;

use config::GatewayConfig;
use core_types::{
    ChatCompletionRequest, ChatCompletionResponse, GatewayError, GatewayResult, ProviderAdapter,
    ProviderModels,
};
use indexmap::IndexMap;
use rate_limiter::{RateLimiter, RateLimiterStats};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

pub use service::ServiceHandle;

struct Registration {
    name: Arc<str>,
    adapter: Arc<dyn ProviderAdapter>,
    limiter: Arc<RateLimiter>,
}

impl Registration {
    fn handle(&self, deployment_override: Option<String>) -> ServiceHandle {
        ServiceHandle::new(
            Arc::clone(&self.name),
            Arc::clone(&self.adapter),
            Arc::clone(&self.limiter),
            deployment_override,
        )
    }
}

#[derive(Default)]
pub struct GatewayBuilder {
    registry: IndexMap<String, Registration>,
}

impl GatewayBuilder {
    /// Registers `adapter` under its identity's provider name with a fresh
    /// limiter. Registration order is the order used for default selection
    /// and catalog aggregation.
    pub fn register(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        max_requests_per_minute: i64,
    ) -> GatewayResult<Self> {
        let name = adapter.identity().provider_name;
        if name.trim().is_empty() {
            return Err(GatewayError::InvalidConfiguration(
                "adapter reports an empty provider name".to_string(),
            ));
        }
        if self.registry.contains_key(&name) {
            return Err(GatewayError::InvalidConfiguration(format!(
                "provider `{name}` is registered twice"
            )));
        }

        let limiter =
            RateLimiter::from_config_value(max_requests_per_minute).map_err(|err| match err {
                GatewayError::InvalidConfiguration(reason) => {
                    GatewayError::InvalidConfiguration(format!("provider `{name}`: {reason}"))
                }
                other => other,
            })?;

        self.registry.insert(
            name.clone(),
            Registration {
                name: Arc::from(name.as_str()),
                adapter,
                limiter: Arc::new(limiter),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> Gateway {
        Gateway {
            registry: self.registry,
        }
    }
}

pub struct Gateway {
    registry: IndexMap<String, Registration>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Builds adapters for every enabled provider in `config`, in file order.
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let mut builder = Self::builder();
        for provider in config.enabled_providers() {
            let api_key = config::resolve_api_key(provider);
            if api_key.is_none() {
                warn!(provider = %provider.name, "no credential configured, provider unavailable");
            }
            let adapter = providers::build_adapter(provider, api_key)?;
            builder = builder.register(adapter, provider.max_requests_per_minute)?;
        }

        let gateway = builder.build();
        info!(
            providers = gateway.len(),
            available = gateway
                .registry
                .values()
                .filter(|registration| registration.adapter.is_available())
                .count(),
            "gateway ready"
        );
        Ok(gateway)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    /// Exact-name lookup. `deployment_override` replaces the model of calls
    /// made through the returned handle only.
    pub fn get_service(
        &self,
        provider_name: &str,
        deployment_override: Option<&str>,
    ) -> Option<ServiceHandle> {
        self.registry
            .get(provider_name)
            .map(|registration| registration.handle(deployment_override.map(str::to_owned)))
    }

    /// First registered provider that reports itself available.
    pub fn get_default_service(&self) -> Option<ServiceHandle> {
        self.registry
            .values()
            .find(|registration| registration.adapter.is_available())
            .map(|registration| registration.handle(None))
    }

    pub fn list_all_models(&self) -> Vec<ProviderModels> {
        self.registry
            .values()
            .filter(|registration| registration.adapter.is_available())
            .map(|registration| ProviderModels {
                provider: registration.name.to_string(),
                models: registration.adapter.list_models(),
            })
            .collect()
    }

    pub fn limiter_stats(&self, provider_name: &str) -> Option<RateLimiterStats> {
        self.registry
            .get(provider_name)
            .map(|registration| registration.limiter.stats())
    }

    /// Resolves a backend and runs one completion through its rate limiter.
    ///
    /// The backend is `provider_name` if given, else the request's provider
    /// hint, else the default service. Failures from the limiter or adapter
    /// are returned unchanged; nothing is retried here.
    pub async fn complete_via(
        &self,
        provider_name: Option<&str>,
        request: &ChatCompletionRequest,
        cancellation: &CancellationToken,
    ) -> GatewayResult<ChatCompletionResponse> {
        let requested = provider_name.or(request.provider.as_deref());
        let service = match requested {
            Some(name) => self.get_service(name, None),
            None => self.get_default_service(),
        }
        .ok_or_else(|| {
            GatewayError::ProviderNotFound(requested.unwrap_or("<default>").to_string())
        })?;

        let span = info_span!(
            "complete_via",
            request_id = %Uuid::new_v4(),
            provider = %service.name(),
            model = request.model.as_deref().unwrap_or("<default>"),
        );

        async {
            let result = service.complete(request, cancellation).await;
            match &result {
                Ok(response) => debug!(
                    model = %response.model,
                    total_tokens = response.usage.map(|usage| usage.total()),
                    "completion succeeded"
                ),
                Err(GatewayError::Cancelled) => debug!("completion cancelled"),
                Err(err) => warn!(error = %err, "completion failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;
    use config::CURRENT_SCHEMA_VERSION;
    use core_types::{
        ChatMessage, ModelDescriptor, ProviderConfig, ProviderIdentity, ProviderKind,
    };
    use futures::future::join_all;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    struct StubAdapter {
        name: String,
        available: bool,
        fail: bool,
        latency: Duration,
        models: Vec<ModelDescriptor>,
        calls: AtomicUsize,
        seen: Mutex<Vec<(Instant, Option<String>)>>,
    }

    impl StubAdapter {
        fn new(name: &str, available: bool) -> Arc<Self> {
            Self::build(name, available, false, Duration::ZERO)
        }

        fn failing(name: &str) -> Arc<Self> {
            Self::build(name, true, true, Duration::ZERO)
        }

        /// Answers only after `latency`, or fails with `Cancelled` if the
        /// caller's token fires first.
        fn slow(name: &str, latency: Duration) -> Arc<Self> {
            Self::build(name, true, false, latency)
        }

        fn build(name: &str, available: bool, fail: bool, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                available,
                fail,
                latency,
                models: vec![ModelDescriptor::new(
                    format!("{name}-large"),
                    format!("{name} large"),
                    32_768,
                )],
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn identity(&self) -> ProviderIdentity {
            ProviderIdentity {
                provider_name: self.name.clone(),
                model: Some(format!("{}-large", self.name)),
            }
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn list_models(&self) -> Vec<ModelDescriptor> {
            if self.available {
                self.models.clone()
            } else {
                Vec::new()
            }
        }

        async fn complete(
            &self,
            request: &ChatCompletionRequest,
            cancellation: &CancellationToken,
        ) -> GatewayResult<ChatCompletionResponse> {
            request.validate()?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push((Instant::now(), request.model.clone()));
            if !self.latency.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(self.latency) => {}
                }
            }
            if self.fail {
                return Err(GatewayError::provider(&self.name, anyhow!("503 unavailable")));
            }
            Ok(ChatCompletionResponse {
                message: ChatMessage::assistant(format!("from {}", self.name)),
                provider: self.name.clone(),
                model: request
                    .model
                    .clone()
                    .unwrap_or_else(|| format!("{}-large", self.name)),
                usage: None,
                finish_reason: Some("stop".to_string()),
                created_at: Utc::now(),
            })
        }
    }

    fn hello() -> ChatCompletionRequest {
        ChatCompletionRequest::new(vec![ChatMessage::user("hello")])
    }

    fn gateway(adapters: &[(Arc<StubAdapter>, i64)]) -> Gateway {
        adapters
            .iter()
            .try_fold(Gateway::builder(), |builder, (adapter, rpm)| {
                builder.register(adapter.clone(), *rpm)
            })
            .expect("register")
            .build()
    }

    #[test]
    fn default_service_is_first_available_in_registration_order() {
        let vendor_a = StubAdapter::new("vendorA", true);
        let vendor_b = StubAdapter::new("vendorB", false);
        let gateway = gateway(&[(vendor_b, 60), (vendor_a, 60)]);

        for _ in 0..3 {
            let service = gateway.get_default_service().expect("default");
            assert_eq!(service.name(), "vendorA");
        }
    }

    #[test]
    fn no_default_when_nothing_is_available() {
        let gateway = gateway(&[(StubAdapter::new("vendorB", false), 60)]);
        assert!(gateway.get_default_service().is_none());
    }

    #[test]
    fn unknown_name_resolves_to_nothing() {
        let gateway = gateway(&[(StubAdapter::new("vendorA", true), 60)]);
        assert!(gateway.get_service("vendorC", None).is_none());
        assert!(gateway.get_service("VendorA", None).is_none());
    }

    #[test]
    fn aggregation_skips_unavailable_adapters() {
        let gateway = gateway(&[
            (StubAdapter::new("vendorA", true), 60),
            (StubAdapter::new("vendorB", false), 60),
            (StubAdapter::new("vendorC", true), 60),
        ]);

        let catalog = gateway.list_all_models();
        let providers: Vec<&str> = catalog.iter().map(|entry| entry.provider.as_str()).collect();
        assert_eq!(providers, vec!["vendorA", "vendorC"]);
        assert_eq!(catalog[0].models[0].id, "vendorA-large");
    }

    #[test]
    fn registration_rejects_duplicates_and_bad_limits() {
        let err = Gateway::builder()
            .register(StubAdapter::new("vendorA", true), 60)
            .and_then(|builder| builder.register(StubAdapter::new("vendorA", true), 60))
            .err()
            .expect("duplicate");
        assert!(matches!(err, GatewayError::InvalidConfiguration(_)));

        for rpm in [0, -10] {
            let err = Gateway::builder()
                .register(StubAdapter::new("vendorA", true), rpm)
                .err()
                .expect("bad limit");
            assert!(matches!(err, GatewayError::InvalidConfiguration(_)));
        }
    }

    #[tokio::test]
    async fn unknown_provider_touches_neither_limiter_nor_backend() {
        let vendor_a = StubAdapter::new("vendorA", true);
        let gateway = gateway(&[(vendor_a.clone(), 60)]);

        let err = gateway
            .complete_via(Some("vendorC"), &hello(), &CancellationToken::new())
            .await
            .expect_err("not registered");

        assert!(matches!(err, GatewayError::ProviderNotFound(ref name) if name == "vendorC"));
        assert_eq!(vendor_a.calls(), 0);
        assert_eq!(gateway.limiter_stats("vendorA").unwrap().admitted, 0);
    }

    #[tokio::test]
    async fn falls_back_to_request_hint_then_default() {
        let vendor_a = StubAdapter::new("vendorA", true);
        let vendor_b = StubAdapter::new("vendorB", true);
        let gateway = gateway(&[(vendor_a.clone(), 60), (vendor_b.clone(), 60)]);
        let token = CancellationToken::new();

        let response = gateway
            .complete_via(None, &hello().with_provider("vendorB"), &token)
            .await
            .expect("hinted");
        assert_eq!(response.provider, "vendorB");

        let response = gateway.complete_via(None, &hello(), &token).await.expect("default");
        assert_eq!(response.provider, "vendorA");

        let response = gateway
            .complete_via(Some("vendorA"), &hello().with_provider("vendorB"), &token)
            .await
            .expect("explicit");
        assert_eq!(response.provider, "vendorA");
    }

    #[tokio::test]
    async fn no_available_default_is_provider_not_found() {
        let gateway = gateway(&[(StubAdapter::new("vendorB", false), 60)]);
        let err = gateway
            .complete_via(None, &hello(), &CancellationToken::new())
            .await
            .expect_err("nothing available");
        assert!(matches!(err, GatewayError::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn adapter_errors_pass_through_unchanged() {
        let gateway = gateway(&[(StubAdapter::failing("vendorA"), 60)]);
        let token = CancellationToken::new();

        let err = gateway
            .complete_via(Some("vendorA"), &hello(), &token)
            .await
            .expect_err("backend down");
        assert!(matches!(err, GatewayError::Provider { ref backend, .. } if backend == "vendorA"));

        let err = gateway
            .complete_via(Some("vendorA"), &ChatCompletionRequest::default(), &token)
            .await
            .expect_err("empty request");
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn deployment_override_applies_only_to_its_handle() {
        let vendor_a = StubAdapter::new("vendorA", true);
        let gateway = gateway(&[(vendor_a.clone(), 600)]);
        let token = CancellationToken::new();

        let pinned = gateway
            .get_service("vendorA", Some("eu-deployment"))
            .expect("registered");
        assert_eq!(pinned.identity().model.as_deref(), Some("eu-deployment"));
        pinned
            .complete(&hello().with_model("ignored"), &token)
            .await
            .expect("pinned call");

        let plain = gateway.get_service("vendorA", None).expect("registered");
        assert_eq!(plain.identity().model.as_deref(), Some("vendorA-large"));
        plain.complete(&hello(), &token).await.expect("plain call");

        let seen: Vec<Option<String>> = vendor_a
            .seen
            .lock()
            .iter()
            .map(|(_, model)| model.clone())
            .collect();
        assert_eq!(seen, vec![Some("eu-deployment".to_string()), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_paced_per_backend() {
        let start = Instant::now();
        let slow = StubAdapter::new("slow", true);
        let fast = StubAdapter::new("fast", true);
        let gateway = gateway(&[(slow.clone(), 2), (fast.clone(), 6000)]);
        let token = CancellationToken::new();
        let request = hello();

        let slow_calls = (0..3).map(|_| gateway.complete_via(Some("slow"), &request, &token));
        let fast_calls = (0..3).map(|_| gateway.complete_via(Some("fast"), &request, &token));
        let results = join_all(slow_calls.chain(fast_calls)).await;
        assert!(results.iter().all(Result::is_ok));

        let mut slow_offsets: Vec<Duration> =
            slow.seen.lock().iter().map(|(at, _)| *at - start).collect();
        slow_offsets.sort();
        assert_eq!(
            slow_offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(30),
                Duration::from_secs(60)
            ]
        );

        let fast_latest = fast
            .seen
            .lock()
            .iter()
            .map(|(at, _)| *at - start)
            .max()
            .expect("fast calls");
        assert!(fast_latest < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_queued_skips_backend() {
        let vendor_a = StubAdapter::new("vendorA", true);
        let gateway = Arc::new(gateway(&[(vendor_a.clone(), 1)]));
        let token = CancellationToken::new();

        gateway
            .complete_via(Some("vendorA"), &hello(), &token)
            .await
            .expect("first call admitted immediately");

        let queued_token = CancellationToken::new();
        let queued = {
            let gateway = Arc::clone(&gateway);
            let queued_token = queued_token.clone();
            tokio::spawn(async move {
                gateway
                    .complete_via(Some("vendorA"), &hello(), &queued_token)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        queued_token.cancel();

        let err = queued.await.expect("join").expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(vendor_a.calls(), 1);
        assert_eq!(gateway.limiter_stats("vendorA").unwrap().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_after_admission_reaches_backend_only_for_that_caller() {
        let start = Instant::now();
        let vendor_a = StubAdapter::slow("vendorA", Duration::from_secs(5));
        let gateway = gateway(&[(vendor_a.clone(), 6000)]);
        let request = hello();

        let cancelled_token = CancellationToken::new();
        let kept_token = CancellationToken::new();
        let cancel = cancelled_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let (cancelled, kept) = tokio::join!(
            gateway.complete_via(Some("vendorA"), &request, &cancelled_token),
            gateway.complete_via(Some("vendorA"), &request, &kept_token),
        );

        assert!(cancelled.expect_err("cancelled in flight").is_cancelled());
        assert_eq!(kept.expect("unaffected caller").provider, "vendorA");
        assert!(Instant::now() - start >= Duration::from_secs(5));

        assert_eq!(vendor_a.calls(), 2);
        let stats = gateway.limiter_stats("vendorA").expect("registered");
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.cancelled, 0);
    }

    #[test]
    fn builds_from_config_in_file_order_skipping_disabled() {
        let mut openai =
            ProviderConfig::new("openai", ProviderKind::OpenAi, "https://api.openai.com/v1", 60);
        openai.api_key = Some("sk-test".to_string());
        openai.default_model = Some("gpt-4o".to_string());
        openai.models = vec![ModelDescriptor::new("gpt-4o", "GPT-4o", 128_000)];

        let mut anthropic = ProviderConfig::new(
            "anthropic",
            ProviderKind::Anthropic,
            "https://api.anthropic.com",
            50,
        );
        anthropic.enabled = false;

        let gemini = ProviderConfig::new(
            "gemini",
            ProviderKind::Gemini,
            "https://generativelanguage.googleapis.com",
            15,
        );

        let gateway = Gateway::from_config(&GatewayConfig {
            schema_version: CURRENT_SCHEMA_VERSION,
            providers: vec![gemini, anthropic, openai],
        })
        .expect("gateway");

        assert_eq!(gateway.provider_names().collect::<Vec<_>>(), vec!["gemini", "openai"]);
        assert_eq!(
            gateway.get_default_service().map(|service| service.name().to_string()),
            Some("openai".to_string())
        );
        assert_eq!(gateway.list_all_models().len(), 1);
        assert_eq!(
            gateway
                .get_service("openai", None)
                .map(|service| service.max_requests_per_minute()),
            Some(60)
        );
    }

    #[test]
    fn invalid_config_fails_fast() {
        let config = GatewayConfig {
            schema_version: CURRENT_SCHEMA_VERSION,
            providers: vec![ProviderConfig::new(
                "openai",
                ProviderKind::OpenAi,
                "https://api.openai.com/v1",
                0,
            )],
        };
        assert!(matches!(
            Gateway::from_config(&config),
            Err(GatewayError::InvalidConfiguration(_))
        ));
    }
}
