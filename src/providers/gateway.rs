//! Multi-provider generation façade.
//!
//! Both call shapes follow the same protocol: select a provider, call it,
//! record the outcome, and on a rotating failure move to the next provider
//! until the request has made one pass. Streams fail over only until the
//! first fragment reaches the caller.

use std::{future::Future, sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{Instrument, info, info_span, instrument, warn};

use super::{
    CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream, ProviderError,
    ProviderHealth, RotationState,
    fallback::{FallbackDecision, classify_provider_error, error_kind},
    open_ai::OpenAiProvider,
};
use crate::{
    config::{ConfigError, GenerationConfig, ProviderModels},
    streaming::IdleTimeoutStream,
};

/// A backend plus the models it should be asked for.
pub struct GatewayProvider {
    pub provider: Arc<dyn CompletionProvider>,
    pub models: ProviderModels,
}

impl GatewayProvider {
    pub fn new(provider: Arc<dyn CompletionProvider>, models: ProviderModels) -> Self {
        Self { provider, models }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub error_threshold: u32,
    pub cooldown: Duration,
    pub timeout: Duration,
    /// Zero disables the idle check.
    pub stream_idle_timeout: Duration,
}

impl From<&GenerationConfig> for GatewaySettings {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            error_threshold: config.error_threshold,
            cooldown: Duration::from_secs(config.cooldown_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            stream_idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
        }
    }
}

pub struct GenerationGateway {
    providers: Vec<GatewayProvider>,
    rotation: Arc<Mutex<RotationState>>,
    settings: GatewaySettings,
}

impl GenerationGateway {
    pub fn new(providers: Vec<GatewayProvider>, settings: GatewaySettings) -> Self {
        let names = providers
            .iter()
            .map(|p| p.provider.name().to_string())
            .collect();
        let rotation = RotationState::new(names, settings.error_threshold, settings.cooldown);
        Self {
            providers,
            rotation: Arc::new(Mutex::new(rotation)),
            settings,
        }
    }

    /// Build OpenAI-compatible backends for every configured provider.
    pub fn from_config(
        config: &GenerationConfig,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let providers = config
            .providers
            .iter()
            .map(|provider| {
                if provider.models.chat.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "provider '{}' needs a chat model",
                        provider.name
                    )));
                }
                let backend = OpenAiProvider::from_config(provider, client.clone());
                Ok(GatewayProvider::new(
                    Arc::new(backend),
                    provider.models.clone(),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(providers, GatewaySettings::from(config)))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Per-provider error counts, cooldown status and last use.
    pub fn health(&self) -> Vec<ProviderHealth> {
        self.rotation.lock().snapshot()
    }

    #[instrument(skip(self, request), fields(messages = request.messages.len()))]
    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let timeout = self.settings.timeout;
        let (_, response) = self
            .run(false, |entry, model| {
                let provider = entry.provider.clone();
                async move {
                    match tokio::time::timeout(timeout, provider.complete(&model, request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout(timeout)),
                    }
                }
            })
            .await?;
        Ok(response)
    }

    /// Stream a completion.
    ///
    /// The returned stream has already produced its first fragment (or
    /// ended cleanly). An error after that ends the stream with a
    /// [`ProviderError::Stream`] and counts against the provider.
    #[instrument(skip(self, request), fields(messages = request.messages.len()))]
    pub async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let timeout = self.settings.timeout;
        let idle = self.settings.stream_idle_timeout;
        let (index, (first, rest)) = self
            .run(true, |entry, model| {
                let provider = entry.provider.clone();
                async move {
                    let open = tokio::time::timeout(timeout, provider.stream(&model, request));
                    let opened = match open.await {
                        Ok(result) => result?,
                        Err(_) => return Err(ProviderError::Timeout(timeout)),
                    };
                    let mut timed = IdleTimeoutStream::new(opened, idle);
                    match timed.next().await {
                        Some(Ok(first)) => Ok((Some(first), timed)),
                        Some(Err(e)) => Err(e),
                        None => Ok((None, timed)),
                    }
                }
            })
            .await?;
        Ok(self.finish_stream(index, first, rest))
    }

    /// One pass over the providers, recording every outcome.
    ///
    /// Returns the index of the provider that succeeded with its value.
    async fn run<T, F, Fut>(&self, streaming: bool, call: F) -> Result<(usize, T), ProviderError>
    where
        F: Fn(&GatewayProvider, String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if self.providers.is_empty() {
            return Err(ProviderError::NoProviders);
        }

        let mut tried: Vec<usize> = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        loop {
            let Some(index) = self.rotation.lock().select(&tried) else {
                break;
            };
            tried.push(index);
            let entry = &self.providers[index];
            let name = entry.provider.name().to_string();
            let model = entry.models.for_mode(streaming).to_string();

            let span = info_span!(
                "provider_call",
                provider = %name,
                model = %model,
                attempt = tried.len()
            );
            match self
                .attempt(index, call(entry, model.clone()))
                .instrument(span)
                .await
            {
                Ok(value) => {
                    info!(
                        stage = "provider_succeeded",
                        provider = %name,
                        model = %model,
                        streaming,
                        attempts = tried.len(),
                        "Completion provider succeeded"
                    );
                    return Ok((index, value));
                }
                Err(e) if classify_provider_error(&e) == FallbackDecision::Stop => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        let attempts = tried.len();
        Err(match last_error {
            Some(last) => {
                warn!(
                    stage = "providers_exhausted",
                    attempts,
                    error = %last,
                    "Every completion provider failed"
                );
                ProviderError::Exhausted {
                    attempts,
                    last: Box::new(last),
                }
            }
            None => ProviderError::NoProviders,
        })
    }

    /// Await one call and feed its outcome back into the rotation state.
    async fn attempt<T>(
        &self,
        index: usize,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match call.await {
            Ok(value) => {
                self.rotation.lock().record_success(index);
                Ok(value)
            }
            Err(e) => {
                if classify_provider_error(&e) == FallbackDecision::Rotate {
                    let mut rotation = self.rotation.lock();
                    let errors = rotation.record_failure(index);
                    warn!(
                        stage = "provider_failed",
                        provider = rotation.name(index),
                        kind = error_kind(&e),
                        consecutive_errors = errors,
                        error = %e,
                        "Completion provider failed, rotating"
                    );
                }
                Err(e)
            }
        }
    }

    fn finish_stream(
        &self,
        index: usize,
        first: Option<String>,
        rest: IdleTimeoutStream<CompletionStream>,
    ) -> CompletionStream {
        let Some(first) = first else {
            return futures::stream::empty().boxed();
        };
        let rotation = self.rotation.clone();
        let provider = self.providers[index].provider.name().to_string();
        let tail = rest.map(move |item| {
            item.map_err(|e| {
                let errors = rotation.lock().record_failure(index);
                warn!(
                    stage = "stream_interrupted",
                    provider = %provider,
                    consecutive_errors = errors,
                    error = %e,
                    "Stream failed after the first fragment"
                );
                match e {
                    ProviderError::Stream(_) => e,
                    other => ProviderError::Stream(other.to_string()),
                }
            })
        });
        futures::stream::once(async move { Ok(first) })
            .chain(tail)
            .boxed()
    }
}

impl std::fmt::Debug for GenerationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationGateway")
            .field(
                "providers",
                &self
                    .providers
                    .iter()
                    .map(|p| p.provider.name())
                    .collect::<Vec<_>>(),
            )
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        ChatMessage,
        test::{TestFailureMode, TestProvider},
    };

    fn settings(cooldown: Duration) -> GatewaySettings {
        GatewaySettings {
            error_threshold: 3,
            cooldown,
            timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(5),
        }
    }

    fn models() -> ProviderModels {
        ProviderModels {
            chat: "chat-model".into(),
            streaming: Some("stream-model".into()),
        }
    }

    fn gateway(
        providers: Vec<Arc<TestProvider>>,
        cooldown: Duration,
    ) -> GenerationGateway {
        let entries = providers
            .into_iter()
            .map(|p| GatewayProvider::new(p, models()))
            .collect();
        GenerationGateway::new(entries, settings(cooldown))
    }

    fn rate_limited(name: &str) -> Arc<TestProvider> {
        Arc::new(TestProvider::with_failure_mode(
            name,
            TestFailureMode::HttpError {
                status: 429,
                message: None,
            },
        ))
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("ping")])
    }

    #[tokio::test]
    async fn test_fails_over_to_next_provider() {
        let a = rate_limited("a");
        let b = Arc::new(TestProvider::new("b"));
        let gateway = gateway(vec![a.clone(), b.clone()], Duration::from_secs(60));

        let response = gateway.complete(&request()).await.unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(response.model, "chat-model");
        assert_eq!(response.content, "Echo: ping");
        assert_eq!(a.call_count(), 1);

        let health = gateway.health();
        assert_eq!(health[0].consecutive_errors, 1);
        assert_eq!(health[1].consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_provider_skipped_after_threshold() {
        let a = rate_limited("a");
        let b = Arc::new(TestProvider::new("b"));
        let gateway = gateway(vec![a.clone(), b.clone()], Duration::from_secs(60));

        for _ in 0..8 {
            let response = gateway.complete(&request()).await.unwrap();
            assert_eq!(response.provider, "b");
        }
        assert_eq!(a.call_count(), 3);
        assert_eq!(b.call_count(), 8);
        assert!(gateway.health()[0].cooling_down);
    }

    #[tokio::test]
    async fn test_provider_readmitted_after_cooldown() {
        let a = Arc::new(TestProvider::with_failure_mode(
            "a",
            TestFailureMode::HttpError {
                status: 503,
                message: None,
            },
        ));
        let b = Arc::new(TestProvider::new("b"));
        let gateway = gateway(vec![a.clone(), b], Duration::from_millis(200));

        for _ in 0..4 {
            gateway.complete(&request()).await.unwrap();
        }
        assert_eq!(a.call_count(), 3);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let response = gateway.complete(&request()).await.unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(a.call_count(), 4);
        // Readmission resets the counter before the new failure is recorded
        assert_eq!(gateway.health()[0].consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_exhausted_when_every_provider_fails() {
        let gateway = gateway(vec![rate_limited("a"), rate_limited("b")], Duration::from_secs(60));

        let err = gateway.complete(&request()).await.unwrap_err();
        match err {
            ProviderError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, ProviderError::RateLimited { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_providers() {
        let gateway = gateway(Vec::new(), Duration::from_secs(60));
        assert!(gateway.is_empty());
        assert!(matches!(
            gateway.complete(&request()).await,
            Err(ProviderError::NoProviders)
        ));
    }

    #[tokio::test]
    async fn test_timeout_rotates() {
        let slow = Arc::new(TestProvider::with_failure_mode(
            "slow",
            TestFailureMode::Timeout {
                delay: Duration::from_millis(50),
            },
        ));
        let gateway = gateway(
            vec![slow, Arc::new(TestProvider::new("b"))],
            Duration::from_secs(60),
        );
        assert_eq!(gateway.complete(&request()).await.unwrap().provider, "b");
    }

    #[tokio::test]
    async fn test_stream_fails_over_before_first_fragment() {
        let a = rate_limited("a");
        let b = Arc::new(TestProvider::new("b"));
        let gateway = gateway(vec![a.clone(), b], Duration::from_secs(60));

        let stream = gateway.stream(&request()).await.unwrap();
        let text: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(text.concat(), "Echo: ping");
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_after_first_fragment_is_returned() {
        let broken = Arc::new(TestProvider::with_failure_mode(
            "broken",
            TestFailureMode::StreamInterrupt { fragments: 1 },
        ));
        let b = Arc::new(TestProvider::new("b"));
        let gateway = gateway(vec![broken, b.clone()], Duration::from_secs(60));

        let items: Vec<_> = gateway.stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Echo: ");
        assert!(matches!(items[1], Err(ProviderError::Stream(_))));
        assert_eq!(b.call_count(), 0);
        assert_eq!(gateway.health()[0].consecutive_errors, 1);
    }

    #[test]
    fn test_from_config_requires_chat_model() {
        let config = GenerationConfig {
            providers: vec![crate::config::ProviderConfig {
                name: "a".into(),
                base_url: "http://localhost:1/v1".into(),
                api_key: None,
                models: ProviderModels {
                    chat: String::new(),
                    streaming: None,
                },
            }],
            ..Default::default()
        };
        let result = GenerationGateway::from_config(&config, reqwest::Client::new());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
