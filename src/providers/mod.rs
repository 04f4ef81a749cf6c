//! # Stage: Image Provider Chain
//!
//! ## Responsibility
//! Turn a dream prompt into an image by trying hosted providers one at a
//! time, in a fixed priority order, and falling back to a locally rendered
//! placeholder when every provider is unconfigured or fails.
//!
//! ## Guarantees
//! - Infallible: [`ProviderChain::resolve`] always returns an artifact
//! - Sequential: at most one provider call is in flight per resolve
//! - Bounded: each call runs under its provider's own timeout budget
//! - Unconfigured providers are skipped without any network I/O
//!
//! ## NOT Responsible For
//! - Building the prompt (see [`prompt`])
//! - Retrying a provider that failed

pub mod huggingface;
pub mod local;
pub mod openai;
pub mod prompt;
pub mod stability;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ProvidersConfig;
use crate::metrics;

pub use huggingface::HuggingFaceProvider;
pub use local::LocalPlaceholder;
pub use openai::OpenAiProvider;
pub use prompt::DreamPrompt;
pub use stability::StabilityProvider;

/// A generated image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    /// Hosted image the client fetches itself.
    Url(String),
    /// Inline `data:` URI carrying the encoded image.
    DataUri(String),
}

impl Artifact {
    /// The URL or data URI text.
    pub fn as_str(&self) -> &str {
        match self {
            Artifact::Url(s) | Artifact::DataUri(s) => s,
        }
    }

    /// Build a `data:image/png;base64,…` artifact from raw base64 text.
    pub fn png_base64(encoded: &str) -> Self {
        Artifact::DataUri(format!("data:image/png;base64,{encoded}"))
    }
}

/// Why one provider call did not produce an image.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// No API key is available.
    #[error("{provider} is not configured")]
    NotConfigured {
        /// Provider name.
        provider: String,
    },

    /// The call exceeded the provider's call budget.
    #[error("{provider} timed out after {timeout_ms}ms")]
    Timeout {
        /// Provider name.
        provider: String,
        /// The budget that was exceeded.
        timeout_ms: u64,
    },

    /// The provider answered with a non-success status.
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        /// Provider name.
        provider: String,
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The request never produced a response.
    #[error("{provider} request failed: {reason}")]
    Transport {
        /// Provider name.
        provider: String,
        /// Underlying client error.
        reason: String,
    },

    /// The response did not contain an image.
    #[error("{provider} response unusable: {reason}")]
    Decode {
        /// Provider name.
        provider: String,
        /// What was wrong with the body.
        reason: String,
    },
}

impl ProviderError {
    /// Short label used for the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured { .. } => "skipped",
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Status { .. } => "status",
            ProviderError::Transport { .. } => "transport",
            ProviderError::Decode { .. } => "decode",
        }
    }
}

/// Longest error body kept in [`ProviderError::Status`].
const MAX_ERROR_BODY: usize = 256;

/// Map a non-2xx response to [`ProviderError::Status`], pass others through.
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ProviderError::Status {
        provider: provider.to_string(),
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> ProviderError {
    ProviderError::Transport {
        provider: provider.to_string(),
        reason: e.to_string(),
    }
}

pub(crate) fn decode_error(provider: &str, reason: impl Into<String>) -> ProviderError {
    ProviderError::Decode {
        provider: provider.to_string(),
        reason: reason.into(),
    }
}

/// An external text-to-image service.
///
/// Implementations must be `Send + Sync`; the chain holds them behind `Arc`.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Stable provider name, used in logs, metrics and responses.
    fn name(&self) -> &str;

    /// False when the provider cannot be called, e.g. no API key.
    fn is_configured(&self) -> bool;

    /// Generate one image for `prompt`.
    ///
    /// # Errors
    ///
    /// Any [`ProviderError`]; the chain moves on to the next provider.
    async fn generate(&self, prompt: &str) -> Result<Artifact, ProviderError>;
}

/// Outcome of one step of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// The provider produced the artifact.
    Succeeded,
    /// The provider was not configured and never called.
    Skipped,
    /// The provider was called and failed.
    Failed,
}

/// One step of a [`ProviderChain::resolve`] run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptReport {
    /// Provider name.
    pub provider: String,
    /// What happened.
    pub status: AttemptStatus,
    /// Error text for failed attempts.
    pub error: Option<String>,
    /// Time spent in the call.
    pub elapsed_ms: u64,
    /// Budget the call ran under.
    pub timeout_ms: u64,
}

/// The chain's answer: an artifact plus how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedArtifact {
    /// The image.
    pub artifact: Artifact,
    /// Provider that produced it ([`local::PLACEHOLDER_NAME`] for the fallback).
    pub provider: String,
    /// Every provider step in order.
    pub attempts: Vec<AttemptReport>,
}

impl ResolvedArtifact {
    /// True if every hosted provider was skipped or failed.
    pub fn is_placeholder(&self) -> bool {
        self.provider == local::PLACEHOLDER_NAME
    }
}

/// Whether a provider can currently be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderAvailability {
    /// Provider name.
    pub name: String,
    /// True if the provider would be called.
    pub configured: bool,
}

/// One provider and the budget for each of its calls.
#[derive(Clone)]
struct ProviderSlot {
    provider: Arc<dyn ImageProvider>,
    timeout: Duration,
}

/// Ordered, immutable list of image providers.
#[derive(Clone)]
pub struct ProviderChain {
    providers: Vec<ProviderSlot>,
    timeout: Duration,
    placeholder: LocalPlaceholder,
}

impl ProviderChain {
    /// Build a chain trying `providers` in the given order, every call
    /// bounded by `timeout`.
    pub fn new(providers: Vec<Arc<dyn ImageProvider>>, timeout: Duration) -> Self {
        Self::with_budgets(
            providers.into_iter().map(|p| (p, timeout)).collect(),
            timeout,
        )
    }

    /// Build a chain where each provider carries its own call budget.
    /// `default_timeout` is what [`ProviderChain::timeout`] reports.
    pub fn with_budgets(
        providers: Vec<(Arc<dyn ImageProvider>, Duration)>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|(provider, timeout)| ProviderSlot { provider, timeout })
                .collect(),
            timeout: default_timeout,
            placeholder: LocalPlaceholder,
        }
    }

    /// Chain with no hosted providers; always yields the placeholder.
    pub fn placeholder_only() -> Self {
        Self::new(Vec::new(), Duration::from_secs(60))
    }

    /// Build the hosted providers named in `config.order`, sharing one
    /// HTTP client. API keys come from the environment.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let client = reqwest::Client::new();
        let providers = config
            .order
            .iter()
            .filter_map(|name| -> Option<(Arc<dyn ImageProvider>, Duration)> {
                match name.as_str() {
                    huggingface::NAME => Some((
                        Arc::new(HuggingFaceProvider::from_endpoint(
                            client.clone(),
                            &config.huggingface,
                        )),
                        config.timeout_for(&config.huggingface),
                    )),
                    openai::NAME => Some((
                        Arc::new(OpenAiProvider::from_endpoint(client.clone(), &config.openai)),
                        config.timeout_for(&config.openai),
                    )),
                    stability::NAME => Some((
                        Arc::new(StabilityProvider::from_endpoint(
                            client.clone(),
                            &config.stability,
                        )),
                        config.timeout_for(&config.stability),
                    )),
                    other => {
                        warn!(provider = other, "unknown image provider ignored");
                        None
                    }
                }
            })
            .collect();
        Self::with_budgets(providers, config.timeout())
    }

    /// Default per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call budget of every hosted provider, in order.
    pub fn budgets(&self) -> Vec<(String, Duration)> {
        self.providers
            .iter()
            .map(|slot| (slot.provider.name().to_string(), slot.timeout))
            .collect()
    }

    /// Number of hosted providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True if there are no hosted providers.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Configuration state of every provider, placeholder last.
    pub fn availability(&self) -> Vec<ProviderAvailability> {
        self.providers
            .iter()
            .map(|slot| &slot.provider)
            .map(|p| ProviderAvailability {
                name: p.name().to_string(),
                configured: p.is_configured(),
            })
            .chain(std::iter::once(ProviderAvailability {
                name: local::PLACEHOLDER_NAME.to_string(),
                configured: true,
            }))
            .collect()
    }

    /// Produce an image for `prompt`. Never fails.
    pub async fn resolve(&self, prompt: &str) -> ResolvedArtifact {
        let span = info_span!("providers.resolve", providers = self.providers.len());
        self.resolve_inner(prompt).instrument(span).await
    }

    async fn resolve_inner(&self, prompt: &str) -> ResolvedArtifact {
        let mut attempts = Vec::with_capacity(self.providers.len());

        for ProviderSlot { provider, timeout } in &self.providers {
            let name = provider.name().to_string();
            let timeout_ms = timeout.as_millis() as u64;
            if !provider.is_configured() {
                debug!(provider = %name, "provider not configured, skipping");
                metrics::inc_provider_attempt(&name, "skipped");
                attempts.push(AttemptReport {
                    provider: name,
                    status: AttemptStatus::Skipped,
                    error: None,
                    elapsed_ms: 0,
                    timeout_ms,
                });
                continue;
            }

            let started = tokio::time::Instant::now();
            let result = match tokio::time::timeout(*timeout, provider.generate(prompt)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: name.clone(),
                    timeout_ms,
                }),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(artifact) => {
                    info!(provider = %name, elapsed_ms, "image generated");
                    metrics::inc_provider_attempt(&name, "ok");
                    attempts.push(AttemptReport {
                        provider: name.clone(),
                        status: AttemptStatus::Succeeded,
                        error: None,
                        elapsed_ms,
                        timeout_ms,
                    });
                    return ResolvedArtifact {
                        artifact,
                        provider: name,
                        attempts,
                    };
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, elapsed_ms, "provider failed, trying next");
                    metrics::inc_provider_attempt(&name, e.outcome());
                    attempts.push(AttemptReport {
                        provider: name,
                        status: AttemptStatus::Failed,
                        error: Some(e.to_string()),
                        elapsed_ms,
                        timeout_ms,
                    });
                }
            }
        }

        info!("all providers exhausted, rendering placeholder");
        metrics::inc_provider_attempt(local::PLACEHOLDER_NAME, "ok");
        ResolvedArtifact {
            artifact: self.placeholder.render(prompt),
            provider: local::PLACEHOLDER_NAME.to_string(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Succeed(&'static str),
        Fail,
        Hang,
    }

    struct FakeProvider {
        name: &'static str,
        configured: bool,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(name: &'static str, configured: bool, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                configured,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn generate(&self, _prompt: &str) -> Result<Artifact, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed(url) => Ok(Artifact::Url(url.to_string())),
                Behavior::Fail => Err(ProviderError::Status {
                    provider: self.name.to_string(),
                    status: 503,
                    body: "overloaded".into(),
                }),
                Behavior::Hang => {
                    futures::future::pending::<()>().await;
                    Err(decode_error(self.name, "unreachable"))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_empty_chain_returns_placeholder() {
        let resolved = ProviderChain::placeholder_only().resolve("a quiet forest").await;
        assert!(resolved.is_placeholder());
        assert!(resolved.attempts.is_empty());
        assert!(matches!(resolved.artifact, Artifact::DataUri(ref s) if s.starts_with("data:image/svg+xml;base64,")));
    }

    #[tokio::test]
    async fn test_first_success_wins_and_later_providers_untouched() {
        let a = FakeProvider::new("a", true, Behavior::Succeed("https://a/img.png"));
        let b = FakeProvider::new("b", true, Behavior::Succeed("https://b/img.png"));
        let providers: Vec<Arc<dyn ImageProvider>> = vec![a.clone(), b.clone()];
        let chain = ProviderChain::new(providers, Duration::from_secs(5));

        let resolved = chain.resolve("p").await;
        assert_eq!(resolved.provider, "a");
        assert_eq!(resolved.artifact, Artifact::Url("https://a/img.png".into()));
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_skipped_without_call() {
        let a = FakeProvider::new("a", false, Behavior::Succeed("https://a"));
        let b = FakeProvider::new("b", true, Behavior::Succeed("https://b"));
        let providers: Vec<Arc<dyn ImageProvider>> = vec![a.clone(), b];
        let chain = ProviderChain::new(providers, Duration::from_secs(5));

        let resolved = chain.resolve("p").await;
        assert_eq!(resolved.provider, "b");
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolved.attempts[0].status, AttemptStatus::Skipped);
    }

    #[tokio::test]
    async fn test_failure_falls_through_to_next() {
        let a = FakeProvider::new("a", true, Behavior::Fail);
        let b = FakeProvider::new("b", true, Behavior::Succeed("https://b"));
        let providers: Vec<Arc<dyn ImageProvider>> = vec![a, b];
        let chain = ProviderChain::new(providers, Duration::from_secs(5));

        let resolved = chain.resolve("p").await;
        assert_eq!(resolved.provider, "b");
        assert_eq!(resolved.attempts[0].status, AttemptStatus::Failed);
        assert!(resolved.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_success_takes_one_budget() {
        let a = FakeProvider::new("a", true, Behavior::Hang);
        let b = FakeProvider::new("b", true, Behavior::Succeed("https://b"));
        let providers: Vec<Arc<dyn ImageProvider>> = vec![a, b];
        let chain = ProviderChain::new(providers, Duration::from_secs(60));

        let start = tokio::time::Instant::now();
        let resolved = chain.resolve("p").await;
        let elapsed = start.elapsed();

        assert_eq!(resolved.provider, "b");
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));
        assert!(resolved.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_provider_runs_under_its_own_budget() {
        let a = FakeProvider::new("a", true, Behavior::Hang);
        let b = FakeProvider::new("b", true, Behavior::Succeed("https://b"));
        let chain = ProviderChain::with_budgets(
            vec![
                (a as Arc<dyn ImageProvider>, Duration::from_secs(1)),
                (b as Arc<dyn ImageProvider>, Duration::from_secs(5)),
            ],
            Duration::from_secs(60),
        );

        let start = tokio::time::Instant::now();
        let resolved = chain.resolve("p").await;
        let elapsed = start.elapsed();

        assert_eq!(resolved.provider, "b");
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(resolved.attempts[0].timeout_ms, 1000);
        assert_eq!(resolved.attempts[1].timeout_ms, 5000);
        assert!(resolved.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out after 1000ms"));
    }

    #[test]
    fn test_from_config_applies_provider_timeout_override() {
        let mut config = ProvidersConfig::default();
        config.timeout_secs = 30;
        config.openai.timeout_secs = Some(5);
        let chain = ProviderChain::from_config(&config);
        assert_eq!(
            chain.budgets(),
            vec![
                ("huggingface".to_string(), Duration::from_secs(30)),
                ("openai".to_string(), Duration::from_secs(5)),
                ("stability".to_string(), Duration::from_secs(30)),
            ]
        );
        assert_eq!(chain.timeout(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failing_yields_placeholder() {
        let providers: Vec<Arc<dyn ImageProvider>> = vec![
            FakeProvider::new("a", true, Behavior::Hang),
            FakeProvider::new("b", true, Behavior::Fail),
            FakeProvider::new("c", false, Behavior::Fail),
        ];
        let chain = ProviderChain::new(providers, Duration::from_secs(1));
        let resolved = chain.resolve("p").await;
        assert!(resolved.is_placeholder());
        assert_eq!(resolved.attempts.len(), 3);
    }

    #[test]
    fn test_availability_lists_placeholder_last() {
        let providers: Vec<Arc<dyn ImageProvider>> = vec![
            FakeProvider::new("a", false, Behavior::Fail),
            FakeProvider::new("b", true, Behavior::Fail),
        ];
        let chain = ProviderChain::new(providers, Duration::from_secs(1));
        let names: Vec<_> = chain
            .availability()
            .into_iter()
            .map(|a| (a.name, a.configured))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), true),
                (local::PLACEHOLDER_NAME.to_string(), true),
            ]
        );
    }

    #[test]
    fn test_from_config_respects_order() {
        let mut config = ProvidersConfig::default();
        config.order = vec!["stability".into(), "openai".into()];
        let chain = ProviderChain::from_config(&config);
        let names: Vec<_> = chain.availability().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["stability", "openai", local::PLACEHOLDER_NAME]);
    }

    #[test]
    fn test_artifact_serializes_with_kind_tag() {
        let json = serde_json::to_value(Artifact::Url("https://x".into())).unwrap();
        assert_eq!(json["kind"], "url");
        assert_eq!(json["value"], "https://x");
    }
}
