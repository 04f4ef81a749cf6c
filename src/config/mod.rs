//! # Stage: Declarative Decoder Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that sizes the decoder core:
//! ```text
//! dream-decoder --config dream-decoder.toml
//! ```
//!
//! ## Guarantees
//! - Every field has a default; an empty file is a valid configuration
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//! - Secrets never live here: provider API keys are read from the
//!   environment variable each provider section names
//!
//! ## NOT Responsible For
//! - Building components from config (each component has `from_config`)
//! - Hot reloading

pub mod loader;
pub mod validation;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Provider names understood by [`ProvidersConfig::order`].
pub const KNOWN_PROVIDERS: [&str; 3] = ["huggingface", "openai", "stability"];

// ── Default value functions ──────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

/// 10 MiB.
fn default_max_request_size() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_requests_per_window() -> usize {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_bypass_paths() -> Vec<String> {
    ["/", "/health", "/docs", "/openapi.json"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_workers() -> usize {
    2
}

fn default_dead_letter_capacity() -> usize {
    100
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_provider_order() -> Vec<String> {
    KNOWN_PROVIDERS.iter().map(|s| s.to_string()).collect()
}

fn default_huggingface() -> ProviderEndpoint {
    ProviderEndpoint::with_key_env("HUGGINGFACE_API_KEY")
}

fn default_openai() -> ProviderEndpoint {
    ProviderEndpoint::with_key_env("OPENAI_API_KEY")
}

fn default_stability() -> ProviderEndpoint {
    ProviderEndpoint::with_key_env("STABILITY_API_KEY")
}

fn default_history_ttl_secs() -> u64 {
    30
}

fn default_history_source_timeout_ms() -> u64 {
    2000
}

fn default_history_limit() -> usize {
    3
}

fn default_history_max_records() -> usize {
    crate::persistence::DEFAULT_MAX_RECORDS
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one decoder process.
///
/// # Example
///
/// ```toml
/// [server]
/// port = 8080
///
/// [rate_limit]
/// requests_per_window = 20
/// window_secs = 60
///
/// [providers]
/// order = ["openai", "stability"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Admission control.
    pub rate_limit: RateLimitConfig,
    /// CPU offload pool.
    pub offload: OffloadConfig,
    /// Fire-and-forget tasks.
    pub background: BackgroundConfig,
    /// Image provider chain.
    pub providers: ProvidersConfig,
    /// History cache.
    pub history: HistoryConfig,
}

// ── Sections ─────────────────────────────────────────────────────────────

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body in bytes; larger bodies get 413.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Sliding-window admission control.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RateLimitConfig {
    /// When false every request is admitted.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Admissions allowed per identity per window.
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: usize,
    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// How often idle identities are dropped.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Request paths that are never counted.
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            bypass_paths: default_bypass_paths(),
        }
    }
}

impl RateLimitConfig {
    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// CPU offload pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OffloadConfig {
    /// Number of concurrent compute jobs.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Background task settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackgroundConfig {
    /// Failed tasks kept for inspection.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
    /// Spawn an image task after every prediction.
    #[serde(default)]
    pub generate_image_on_predict: bool,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            dead_letter_capacity: default_dead_letter_capacity(),
            generate_image_on_predict: false,
        }
    }
}

/// Connection settings for one hosted image provider.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProviderEndpoint {
    /// Override of the provider's public API base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Call budget for this provider; `providers.timeout_secs` when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderEndpoint {
    fn with_key_env(var: &str) -> Self {
        Self {
            base_url: None,
            api_key_env: var.to_string(),
            timeout_secs: None,
        }
    }

    /// Read the API key from the environment. Empty values count as unset.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Image provider chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProvidersConfig {
    /// Budget for a single provider call, unless the provider's own
    /// section overrides it.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempt order. Names come from [`KNOWN_PROVIDERS`].
    #[serde(default = "default_provider_order")]
    pub order: Vec<String>,
    /// Hugging Face inference API.
    #[serde(default = "default_huggingface")]
    pub huggingface: ProviderEndpoint,
    /// OpenAI images API.
    #[serde(default = "default_openai")]
    pub openai: ProviderEndpoint,
    /// Stability AI API.
    #[serde(default = "default_stability")]
    pub stability: ProviderEndpoint,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_provider_timeout_secs(),
            order: default_provider_order(),
            huggingface: default_huggingface(),
            openai: default_openai(),
            stability: default_stability(),
        }
    }
}

impl ProvidersConfig {
    /// Default per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Call budget for `endpoint`: its own `timeout_secs` if set, else the
    /// chain default.
    pub fn timeout_for(&self, endpoint: &ProviderEndpoint) -> Duration {
        Duration::from_secs(endpoint.timeout_secs.unwrap_or(self.timeout_secs))
    }
}

/// History endpoint cache.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HistoryConfig {
    /// How long a fetched history stays fresh.
    #[serde(default = "default_history_ttl_secs")]
    pub ttl_secs: u64,
    /// Budget for one read from the store.
    #[serde(default = "default_history_source_timeout_ms")]
    pub source_timeout_ms: u64,
    /// Entries returned.
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    /// Predictions kept by the in-process store; the oldest go first.
    #[serde(default = "default_history_max_records")]
    pub max_records: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_history_ttl_secs(),
            source_timeout_ms: default_history_source_timeout_ms(),
            limit: default_history_limit(),
            max_records: default_history_max_records(),
        }
    }
}

// ── Schema export ────────────────────────────────────────────────────────

/// Export the JSON Schema for [`DecoderConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(DecoderConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let c = DecoderConfig::default();
        assert_eq!(c.server.port, 8000);
        assert_eq!(c.server.max_request_size, 10 * 1024 * 1024);
        assert_eq!(c.rate_limit.requests_per_window, 100);
        assert_eq!(c.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(c.offload.workers, 2);
        assert_eq!(c.background.dead_letter_capacity, 100);
        assert!(!c.background.generate_image_on_predict);
        assert_eq!(c.providers.timeout(), Duration::from_secs(60));
        assert_eq!(c.providers.order, vec!["huggingface", "openai", "stability"]);
        assert_eq!(c.history.ttl_secs, 30);
        assert_eq!(c.history.limit, 3);
        assert_eq!(c.history.max_records, 1000);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let c: DecoderConfig = toml::from_str("").unwrap();
        assert_eq!(c, DecoderConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let c: DecoderConfig = toml::from_str("[rate_limit]\nrequests_per_window = 3\n").unwrap();
        assert_eq!(c.rate_limit.requests_per_window, 3);
        assert_eq!(c.rate_limit.window_secs, 60);
        assert!(c.rate_limit.bypass_paths.contains(&"/health".to_string()));
    }

    #[test]
    fn test_provider_endpoint_override() {
        let c: DecoderConfig = toml::from_str(
            "[providers.openai]\nbase_url = \"http://localhost:9999\"\napi_key_env = \"MY_KEY\"\n",
        )
        .unwrap();
        assert_eq!(
            c.providers.openai.base_url.as_deref(),
            Some("http://localhost:9999")
        );
        assert_eq!(c.providers.openai.api_key_env, "MY_KEY");
        assert_eq!(c.providers.openai.timeout_secs, None);
        assert_eq!(c.providers.stability.api_key_env, "STABILITY_API_KEY");
    }

    #[test]
    fn test_provider_timeout_override_falls_back_to_default() {
        let c: DecoderConfig = toml::from_str(
            "[providers]\ntimeout_secs = 20\n\n[providers.stability]\napi_key_env = \"K\"\ntimeout_secs = 90\n",
        )
        .unwrap();
        assert_eq!(
            c.providers.timeout_for(&c.providers.stability),
            Duration::from_secs(90)
        );
        assert_eq!(
            c.providers.timeout_for(&c.providers.openai),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn test_unset_api_key_env_is_none() {
        let endpoint = ProviderEndpoint::with_key_env("DREAM_DECODER_TEST_KEY_THAT_IS_NEVER_SET");
        assert!(endpoint.api_key().is_none());
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&schema).unwrap();
        assert!(parsed.get("properties").is_some());
    }
}
