//! Stability AI text-to-image provider (SDXL). Returns base64 PNG data.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check_status, decode_error, transport_error, Artifact, ImageProvider, ProviderError};
use crate::config::ProviderEndpoint;

/// Provider name.
pub const NAME: &str = "stability";

const DEFAULT_BASE_URL: &str = "https://api.stability.ai";
const ENGINE: &str = "stable-diffusion-xl-1024-v1-0";

#[derive(Debug, Serialize)]
struct TextPrompt<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct TextToImageRequest<'a> {
    text_prompts: [TextPrompt<'a>; 1],
    cfg_scale: u32,
    height: u32,
    width: u32,
    samples: u32,
    steps: u32,
}

#[derive(Debug, Deserialize)]
struct TextToImageResponse {
    #[serde(default)]
    artifacts: Vec<GeneratedArtifact>,
}

#[derive(Debug, Deserialize)]
struct GeneratedArtifact {
    base64: Option<String>,
}

/// SDXL through the Stability AI REST API.
pub struct StabilityProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl StabilityProvider {
    /// Create a provider. `None` or an empty key leaves it unconfigured.
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a provider from a `[providers.stability]` section.
    pub fn from_endpoint(client: reqwest::Client, endpoint: &ProviderEndpoint) -> Self {
        let provider = Self::new(client, endpoint.api_key());
        match &endpoint.base_url {
            Some(url) => provider.with_base_url(url.clone()),
            None => provider,
        }
    }

    /// Point the provider at a different host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ImageProvider for StabilityProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, prompt: &str) -> Result<Artifact, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| ProviderError::NotConfigured {
            provider: NAME.to_string(),
        })?;

        let request = TextToImageRequest {
            text_prompts: [TextPrompt { text: prompt }],
            cfg_scale: 7,
            height: 1024,
            width: 1024,
            samples: 1,
            steps: 30,
        };

        let response = self
            .client
            .post(format!(
                "{}/v1/generation/{ENGINE}/text-to-image",
                self.base_url
            ))
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(NAME, e))?;

        let body: TextToImageResponse = check_status(NAME, response)
            .await?
            .json()
            .await
            .map_err(|e| decode_error(NAME, e.to_string()))?;

        body.artifacts
            .into_iter()
            .next()
            .and_then(|a| a.base64)
            .filter(|b| !b.is_empty())
            .map(|b| Artifact::png_base64(&b))
            .ok_or_else(|| decode_error(NAME, "no artifact in response"))
    }
}
