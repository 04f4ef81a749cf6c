//! OpenAI images API provider (DALL·E 3). Returns a hosted URL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check_status, decode_error, transport_error, Artifact, ImageProvider, ProviderError};
use crate::config::ProviderEndpoint;

/// Provider name.
pub const NAME: &str = "openai";

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    quality: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
}

/// DALL·E through the OpenAI images endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    /// Create a provider. `None` or an empty key leaves it unconfigured.
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "dall-e-3".to_string(),
        }
    }

    /// Create a provider from a `[providers.openai]` section.
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
impl ImageProvider for OpenAiProvider {
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

        let request = ImageRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: "1024x1024",
            quality: "standard",
        };

        let response = self
            .client
            .post(format!("{}/v1/images/generations", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(NAME, e))?;

        let body: ImageResponse = check_status(NAME, response)
            .await?
            .json()
            .await
            .map_err(|e| decode_error(NAME, e.to_string()))?;

        body.data
            .into_iter()
            .next()
            .and_then(|d| d.url)
            .filter(|u| !u.is_empty())
            .map(Artifact::Url)
            .ok_or_else(|| decode_error(NAME, "no image url in response"))
    }
}
