//! Hugging Face Inference API provider.
//!
//! The API answers with raw image bytes, which are wrapped into a PNG
//! data URI. Free tier; tried first.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;

use super::{check_status, decode_error, transport_error, Artifact, ImageProvider, ProviderError};
use crate::config::ProviderEndpoint;

/// Provider name.
pub const NAME: &str = "huggingface";

const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co";
const MODEL: &str = "stabilityai/stable-diffusion-2-1";

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
}

/// Stable Diffusion through the Hugging Face Inference API.
pub struct HuggingFaceProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl HuggingFaceProvider {
    /// Create a provider. `None` or an empty key leaves it unconfigured.
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a provider from a `[providers.huggingface]` section.
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
impl ImageProvider for HuggingFaceProvider {
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

        let response = self
            .client
            .post(format!("{}/models/{MODEL}", self.base_url))
            .bearer_auth(api_key)
            .json(&InferenceRequest { inputs: prompt })
            .send()
            .await
            .map_err(|e| transport_error(NAME, e))?;

        let bytes = check_status(NAME, response)
            .await?
            .bytes()
            .await
            .map_err(|e| transport_error(NAME, e))?;

        if bytes.is_empty() {
            return Err(decode_error(NAME, "empty image body"));
        }
        Ok(Artifact::png_base64(&STANDARD.encode(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_or_blank_key_is_unconfigured() {
        let client = reqwest::Client::new();
        assert!(!HuggingFaceProvider::new(client.clone(), None).is_configured());
        assert!(!HuggingFaceProvider::new(client.clone(), Some("  ".into())).is_configured());
        assert!(HuggingFaceProvider::new(client, Some("hf_x".into())).is_configured());
    }

    #[tokio::test]
    async fn test_generate_without_key_is_not_configured_error() {
        let provider = HuggingFaceProvider::new(reqwest::Client::new(), None);
        assert!(matches!(
            provider.generate("p").await,
            Err(ProviderError::NotConfigured { .. })
        ));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let provider = HuggingFaceProvider::new(reqwest::Client::new(), None)
            .with_base_url("http://localhost:1234/");
        assert_eq!(provider.base_url, "http://localhost:1234");
    }
}
