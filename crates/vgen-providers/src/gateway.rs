//! HTTP client for the generation gateway.
//!
//! The gateway fronts the hosted script, speech, image and caption models
//! behind one JSON API:
//!
//! | Endpoint         | Request                          | Response              |
//! |------------------|----------------------------------|-----------------------|
//! | `POST /script`   | `{topic, durationMs, style}`     | `{scenes: [...]}`     |
//! | `POST /speech`   | `{text}`                         | `{audio: "<base64>"}` |
//! | `POST /images`   | `{prompt, style}`                | `{images: [url, ..]}` |
//! | `POST /captions` | `{audioUrl}`                     | `{words: [...]}`      |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use vgen_models::{CaptionWord, GenerationConfig, Scene};

use crate::error::{ProviderError, ProviderResult};
use crate::traits::{CaptionGenerator, ImageGenerator, ScriptGenerator, SpeechSynthesizer};

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl GatewayConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("GATEWAY_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("GATEWAY_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: std::env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    prompt: &'a str,
    style: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptionRequest<'a> {
    audio_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScriptResponse {
    scenes: Vec<Scene>,
}

#[derive(Debug, Deserialize)]
struct SpeechResponse {
    audio: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CaptionResponse {
    #[serde(default)]
    words: Vec<CaptionWord>,
}

/// Client for the generation gateway. Implements all four generator contracts.
#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl GatewayClient {
    /// Create a new gateway client.
    pub fn new(config: GatewayConfig) -> ProviderResult<Self> {
        let mut base = config.base_url;
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ProviderError::request_failed(format!("Invalid gateway URL: {}", e)))?;

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> ProviderResult<Self> {
        Self::new(GatewayConfig::from_env())
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> ProviderResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ProviderError::request_failed(format!("Invalid endpoint {}: {}", path, e)))?;

        debug!("POST {}", url);
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Gateway {} returned {}: {}", path, status, error_text);
            let message = format!("{} returned {}: {}", path, status, error_text);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled(message),
                s if s.is_server_error() => ProviderError::ServiceUnavailable(message),
                _ => ProviderError::RequestFailed(message),
            });
        }

        response.json::<R>().await.map_err(|e| {
            ProviderError::invalid_response(format!("Failed to parse {} response: {}", path, e))
        })
    }
}

#[async_trait]
impl ScriptGenerator for GatewayClient {
    async fn generate_script(&self, config: &GenerationConfig) -> ProviderResult<Vec<Scene>> {
        let response: ScriptResponse = self.post("script", config).await?;
        if response.scenes.is_empty() {
            return Err(ProviderError::invalid_response("Script has no scenes"));
        }
        Ok(response.scenes)
    }
}

#[async_trait]
impl SpeechSynthesizer for GatewayClient {
    async fn synthesize(&self, text: &str) -> ProviderResult<String> {
        let response: SpeechResponse = self.post("speech", &SpeechRequest { text }).await?;
        if response.audio.is_empty() {
            return Err(ProviderError::invalid_response("Speech response has no audio"));
        }
        Ok(response.audio)
    }
}

#[async_trait]
impl ImageGenerator for GatewayClient {
    async fn generate_image(&self, prompt: &str, style: &str) -> ProviderResult<Vec<String>> {
        let response: ImageResponse = self.post("images", &ImageRequest { prompt, style }).await?;
        if response.images.is_empty() {
            return Err(ProviderError::invalid_response("Image response has no images"));
        }
        Ok(response.images)
    }
}

#[async_trait]
impl CaptionGenerator for GatewayClient {
    async fn generate_captions(&self, audio_url: &str) -> ProviderResult<Vec<CaptionWord>> {
        let response: CaptionResponse =
            self.post("captions", &CaptionRequest { audio_url }).await?;
        Ok(response.words)
    }
}
