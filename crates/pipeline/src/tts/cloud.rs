//! HTTP cloud speech provider
//!
//! Posts text to `{endpoint}/v1/text-to-speech/{voice_id}` and returns the
//! MPEG audio body. Status codes are preserved in [`CloudTtsError::Status`]
//! so callers can tell a dead service (5xx) from a bad request (4xx).

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Serialize;

use avatar_config::CloudTtsConfig;
use avatar_core::{CloudSpeechProvider, CloudTtsError};

const API_KEY_HEADER: &str = "xi-api-key";

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

pub struct HttpCloudTts {
    config: CloudTtsConfig,
    client: reqwest::Client,
}

impl HttpCloudTts {
    pub fn new(config: CloudTtsConfig) -> Result<Self, CloudTtsError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CloudTtsError::Transport(format!("failed to create HTTP client: {e}")))?;

        if config.is_configured() {
            tracing::info!(
                endpoint = %config.endpoint,
                model = %config.model_id,
                "Cloud speech provider configured"
            );
        } else {
            tracing::info!("Cloud speech provider has no credentials, local speech only");
        }

        Ok(Self { config, client })
    }

    fn synthesis_url(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{}",
            self.config.endpoint.trim_end_matches('/'),
            voice_id
        )
    }
}

#[async_trait]
impl CloudSpeechProvider for HttpCloudTts {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CloudTtsError> {
        let (Some(api_key), Some(voice_id)) = (
            self.config.api_key.as_deref(),
            self.config.voice_id.as_deref(),
        ) else {
            return Err(CloudTtsError::NotConfigured);
        };
        if !self.is_configured() {
            return Err(CloudTtsError::NotConfigured);
        }

        let request = SynthesisRequest {
            text,
            model_id: &self.config.model_id,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        };

        let response = self
            .client
            .post(self.synthesis_url(voice_id))
            .header(API_KEY_HEADER, api_key)
            .header(ACCEPT, self.mime_type())
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudTtsError::Status { status, body });
        }

        let audio = response.bytes().await.map_err(map_transport_error)?;
        tracing::debug!(bytes = audio.len(), chars = text.chars().count(), "Synthesized speech");
        Ok(audio.to_vec())
    }

    fn name(&self) -> &str {
        "elevenlabs"
    }
}

fn map_transport_error(e: reqwest::Error) -> CloudTtsError {
    if e.is_timeout() {
        CloudTtsError::Timeout
    } else {
        CloudTtsError::Transport(e.to_string())
    }
}
