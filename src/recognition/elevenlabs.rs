use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;

use super::{BackendError, SpeechBackend};
use crate::audio::Utterance;
use crate::config::ElevenLabsConfig;

/// ElevenLabs speech-to-text, the legacy deployment's default provider.
pub struct ElevenLabsBackend {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model_id: String,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpeechToTextResponse {
    text: String,
}

impl ElevenLabsBackend {
    pub fn new(config: &ElevenLabsConfig, language: Option<String>) -> Result<Self, BackendError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or(BackendError::MissingCredentials("ElevenLabs"))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            url: config.url.clone(),
            model_id: config.model_id.clone(),
            language,
        })
    }
}

#[async_trait]
impl SpeechBackend for ElevenLabsBackend {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, BackendError> {
        let file_part = multipart::Part::bytes(utterance.to_wav()?)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let mut form = multipart::Form::new()
            .part("file", file_part)
            .text("model_id", self.model_id.clone())
            .text("tag_audio_events", "false")
            .text("timestamps_granularity", "none");

        if let Some(language) = &self.language {
            form = form.text("language_code", language.clone());
        }

        tracing::debug!(
            model = %self.model_id,
            seconds = utterance.duration_secs(),
            "Sending audio to ElevenLabs"
        );

        let response = self
            .client
            .post(&self.url)
            .header("xi-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(BackendError::Protocol(format!("status {}: {}", status, body)));
        }

        let parsed: SpeechToTextResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("body: {}", e)))?;

        Ok(parsed.text.trim().to_string())
    }
}
