use async_trait::async_trait;
use reqwest::multipart;

use super::{BackendError, SpeechBackend};
use crate::audio::Utterance;
use crate::config::OpenAiConfig;

/// OpenAI-compatible `/audio/transcriptions` endpoint (OpenAI, Groq, local servers).
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    language: Option<String>,
}

impl OpenAiBackend {
    pub fn new(config: &OpenAiConfig, language: Option<String>) -> Result<Self, BackendError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or(BackendError::MissingCredentials("OpenAI"))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            language,
        })
    }
}

#[async_trait]
impl SpeechBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, BackendError> {
        let url = format!("{}/audio/transcriptions", self.base_url);

        let file_part = multipart::Part::bytes(utterance.to_wav()?)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", file_part);

        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        tracing::debug!(model = %self.model, "Sending audio to OpenAI-compatible API");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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

        let transcript = response
            .text()
            .await
            .map_err(|e| BackendError::Protocol(format!("body: {}", e)))?;

        Ok(transcript.trim().to_string())
    }
}
