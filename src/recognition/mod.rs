//! # Recognition Gateway
//!
//! Sends a finished [`Utterance`] to speech-to-text backends and returns the
//! first transcript one of them produces.
//!
//! ## Backends:
//! - **elevenlabs**: ElevenLabs speech-to-text REST API
//! - **openai**: any OpenAI-compatible `/audio/transcriptions` endpoint
//! - **wyoming**: a Wyoming protocol server over TCP
//! - **whisper**: local candle Whisper inference
//!
//! ## Fallback Chain:
//! Backends are built once at startup in configured order. A backend that
//! is missing credentials or an address is left out of the chain with a
//! warning. At request time each backend gets a bounded wait; an error or a
//! timeout moves on to the next one. Only when every backend has failed is
//! the request a terminal failure.
//!
//! An empty transcript is a valid answer (no speech detected) and does not
//! trigger fallback.

pub mod elevenlabs;
pub mod openai;
pub mod whisper;
pub mod wyoming;

use crate::audio::Utterance;
use crate::config::RecognitionConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors a single backend call can produce.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0} API key is not configured")]
    MissingCredentials(&'static str),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("engine error: {0}")]
    Engine(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Request(err.to_string())
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Request(err.to_string())
    }
}

impl From<hound::Error> for BackendError {
    fn from(err: hound::Error) -> Self {
        BackendError::Engine(format!("wav encoding failed: {}", err))
    }
}

/// One speech-to-text implementation.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Recognize the utterance. `Ok("")` means no speech was found.
    async fn transcribe(&self, utterance: &Utterance) -> Result<String, BackendError>;
}

/// The closed set of backends selectable in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    ElevenLabs,
    OpenAi,
    Wyoming,
    Whisper,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "elevenlabs" => Ok(BackendKind::ElevenLabs),
            "openai" => Ok(BackendKind::OpenAi),
            "wyoming" => Ok(BackendKind::Wyoming),
            "whisper" | "local" => Ok(BackendKind::Whisper),
            _ => Err(anyhow::anyhow!("Unknown recognition backend: {}", s)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::ElevenLabs => "elevenlabs",
            BackendKind::OpenAi => "openai",
            BackendKind::Wyoming => "wyoming",
            BackendKind::Whisper => "whisper",
        };
        write!(f, "{}", name)
    }
}

impl BackendKind {
    /// Construct the backend from its configuration section.
    pub fn build(self, config: &RecognitionConfig) -> Result<Arc<dyn SpeechBackend>, BackendError> {
        let language = config.language.clone();
        let backend: Arc<dyn SpeechBackend> = match self {
            BackendKind::ElevenLabs => Arc::new(elevenlabs::ElevenLabsBackend::new(
                &config.elevenlabs,
                language,
            )?),
            BackendKind::OpenAi => Arc::new(openai::OpenAiBackend::new(&config.openai, language)?),
            BackendKind::Wyoming => Arc::new(wyoming::WyomingBackend::new(&config.wyoming, language)?),
            BackendKind::Whisper => Arc::new(whisper::WhisperBackend::new(&config.whisper, language)),
        };
        Ok(backend)
    }
}

/// Successful recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcription {
    pub text: String,
    pub backend: &'static str,
    /// Backends that failed before this one answered.
    pub failed_attempts: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no recognition backend is available")]
    NoBackends,

    #[error("all {} recognition backends failed", .attempts.len())]
    AllFailed {
        attempts: Vec<(&'static str, BackendError)>,
    },
}

/// Ordered backend chain with a per-call deadline.
pub struct TranscriptionGateway {
    backends: Vec<Arc<dyn SpeechBackend>>,
    timeout: Duration,
}

impl TranscriptionGateway {
    pub fn new(backends: Vec<Arc<dyn SpeechBackend>>, timeout: Duration) -> Self {
        Self { backends, timeout }
    }

    /// Build the configured chain, leaving out backends that cannot run.
    pub fn from_config(config: &RecognitionConfig) -> Self {
        let mut backends = Vec::with_capacity(config.backends.len());

        for kind in &config.backends {
            match kind.build(config) {
                Ok(backend) => {
                    info!(backend = %kind, "Recognition backend enabled");
                    backends.push(backend);
                }
                Err(e) => {
                    warn!(backend = %kind, error = %e, "Recognition backend skipped");
                }
            }
        }

        if backends.is_empty() {
            warn!("No usable recognition backend; recognition requests will be rejected");
        }

        Self::new(backends, Duration::from_secs(config.timeout_secs))
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Try each backend in order until one produces a transcript.
    pub async fn transcribe(&self, utterance: &Utterance) -> Result<Transcription, GatewayError> {
        if self.backends.is_empty() {
            return Err(GatewayError::NoBackends);
        }

        let mut attempts = Vec::new();

        for backend in &self.backends {
            let started = std::time::Instant::now();
            let outcome = match tokio::time::timeout(self.timeout, backend.transcribe(utterance)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.timeout)),
            };

            match outcome {
                Ok(text) => {
                    debug!(
                        backend = backend.name(),
                        chars = text.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Transcription received"
                    );
                    return Ok(Transcription {
                        text,
                        backend: backend.name(),
                        failed_attempts: attempts.len(),
                    });
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Recognition backend failed");
                    attempts.push((backend.name(), e));
                }
            }
        }

        Err(GatewayError::AllFailed { attempts })
    }
}
