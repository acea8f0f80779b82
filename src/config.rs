//! # Configuration Management
//!
//! Loads the gateway's settings from layered sources:
//! - Built-in defaults (the [`Default`] impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP` prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment-platform variables `HOST` and `PORT`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__CODEC`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values
//!
//! Nested keys use a double underscore so that field names containing a
//! single underscore survive (`APP_NMSP__READ_BLOCK_SIZE` → `nmsp.read_block_size`).
//! `APP_RECOGNITION__BACKENDS` takes a comma-separated list.
//!
//! ## Provider Credentials:
//! When no key is configured, `ELEVENLABS_API_KEY` and `OPENAI_API_KEY` are
//! read directly so existing deployments keep working unchanged.

use crate::audio::CodecKind;
use crate::device::DevicePreference;
use crate::recognition::whisper::ModelSize;
use crate::recognition::BackendKind;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Root of the configuration tree. Each field maps to one TOML table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub nmsp: NmspConfig,
    pub audio: AudioConfig,
    pub recognition: RecognitionConfig,
    pub recording: RecordingConfig,
}

/// HTTP listener settings.
///
/// `workers = 0` leaves the worker count to actix (one per physical core).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// Legacy protocol endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmspConfig {
    /// Path the firmware posts recognition requests to.
    pub endpoint_path: String,
    /// Bytes handed to the frame parser per step.
    pub read_block_size: usize,
    /// Uploads larger than this are rejected.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub codec: CodecKind,
    /// Linear gain applied to every decoded frame.
    pub gain: f64,
    /// Idle codecs kept for reuse.
    pub pool_size: usize,
}

/// Backend chain and per-backend settings.
///
/// ## Fields:
/// - `backends`: tried in order until one returns text
/// - `timeout_secs`: bounded wait for each backend call
/// - `language`: optional ISO-639-1 hint passed to backends that accept one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub backends: Vec<BackendKind>,
    pub timeout_secs: u64,
    pub language: Option<String>,
    pub elevenlabs: ElevenLabsConfig,
    pub openai: OpenAiConfig,
    pub wyoming: WyomingConfig,
    pub whisper: WhisperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    pub url: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

/// A Wyoming speech-to-text server. Unset `host` disables the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WyomingConfig {
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    pub model: ModelSize,
    pub device: DevicePreference,
}

/// Diagnostic copies of every utterance and its transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Upper bound on files kept in `directory` (`.wav` and `.txt` counted together).
    pub max_files: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9000,
                workers: 0,
            },
            nmsp: NmspConfig {
                endpoint_path: "/NmspServlet/".to_string(),
                read_block_size: crate::nmsp::chunks::READ_BLOCK_SIZE,
                max_body_bytes: 8 * 1024 * 1024,
            },
            audio: AudioConfig {
                codec: CodecKind::Speex,
                gain: 2.0,
                pool_size: 8,
            },
            recognition: RecognitionConfig {
                backends: vec![BackendKind::ElevenLabs, BackendKind::Whisper],
                timeout_secs: 30,
                language: None,
                elevenlabs: ElevenLabsConfig {
                    api_key: None,
                    url: "https://api.elevenlabs.io/v1/speech-to-text".to_string(),
                    model_id: "scribe_v1".to_string(),
                },
                openai: OpenAiConfig {
                    api_key: None,
                    base_url: "https://api.openai.com/v1".to_string(),
                    model: "whisper-1".to_string(),
                },
                wyoming: WyomingConfig {
                    host: None,
                    port: 10300,
                },
                whisper: WhisperConfig {
                    model: ModelSize::Base,
                    device: DevicePreference::Auto,
                },
            },
            recording: RecordingConfig {
                enabled: false,
                directory: PathBuf::from("recordings"),
                max_files: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::load_with(config::File::with_name("config").required(false))
    }

    /// Same as [`AppConfig::load`] with an explicit file source.
    pub fn load_with<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("recognition.backends")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        config.apply_credential_fallbacks();
        Ok(config)
    }

    fn apply_credential_fallbacks(&mut self) {
        fill_from_env(&mut self.recognition.elevenlabs.api_key, "ELEVENLABS_API_KEY");
        fill_from_env(&mut self.recognition.openai.api_key, "OPENAI_API_KEY");
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.nmsp.endpoint_path.starts_with('/') {
            return Err(anyhow::anyhow!(
                "NMSP endpoint path must start with '/', got '{}'",
                self.nmsp.endpoint_path
            ));
        }

        if self.nmsp.read_block_size == 0 {
            return Err(anyhow::anyhow!("Read block size must be greater than 0"));
        }

        if self.nmsp.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("Maximum body size must be greater than 0"));
        }

        if !self.audio.gain.is_finite() || self.audio.gain <= 0.0 {
            return Err(anyhow::anyhow!("Audio gain must be a positive number"));
        }

        if self.recognition.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Recognition timeout must be greater than 0"));
        }

        if self.recognition.backends.is_empty() {
            return Err(anyhow::anyhow!("At least one recognition backend must be configured"));
        }

        if self.recording.enabled && self.recording.max_files == 0 {
            return Err(anyhow::anyhow!("Recording max_files must be greater than 0"));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Use an environment variable when the configured value is missing or blank.
fn fill_from_env(slot: &mut Option<String>, var: &str) {
    let missing = slot.as_deref().map_or(true, |key| key.trim().is_empty());
    if missing {
        *slot = env::var(var).ok().filter(|key| !key.trim().is_empty());
    }
}
