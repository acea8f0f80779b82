//! # Local Whisper Engine
//!
//! Runs Whisper inference in-process with candle, so the gateway keeps
//! answering when every remote provider is unreachable.
//!
//! ## Model Loading Process:
//! 1. Resolve the HuggingFace repository for the configured size
//! 2. Download `config.json`, `tokenizer.json` and `model.safetensors`
//!    (cached by hf-hub after the first run)
//! 3. Build the mel filter bank for the model's mel bin count
//! 4. Load the weights onto the selected device
//!
//! The model is loaded lazily on the first request that reaches this
//! backend and then kept for the lifetime of the process.
//!
//! ## Inference:
//! Inference is CPU/GPU bound and runs on the blocking thread pool. One
//! model instance serves one utterance at a time.

use crate::audio::Utterance;
use crate::config::WhisperConfig;
use crate::device::{self, DevicePreference};

use super::{BackendError, SpeechBackend};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tokio::sync::OnceCell;

/// Whisper checkpoint sizes.
///
/// ## Trade-offs:
/// - **tiny/base**: fast enough for CPU, fine for short commands
/// - **small/medium**: better accuracy, want a GPU
/// - **large**: best accuracy, slowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository holding the checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Special token ids resolved from the checkpoint's tokenizer.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
}

/// A loaded Whisper checkpoint.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
}

impl WhisperModel {
    /// Download (or reuse the cached) checkpoint and load it onto `device`.
    pub async fn load(size: ModelSize, device: Device) -> Result<Self> {
        tracing::info!(model = %size, device = device::describe(&device), "Loading Whisper model");
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;

            let mut builder = ApiBuilder::new().with_progress(false);
            if let Ok(token) = std::env::var("HF_TOKEN") {
                builder = builder.with_token(Some(token));
            }
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            }
            builder
                .build()
                .map_err(|e| anyhow!("Failed to create HuggingFace client: {}", e))?
        };

        let repo = api.model(size.repo_name().to_string());
        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let weights_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
        };

        let mel_filters = mel_filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE as f64);

        // SAFETY: the weights file is owned by the hf-hub cache and not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        tracing::info!(
            model = %size,
            seconds = start_time.elapsed().as_secs_f64(),
            "Whisper model loaded"
        );

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            mel_filters,
            tokens,
        })
    }

    /// Greedy transcription of up to 30 seconds of 16kHz mono audio.
    pub fn transcribe(&mut self, pcm: &[f32], language: Option<&str>) -> Result<String> {
        let start_time = std::time::Instant::now();

        let mel = encoder_input(&self.config, &self.mel_filters, pcm, &self.device)?;
        let features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = vec![self.tokens.sot];
        if let Some(language) = language {
            match self.tokenizer.token_to_id(&format!("<|{}|>", language.to_lowercase())) {
                Some(id) => tokens.push(id),
                None => tracing::warn!(language, "Language not supported by Whisper, auto-detecting"),
            }
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let max_tokens = self.config.max_target_positions / 2;
        for step in 0..max_tokens {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let hidden = self.model.decoder.forward(&input, &features, step == 0)?;
            let (_, seq_len, _) = hidden.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&hidden.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let next = logits.argmax(0)?.to_scalar::<u32>()?;

            if next == self.tokens.eot || is_repetitive(&tokens[prompt_len..], next) {
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        tracing::debug!(
            audio_seconds = pcm.len() as f64 / m::SAMPLE_RATE as f64,
            elapsed_seconds = start_time.elapsed().as_secs_f64(),
            "Whisper transcription finished"
        );

        Ok(text.trim().to_string())
    }
}

/// Log-mel features for one 30 second window, shaped `(1, n_mels, N_FRAMES)`.
///
/// `pcm_to_mel` pads the signal by another window on its own, so the
/// spectrogram is cut back to the encoder's context length.
fn encoder_input(config: &Config, mel_filters: &[f32], pcm: &[f32], device: &Device) -> Result<Tensor> {
    let mut samples = pcm.to_vec();
    samples.resize(m::N_SAMPLES, 0.0);

    let mel = audio::pcm_to_mel(config, &samples, mel_filters);
    let n_mels = config.num_mel_bins;
    let n_frames = mel.len() / n_mels;
    if n_frames < m::N_FRAMES {
        return Err(anyhow!("mel spectrogram has {} frames, expected at least {}", n_frames, m::N_FRAMES));
    }

    let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), device)?;
    Ok(mel.narrow(2, 0, m::N_FRAMES)?)
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no id for {}", token))
}

/// Stop decoding loops where the model repeats the same token or trigram.
fn is_repetitive(output: &[u32], next: u32) -> bool {
    let n = output.len();
    if n >= 3 && output[n - 3..].iter().all(|&t| t == next) {
        return true;
    }
    n >= 6 && output[n - 3..] == output[n - 6..n - 3] && output[n - 3] == next
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f64.ln() / 27.0;

    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f64.ln() / 27.0;

    if mel >= min_log_mel {
        MIN_LOG_HZ * (log_step * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-normalized triangular mel filters, row-major `[n_mels][n_fft / 2 + 1]`.
fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: f64) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * sample_rate / n_fft as f64)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate / 2.0);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
        let norm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - left) / (center - left);
            let falling = (right - freq) / (right - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_bins + k] = (weight * norm) as f32;
        }
    }
    filters
}

/// The local engine as a recognition backend.
pub struct WhisperBackend {
    size: ModelSize,
    device: DevicePreference,
    language: Option<String>,
    model: OnceCell<Arc<Mutex<WhisperModel>>>,
}

impl WhisperBackend {
    pub fn new(config: &WhisperConfig, language: Option<String>) -> Self {
        Self {
            size: config.model,
            device: config.device,
            language,
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<Mutex<WhisperModel>>, BackendError> {
        self.model
            .get_or_try_init(|| async {
                let model = WhisperModel::load(self.size, self.device.resolve())
                    .await
                    .map_err(|e| BackendError::Engine(e.to_string()))?;
                Ok::<_, BackendError>(Arc::new(Mutex::new(model)))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl SpeechBackend for WhisperBackend {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, BackendError> {
        if utterance.is_empty() {
            return Ok(String::new());
        }

        let model = self.model().await?;
        let pcm = utterance.to_f32();
        let language = self.language.clone();

        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
            model.transcribe(&pcm, language.as_deref())
        })
        .await
        .map_err(|e| BackendError::Engine(format!("inference task failed: {}", e)))?
        .map_err(|e| BackendError::Engine(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("huge".parse::<ModelSize>().is_err());
        assert_eq!(ModelSize::Tiny.to_string(), "tiny");
        assert_eq!(ModelSize::Large.repo_name(), "openai/whisper-large-v2");
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 300.0, 999.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80, 400, 16000.0);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|&w| w >= 0.0));

        for row in filters.chunks(201) {
            assert!(row.iter().any(|&w| w > 0.0), "every mel bin covers some frequency");
        }
    }

    fn tiny_config() -> Config {
        serde_json::from_str(
            r#"{
                "num_mel_bins": 80,
                "max_source_positions": 1500,
                "d_model": 384,
                "encoder_attention_heads": 6,
                "encoder_layers": 4,
                "decoder_attention_heads": 6,
                "decoder_layers": 4,
                "vocab_size": 51865,
                "max_target_positions": 448,
                "suppress_tokens": []
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_encoder_input_fits_context() {
        let config = tiny_config();
        let filters = mel_filter_bank(80, m::N_FFT, m::SAMPLE_RATE as f64);
        let pcm: Vec<f32> = (0..16000).map(|i| (i as f32 * 0.05).sin() * 0.1).collect();

        let mel = encoder_input(&config, &filters, &pcm, &Device::Cpu).unwrap();

        assert_eq!(mel.dims(), &[1, 80, m::N_FRAMES]);
        // Stride-2 conv must leave no more positions than the embedding table has.
        assert!(m::N_FRAMES / 2 <= config.max_source_positions);
    }

    #[test]
    fn test_encoder_input_truncates_long_audio() {
        let config = tiny_config();
        let filters = mel_filter_bank(80, m::N_FFT, m::SAMPLE_RATE as f64);
        let pcm = vec![0.01f32; m::N_SAMPLES + 16000];

        let mel = encoder_input(&config, &filters, &pcm, &Device::Cpu).unwrap();
        assert_eq!(mel.dims(), &[1, 80, m::N_FRAMES]);
    }

    #[test]
    fn test_repetition_guard() {
        assert!(!is_repetitive(&[1, 2, 3], 4));
        assert!(is_repetitive(&[5, 7, 7, 7], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2, 3], 1));
        assert!(!is_repetitive(&[1, 2, 3, 1, 2, 3], 9));
    }

    #[tokio::test]
    async fn test_empty_utterance_skips_model_load() {
        let backend = WhisperBackend::new(
            &WhisperConfig {
                model: ModelSize::Tiny,
                device: DevicePreference::Cpu,
            },
            None,
        );
        let text = backend
            .transcribe(&Utterance::from_samples(Vec::new()))
            .await
            .unwrap();
        assert!(text.is_empty());
        assert!(backend.model.get().is_none());
    }
}
