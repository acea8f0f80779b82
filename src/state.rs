//! # Application State
//!
//! Everything the request handlers share, built once at startup and handed
//! to every actix worker through `web::Data`.
//!
//! ## What Lives Here:
//! - **config**: the validated configuration, read-only after startup
//! - **gateway**: the recognition backend chain
//! - **codecs**: the speech codec pool; each request checks out its own codec
//! - **recorder**: diagnostic recording, when enabled
//! - **metrics**: per-process counters behind an `RwLock`
//!
//! ## Sharing Model:
//! `AppState` is cheap to clone: every field is an `Arc`, so each worker's
//! clone points at the same pool, gateway and counters. The only mutable
//! shared data are the counters and the pool's idle list, both behind
//! locks that are held for a handful of instructions.

use crate::audio::{AssemblyStats, CodecPool};
use crate::config::AppConfig;
use crate::recognition::TranscriptionGateway;
use crate::recording::Recorder;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<TranscriptionGateway>,
    pub codecs: Arc<CodecPool>,
    pub recorder: Option<Arc<Recorder>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters since process start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Requests answered with recognized words.
    pub recognitions: u64,
    /// Requests answered with the retry payload.
    pub retries: u64,
    /// Requests where every backend failed.
    pub transcription_failures: u64,
    /// Individual backend attempts that failed, including ones rescued by fallback.
    pub backend_failures: u64,
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub frames_skipped: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// How one recognition request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionOutcome {
    Words,
    Retry,
    Failed,
}

impl AppState {
    /// Build the shared state from a validated configuration.
    pub fn new(config: AppConfig) -> Result<Self> {
        let codecs = CodecPool::new(config.audio.codec, config.audio.pool_size)
            .with_context(|| format!("cannot initialise the '{}' speech codec", config.audio.codec))?;

        let gateway = TranscriptionGateway::from_config(&config.recognition);

        let recorder = if config.recording.enabled {
            let recorder = Recorder::new(&config.recording).with_context(|| {
                format!(
                    "cannot create recording directory {}",
                    config.recording.directory.display()
                )
            })?;
            Some(Arc::new(recorder))
        } else {
            None
        };

        Ok(Self::from_parts(config, gateway, codecs, recorder))
    }

    /// Assemble state from already-built components.
    pub fn from_parts(
        config: AppConfig,
        gateway: TranscriptionGateway,
        codecs: Arc<CodecPool>,
        recorder: Option<Arc<Recorder>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway: Arc::new(gateway),
            codecs,
            recorder,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_assembly(&self, stats: &AssemblyStats, malformed_frames: usize) {
        let mut metrics = self.metrics_mut();
        metrics.frames_received += (stats.frames_received + malformed_frames) as u64;
        metrics.frames_decoded += stats.frames_decoded as u64;
        metrics.frames_skipped += (stats.decode_failures + malformed_frames) as u64;
    }

    pub fn record_recognition(&self, outcome: RecognitionOutcome, failed_backends: usize) {
        let mut metrics = self.metrics_mut();
        metrics.backend_failures += failed_backends as u64;
        match outcome {
            RecognitionOutcome::Words => metrics.recognitions += 1,
            RecognitionOutcome::Retry => metrics.retries += 1,
            RecognitionOutcome::Failed => metrics.transcription_failures += 1,
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::audio::CodecKind;
    use crate::recognition::SpeechBackend;
    use std::time::Duration;

    /// State with the raw PCM codec and the given backend chain.
    pub fn state_with_backends(backends: Vec<Arc<dyn SpeechBackend>>) -> AppState {
        let mut config = AppConfig::default();
        config.audio.codec = CodecKind::Pcm16;

        let codecs = CodecPool::new(CodecKind::Pcm16, 2).unwrap();
        let gateway = TranscriptionGateway::new(backends, Duration::from_secs(2));
        AppState::from_parts(config, gateway, codecs, None)
    }
}
