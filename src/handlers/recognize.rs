//! # Recognition Endpoint
//!
//! `POST <nmsp.endpoint_path>`: one legacy recognition request from start
//! to finish.
//!
//! ## Request Flow:
//! 1. Derive the frame delimiter from the `Content-Type` boundary
//! 2. Stream the body through the frame parser, `read_block_size` bytes at a time
//! 3. Check out a codec and assemble the utterance
//! 4. Ask the recognition gateway for a transcript; when trimming leaves no
//!    audio at all, the gateway is skipped and the answer is the retry payload
//! 5. Encode the NMSP response and hand the recording off in the background
//!
//! A body stream error (typically the client hanging up) aborts the request
//! before any transcription is attempted.

use crate::audio::UtteranceAssembler;
use crate::config::NmspConfig;
use crate::error::{AppError, AppResult};
use crate::nmsp::{boundary_from_content_type, response_content_type, ChunkParser, Frame, ResponsePayload};
use crate::recognition::{GatewayError, Transcription};
use crate::state::{AppState, RecognitionOutcome};
use actix_web::http::header::CONTENT_TYPE;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use std::time::Instant;
use tracing::{debug, info, warn};

pub async fn recognize(
    req: HttpRequest,
    mut payload: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let started = Instant::now();

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing content-type header".to_string()))?;
    let delimiter = boundary_from_content_type(content_type)?;

    if state.gateway.is_empty() {
        return Err(AppError::ConfigError(
            "no usable recognition backend is configured".to_string(),
        ));
    }

    let (frames, malformed) = read_frames(&mut payload, delimiter, &state.config.nmsp).await?;

    // The pooled codec is returned (and reset) at the end of this block.
    let (utterance, stats) = {
        let mut codec = state.codecs.checkout()?;
        UtteranceAssembler::new(&mut *codec, state.config.audio.gain).assemble(&frames)
    };
    state.record_assembly(&stats, malformed);

    let outcome = if utterance.is_empty() {
        debug!(frames = frames.len(), "No audio frames left after trimming");
        Ok(Transcription {
            text: String::new(),
            backend: "none",
            failed_attempts: 0,
        })
    } else {
        state.gateway.transcribe(&utterance).await
    };

    match outcome {
        Ok(transcription) => {
            let response = ResponsePayload::from_transcript(Some(&transcription.text));
            let result = if response.is_retry() {
                RecognitionOutcome::Retry
            } else {
                RecognitionOutcome::Words
            };
            state.record_recognition(result, transcription.failed_attempts);

            info!(
                backend = transcription.backend,
                frames = stats.frames_received,
                audio_seconds = utterance.duration_secs(),
                words = transcription.text.split_whitespace().count(),
                retry = response.is_retry(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Recognition complete"
            );

            spawn_recording(&state, utterance, transcription.text);

            Ok(HttpResponse::Ok()
                .content_type(response_content_type())
                .body(response.encode()?))
        }
        Err(GatewayError::NoBackends) => Err(AppError::ConfigError(
            "no usable recognition backend is configured".to_string(),
        )),
        Err(err @ GatewayError::AllFailed { .. }) => {
            if let GatewayError::AllFailed { attempts } = &err {
                state.record_recognition(RecognitionOutcome::Failed, attempts.len());
            }
            spawn_recording(&state, utterance, String::new());
            Err(AppError::TranscriptionFailed(err.to_string()))
        }
    }
}

/// Run the upload through the frame parser. Returns the frames and the
/// number of malformed candidates that were dropped.
async fn read_frames(
    payload: &mut web::Payload,
    delimiter: Vec<u8>,
    config: &NmspConfig,
) -> AppResult<(Vec<Frame>, usize)> {
    let mut parser = ChunkParser::new(delimiter);
    let mut frames = Vec::new();
    let mut received = 0usize;

    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| {
            warn!(error = %e, bytes = received, "Upload aborted");
            AppError::from(e)
        })?;

        received += chunk.len();
        if received > config.max_body_bytes {
            return Err(AppError::PayloadError(format!(
                "upload exceeds {} bytes",
                config.max_body_bytes
            )));
        }

        for block in chunk.chunks(config.read_block_size) {
            frames.extend(parser.feed(block));
        }
    }

    let malformed = parser.malformed_frames();
    let discarded = parser.finish();
    debug!(
        bytes = received,
        frames = frames.len(),
        malformed,
        discarded,
        "Upload parsed"
    );

    Ok((frames, malformed))
}

fn spawn_recording(state: &AppState, utterance: crate::audio::Utterance, transcript: String) {
    let Some(recorder) = state.recorder.clone() else {
        return;
    };

    tokio::task::spawn_blocking(move || {
        if let Err(e) = recorder.save(&utterance, &transcript) {
            warn!(error = %e, "Failed to save recording");
        }
    });
}
