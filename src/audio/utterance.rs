//! # Utterance Assembly
//!
//! Turns the ordered frames of one upload into a single mono waveform.
//!
//! ## Frame Selection:
//! The legacy firmware wraps the audio in frames that are not speech:
//! 1. The first [`HANDSHAKE_FRAMES`] frames always carry handshake metadata
//! 2. When more than [`NOISE_TRIM_THRESHOLD`] frames remain, the first
//!    [`LEADING_NOISE_FRAMES`] and last [`TRAILING_NOISE_FRAMES`] of those are
//!    noise injected by some firmware versions
//!
//! These counts come from observed client behaviour and are kept literal.
//!
//! ## Output Format:
//! 16000 Hz, 16-bit signed, mono. No resampling or mixing happens here.

use crate::audio::codec::{apply_gain, SpeechCodec, SAMPLE_RATE};
use crate::nmsp::chunks::Frame;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::io::Cursor;

pub const HANDSHAKE_FRAMES: usize = 3;
pub const NOISE_TRIM_THRESHOLD: usize = 15;
pub const LEADING_NOISE_FRAMES: usize = 12;
pub const TRAILING_NOISE_FRAMES: usize = 3;

pub const BITS_PER_SAMPLE: u16 = 16;
pub const CHANNELS: u16 = 1;

/// A finished waveform. Immutable once assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    samples: Vec<i16>,
}

impl Utterance {
    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Raw little-endian PCM bytes.
    pub fn pcm_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.samples.len() * 2];
        LittleEndian::write_i16_into(&self.samples, &mut bytes);
        bytes
    }

    /// Normalized `[-1.0, 1.0)` samples for model input.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect()
    }

    /// Encode as a canonical RIFF/WAVE file.
    pub fn to_wav(&self) -> Result<Vec<u8>, hound::Error> {
        let spec = hound::WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_format: hound::SampleFormat::Int,
        };

        let mut buffer = Vec::with_capacity(44 + self.samples.len() * 2);
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec)?;
            for &sample in &self.samples {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }
        Ok(buffer)
    }
}

/// Counters describing what happened to one upload's frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyStats {
    pub frames_received: usize,
    pub frames_selected: usize,
    pub frames_decoded: usize,
    pub decode_failures: usize,
}

/// Apply the handshake and noise trimming rules to a frame sequence.
pub fn select_audio_frames<T>(frames: &[T]) -> &[T] {
    let remaining = frames.get(HANDSHAKE_FRAMES..).unwrap_or(&[]);

    if remaining.len() > NOISE_TRIM_THRESHOLD {
        &remaining[LEADING_NOISE_FRAMES..remaining.len() - TRAILING_NOISE_FRAMES]
    } else {
        remaining
    }
}

/// Decodes selected frames with a borrowed codec and concatenates the PCM.
pub struct UtteranceAssembler<'a> {
    codec: &'a mut dyn SpeechCodec,
    gain: f64,
}

impl<'a> UtteranceAssembler<'a> {
    pub fn new(codec: &'a mut dyn SpeechCodec, gain: f64) -> Self {
        Self { codec, gain }
    }

    /// Build the utterance. Frames that fail to decode are skipped.
    pub fn assemble(&mut self, frames: &[Frame]) -> (Utterance, AssemblyStats) {
        let selected = select_audio_frames(frames);
        let mut stats = AssemblyStats {
            frames_received: frames.len(),
            frames_selected: selected.len(),
            ..AssemblyStats::default()
        };

        let mut samples = Vec::with_capacity(selected.len() * self.codec.frame_size());
        for (index, frame) in selected.iter().enumerate() {
            match self.codec.decode(frame.as_bytes()) {
                Ok(mut block) => {
                    apply_gain(&mut block, self.gain);
                    samples.extend_from_slice(&block);
                    stats.frames_decoded += 1;
                }
                Err(e) => {
                    stats.decode_failures += 1;
                    tracing::warn!(
                        codec = self.codec.name(),
                        frame = index,
                        bytes = frame.len(),
                        error = %e,
                        "Skipping undecodable frame"
                    );
                }
            }
        }

        tracing::debug!(
            received = stats.frames_received,
            selected = stats.frames_selected,
            decoded = stats.frames_decoded,
            "Utterance assembled"
        );

        (Utterance::from_samples(samples), stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{Pcm16Codec, WIDEBAND_FRAME_SAMPLES};

    fn frame_of(value: i16) -> Frame {
        let samples = vec![value; WIDEBAND_FRAME_SAMPLES];
        let mut bytes = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(&samples, &mut bytes);
        Frame::new(bytes)
    }

    #[test]
    fn test_short_uploads_keep_everything_after_handshake() {
        let frames: Vec<usize> = (0..18).collect();
        let selected = select_audio_frames(&frames);
        assert_eq!(selected.len(), 15);
        assert_eq!(selected.first(), Some(&3));
        assert_eq!(selected.last(), Some(&17));
    }

    #[test]
    fn test_long_uploads_trim_noise() {
        let frames: Vec<usize> = (0..19).collect();
        // 16 remain after the handshake, 12 + 3 are noise
        assert_eq!(select_audio_frames(&frames), &[15]);

        let frames: Vec<usize> = (0..40).collect();
        let selected = select_audio_frames(&frames);
        assert_eq!(selected.len(), 40 - 3 - 12 - 3);
        assert_eq!(selected.first(), Some(&15));
        assert_eq!(selected.last(), Some(&36));
    }

    #[test]
    fn test_handshake_only_upload_is_empty() {
        let frames = vec![1, 2];
        assert!(select_audio_frames(&frames).is_empty());
        let frames = vec![1, 2, 3];
        assert!(select_audio_frames(&frames).is_empty());
    }

    #[test]
    fn test_twenty_frames_leave_two() {
        let frames: Vec<Frame> = (0..20).map(|i| frame_of(i as i16)).collect();
        let mut codec = Pcm16Codec::new(WIDEBAND_FRAME_SAMPLES);
        let mut assembler = UtteranceAssembler::new(&mut codec, 2.0);

        let (utterance, stats) = assembler.assemble(&frames);

        assert_eq!(stats.frames_selected, 2);
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(utterance.sample_count(), 2 * WIDEBAND_FRAME_SAMPLES);
        assert!((utterance.duration_secs() - 0.04).abs() < 1e-9);
        // Frames 15 and 16 survive, doubled
        assert_eq!(utterance.samples()[0], 30);
        assert_eq!(utterance.samples()[WIDEBAND_FRAME_SAMPLES], 32);
    }

    #[test]
    fn test_undecodable_frames_are_skipped() {
        let mut frames: Vec<Frame> = (0..6).map(|i| frame_of(i as i16)).collect();
        frames[4] = Frame::new(vec![1, 2, 3]);
        let mut codec = Pcm16Codec::new(WIDEBAND_FRAME_SAMPLES);
        let mut assembler = UtteranceAssembler::new(&mut codec, 1.0);

        let (utterance, stats) = assembler.assemble(&frames);

        assert_eq!(stats.frames_selected, 3);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(utterance.sample_count(), 2 * WIDEBAND_FRAME_SAMPLES);
        assert_eq!(utterance.samples()[0], 3);
        assert_eq!(utterance.samples()[WIDEBAND_FRAME_SAMPLES], 5);
    }

    #[test]
    fn test_wav_container() {
        let utterance = Utterance::from_samples(vec![0, 1000, -1000, i16::MAX]);
        let wav = utterance.to_wav().unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);

        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, utterance.samples());
    }

    #[test]
    fn test_pcm_bytes_are_little_endian() {
        let utterance = Utterance::from_samples(vec![0x0102, -2]);
        assert_eq!(utterance.pcm_bytes(), vec![0x02, 0x01, 0xFE, 0xFF]);
    }
}
