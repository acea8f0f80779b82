//! # Speech Frame Decoding
//!
//! Turns one compressed packet from the legacy upload into a block of linear
//! PCM at the codec's native frame size.
//!
//! ## Codecs:
//! - **speex**: wideband Speex (16kHz, 320 samples per frame) via the system
//!   libspeex, available when built with the `libspeex` feature
//! - **pcm16**: uncompressed 16-bit little-endian frames of the same size
//!
//! ## Codec State:
//! Lossy speech codecs carry prediction state from one frame to the next, so
//! a codec instance belongs to exactly one utterance at a time. See
//! [`crate::audio::pool`] for how instances are handed out and reset.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Output sample rate of every codec (Hz).
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per decoded frame in wideband mode (20ms at 16kHz).
pub const WIDEBAND_FRAME_SAMPLES: usize = 320;

/// Why a single frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is empty")]
    Empty,

    #[error("frame is {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("corrupt frame: {0}")]
    Corrupt(String),

    #[error("codec unavailable: {0}")]
    Unavailable(String),
}

/// A stateful single-channel speech decoder.
pub trait SpeechCodec: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Number of samples produced by every successful [`SpeechCodec::decode`].
    fn frame_size(&self) -> usize;

    /// Decode one packet into exactly `frame_size()` samples.
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, DecodeError>;

    /// Forget all inter-frame state.
    fn reset(&mut self);
}

/// Which codec the client firmware uses for its packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Speex,
    Pcm16,
}

impl CodecKind {
    /// Whether this build can construct the codec.
    pub fn is_available(self) -> bool {
        match self {
            CodecKind::Speex => cfg!(feature = "libspeex"),
            CodecKind::Pcm16 => true,
        }
    }

    /// Construct a fresh codec instance.
    pub fn create(self) -> Result<Box<dyn SpeechCodec>, DecodeError> {
        match self {
            #[cfg(feature = "libspeex")]
            CodecKind::Speex => Ok(Box::new(super::speex::SpeexCodec::wideband()?)),
            #[cfg(not(feature = "libspeex"))]
            CodecKind::Speex => Err(DecodeError::Unavailable(
                "built without the `libspeex` feature".to_string(),
            )),
            CodecKind::Pcm16 => Ok(Box::new(Pcm16Codec::new(WIDEBAND_FRAME_SAMPLES))),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "speex" => Ok(CodecKind::Speex),
            "pcm16" | "pcm" => Ok(CodecKind::Pcm16),
            _ => Err(anyhow::anyhow!("Unknown codec: {}", s)),
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodecKind::Speex => "speex",
            CodecKind::Pcm16 => "pcm16",
        };
        write!(f, "{}", name)
    }
}

/// Uncompressed frames: each packet is `frame_size` little-endian samples.
#[derive(Debug, Clone)]
pub struct Pcm16Codec {
    frame_size: usize,
}

impl Pcm16Codec {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl SpeechCodec for Pcm16Codec {
    fn name(&self) -> &'static str {
        "pcm16"
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, DecodeError> {
        if packet.is_empty() {
            return Err(DecodeError::Empty);
        }

        let expected = self.frame_size * 2;
        if packet.len() != expected {
            return Err(DecodeError::BadLength {
                expected,
                actual: packet.len(),
            });
        }

        let mut samples = vec![0i16; self.frame_size];
        LittleEndian::read_i16_into(packet, &mut samples);
        Ok(samples)
    }

    fn reset(&mut self) {}
}

/// Multiply every sample by `factor`, saturating at the 16-bit range.
///
/// Matches the classic integer audio gain primitive: the product is clamped
/// to `[-32768, 32767]` and then floored, so loud input clips instead of
/// wrapping around.
pub fn apply_gain(samples: &mut [i16], factor: f64) {
    const MIN: f64 = i16::MIN as f64;
    const MAX: f64 = i16::MAX as f64;

    for sample in samples.iter_mut() {
        let scaled = (*sample as f64 * factor).clamp(MIN, MAX);
        *sample = scaled.floor() as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(samples: &[i16]) -> Vec<u8> {
        let mut bytes = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut bytes);
        bytes
    }

    #[test]
    fn test_gain_doubles() {
        let mut samples = vec![0, 1, -1, 1000, -1000, 16383, -16384];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, vec![0, 2, -2, 2000, -2000, 32766, -32768]);
    }

    #[test]
    fn test_gain_saturates_instead_of_wrapping() {
        let mut samples = vec![i16::MAX, i16::MIN, 20000, -20000, 16384, -16385];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_gain_with_large_factor_stays_in_range() {
        let mut samples: Vec<i16> = (i16::MIN..=i16::MAX).step_by(97).collect();
        apply_gain(&mut samples, 7.0);
        for pair in samples.windows(2) {
            assert!(pair[0] <= pair[1], "gain must stay monotonic");
        }
        assert_eq!(*samples.first().unwrap(), i16::MIN);
        assert_eq!(*samples.last().unwrap(), i16::MAX);
    }

    #[test]
    fn test_pcm16_decodes_exact_frame() {
        let mut codec = Pcm16Codec::new(4);
        let samples = codec.decode(&encode(&[1, -2, 300, -32768])).unwrap();
        assert_eq!(samples, vec![1, -2, 300, -32768]);
        assert_eq!(samples.len(), codec.frame_size());
    }

    #[test]
    fn test_pcm16_rejects_bad_packets() {
        let mut codec = Pcm16Codec::new(4);
        assert_eq!(codec.decode(&[]), Err(DecodeError::Empty));
        assert_eq!(
            codec.decode(&[0u8; 7]),
            Err(DecodeError::BadLength { expected: 8, actual: 7 })
        );
    }

    #[test]
    fn test_codec_kind_parsing() {
        assert_eq!("speex".parse::<CodecKind>().unwrap(), CodecKind::Speex);
        assert_eq!("PCM16".parse::<CodecKind>().unwrap(), CodecKind::Pcm16);
        assert!("opus".parse::<CodecKind>().is_err());
        assert_eq!(CodecKind::Pcm16.to_string(), "pcm16");
    }

    #[test]
    fn test_codec_availability_matches_build() {
        assert!(CodecKind::Pcm16.create().is_ok());
        assert_eq!(CodecKind::Speex.is_available(), CodecKind::Speex.create().is_ok());
    }
}
