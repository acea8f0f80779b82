//! # Audio Module
//!
//! Everything between a raw upload frame and a finished waveform.
//!
//! ## Key Components:
//! - **codec**: per-frame speech decoding and gain correction
//! - **pool**: per-request codec ownership with reset on return
//! - **utterance**: frame selection, concatenation and the WAV container
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz
//! - **Bit Depth**: 16-bit signed PCM, little-endian
//! - **Channels**: Mono

pub mod codec;
pub mod pool;
#[cfg(feature = "libspeex")]
pub mod speex;
pub mod utterance;

pub use codec::{CodecKind, DecodeError};
pub use pool::CodecPool;
pub use utterance::{AssemblyStats, Utterance, UtteranceAssembler};
