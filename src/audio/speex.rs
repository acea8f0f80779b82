//! Wideband Speex decoding through the system libspeex.
//!
//! Only the handful of entry points needed for decoding are declared here;
//! the library is linked by name and located by the build script.

use crate::audio::codec::{DecodeError, SpeechCodec};
use libc::{c_char, c_int, c_void};
use std::ptr;

const SPEEX_MODEID_WB: c_int = 1;
const SPEEX_SET_ENH: c_int = 0;
const SPEEX_GET_FRAME_SIZE: c_int = 3;
const SPEEX_RESET_STATE: c_int = 26;

/// Mirror of libspeex's `SpeexBits` bit-stream struct.
#[repr(C)]
struct SpeexBits {
    chars: *mut c_char,
    nb_bits: c_int,
    char_ptr: c_int,
    bit_ptr: c_int,
    owner: c_int,
    overflow: c_int,
    buf_size: c_int,
    reserved1: c_int,
    reserved2: *mut c_void,
}

impl SpeexBits {
    fn zeroed() -> Self {
        Self {
            chars: ptr::null_mut(),
            nb_bits: 0,
            char_ptr: 0,
            bit_ptr: 0,
            owner: 0,
            overflow: 0,
            buf_size: 0,
            reserved1: 0,
            reserved2: ptr::null_mut(),
        }
    }
}

#[repr(C)]
struct SpeexMode {
    _opaque: [u8; 0],
}

#[link(name = "speex")]
extern "C" {
    fn speex_lib_get_mode(mode: c_int) -> *const SpeexMode;
    fn speex_decoder_init(mode: *const SpeexMode) -> *mut c_void;
    fn speex_decoder_destroy(state: *mut c_void);
    fn speex_decoder_ctl(state: *mut c_void, request: c_int, ptr: *mut c_void) -> c_int;
    fn speex_decode_int(state: *mut c_void, bits: *mut SpeexBits, out: *mut i16) -> c_int;
    fn speex_bits_init(bits: *mut SpeexBits);
    fn speex_bits_read_from(bits: *mut SpeexBits, bytes: *const c_char, len: c_int);
    fn speex_bits_destroy(bits: *mut SpeexBits);
}

/// Owned libspeex decoder state plus its bit buffer.
pub struct SpeexCodec {
    state: *mut c_void,
    bits: Box<SpeexBits>,
    frame_size: usize,
}

// The raw state is only ever touched through `&mut self`.
unsafe impl Send for SpeexCodec {}

impl SpeexCodec {
    /// Create a wideband (16kHz) decoder with the perceptual enhancer on.
    pub fn wideband() -> Result<Self, DecodeError> {
        unsafe {
            let mode = speex_lib_get_mode(SPEEX_MODEID_WB);
            if mode.is_null() {
                return Err(DecodeError::Unavailable("wideband mode not compiled in".to_string()));
            }

            let state = speex_decoder_init(mode);
            if state.is_null() {
                return Err(DecodeError::Unavailable("speex_decoder_init failed".to_string()));
            }

            let mut enhancer: c_int = 1;
            speex_decoder_ctl(state, SPEEX_SET_ENH, &mut enhancer as *mut c_int as *mut c_void);

            let mut frame_size: c_int = 0;
            speex_decoder_ctl(state, SPEEX_GET_FRAME_SIZE, &mut frame_size as *mut c_int as *mut c_void);

            let mut bits = Box::new(SpeexBits::zeroed());
            speex_bits_init(bits.as_mut());

            Ok(Self {
                state,
                bits,
                frame_size: frame_size.max(0) as usize,
            })
        }
    }
}

impl SpeechCodec for SpeexCodec {
    fn name(&self) -> &'static str {
        "speex"
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, DecodeError> {
        if packet.is_empty() {
            return Err(DecodeError::Empty);
        }
        let len = c_int::try_from(packet.len())
            .map_err(|_| DecodeError::Corrupt(format!("packet of {} bytes", packet.len())))?;

        let mut pcm = vec![0i16; self.frame_size];
        let status = unsafe {
            speex_bits_read_from(self.bits.as_mut(), packet.as_ptr() as *const c_char, len);
            speex_decode_int(self.state, self.bits.as_mut(), pcm.as_mut_ptr())
        };

        match status {
            0 => Ok(pcm),
            -1 => Err(DecodeError::Corrupt("end-of-stream marker".to_string())),
            _ => Err(DecodeError::Corrupt("invalid bit-stream".to_string())),
        }
    }

    fn reset(&mut self) {
        unsafe {
            speex_decoder_ctl(self.state, SPEEX_RESET_STATE, ptr::null_mut());
        }
    }
}

impl Drop for SpeexCodec {
    fn drop(&mut self) {
        unsafe {
            speex_bits_destroy(self.bits.as_mut());
            speex_decoder_destroy(self.state);
        }
    }
}
