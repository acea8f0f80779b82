//! # Chunked Upload Parsing
//!
//! Splits the legacy client's request body into boundary-delimited frames.
//!
//! ## Wire Shape:
//! The body is a sequence of parts separated by `--<boundary>`. Each part has
//! a small header block, a blank line (`\r\n\r\n`), the compressed audio
//! packet, and a 2-byte line ending that belongs to the framing rather than
//! the packet:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: application/octet-stream\r\n
//! \r\n
//! <packet bytes>\r\n
//! --<boundary>\r\n
//! ...
//! ```
//!
//! ## Tolerance Rules:
//! - Empty candidates (e.g. the preamble before the first boundary) are ignored
//! - Candidates without a header/content separator are dropped silently
//! - Whatever follows the final boundary when the stream ends is discarded

/// Default size of each read from the request stream.
pub const READ_BLOCK_SIZE: usize = 4096;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const FRAME_TRAILER_LEN: usize = 2;

/// One boundary-delimited unit of the upload with its headers and trailer removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Problems extracting the frame delimiter from the request's content type.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BoundaryError {
    #[error("content-type has no boundary parameter")]
    Missing,
    #[error("content-type boundary parameter is empty")]
    Empty,
}

/// Build the frame delimiter (`--` + boundary parameter) from a content-type value.
///
/// ## Example:
/// `multipart/form-data; boundary=abc` → `--abc`
pub fn boundary_from_content_type(content_type: &str) -> Result<Vec<u8>, BoundaryError> {
    let value = content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .ok_or(BoundaryError::Missing)?;

    if value.is_empty() {
        return Err(BoundaryError::Empty);
    }

    let mut delimiter = Vec::with_capacity(value.len() + 2);
    delimiter.extend_from_slice(b"--");
    delimiter.extend_from_slice(value.as_bytes());
    Ok(delimiter)
}

/// Incremental frame splitter.
///
/// Feed it blocks in arrival order; every complete frame found so far is
/// returned from [`ChunkParser::feed`]. A frame may span any number of
/// blocks, and one block may complete any number of frames.
#[derive(Debug)]
pub struct ChunkParser {
    delimiter: Vec<u8>,
    pending: Vec<u8>,
    malformed: usize,
}

impl ChunkParser {
    /// Create a parser for the given delimiter (already prefixed with `--`).
    pub fn new(delimiter: Vec<u8>) -> Self {
        Self {
            delimiter,
            pending: Vec::with_capacity(READ_BLOCK_SIZE * 2),
            malformed: 0,
        }
    }

    /// Append a block and extract every frame it completes.
    pub fn feed(&mut self, block: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(block);

        let mut frames = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = find(&self.pending[consumed..], &self.delimiter) {
            let end = consumed + offset;
            if let Some(frame) = self.extract(consumed, end) {
                frames.push(frame);
            }
            consumed = end + self.delimiter.len();
        }

        if consumed > 0 {
            self.pending.drain(..consumed);
        }

        frames
    }

    /// End of stream. Returns how many unterminated trailing bytes were discarded.
    pub fn finish(self) -> usize {
        self.pending.len()
    }

    /// Number of candidates dropped for lacking a header/content separator.
    pub fn malformed_frames(&self) -> usize {
        self.malformed
    }

    fn extract(&mut self, start: usize, end: usize) -> Option<Frame> {
        let candidate = &self.pending[start..end];
        if candidate.is_empty() {
            return None;
        }

        let Some(split) = find(candidate, HEADER_SEPARATOR) else {
            self.malformed += 1;
            tracing::debug!(bytes = candidate.len(), "Dropping frame without header separator");
            return None;
        };

        let content = &candidate[split + HEADER_SEPARATOR.len()..];
        let keep = content.len().saturating_sub(FRAME_TRAILER_LEN);
        Some(Frame::new(content[..keep].to_vec()))
    }
}

/// Raw substring search.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
