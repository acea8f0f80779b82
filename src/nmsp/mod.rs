//! # NMSP Wire Protocol
//!
//! The two ends of the legacy speech protocol: splitting the client's
//! chunked upload into frames, and writing the byte-exact multipart reply.

pub mod chunks;
pub mod response;

pub use chunks::{boundary_from_content_type, BoundaryError, ChunkParser, Frame};
pub use response::{response_content_type, ResponsePayload};
