//! # Codec Pool
//!
//! Hands each request its own codec instance and takes it back afterwards.
//!
//! ## Lifecycle:
//! 1. `checkout()` pops an idle codec or constructs a new one
//! 2. The request decodes its whole utterance with it
//! 3. Dropping the [`PooledCodec`] resets the codec and returns it, unless
//!    the pool already holds `capacity` idle codecs, in which case it is
//!    destroyed
//!
//! Two concurrent requests therefore never share codec state.

use crate::audio::codec::{CodecKind, DecodeError, SpeechCodec};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

pub struct CodecPool {
    kind: CodecKind,
    capacity: usize,
    idle: Mutex<Vec<Box<dyn SpeechCodec>>>,
}

impl CodecPool {
    /// Create a pool and build one codec up front so a codec that cannot be
    /// constructed fails at startup instead of on the first request.
    pub fn new(kind: CodecKind, capacity: usize) -> Result<Arc<Self>, DecodeError> {
        let first = kind.create()?;
        let mut idle = Vec::with_capacity(capacity.max(1));
        idle.push(first);

        Ok(Arc::new(Self {
            kind,
            capacity: capacity.max(1),
            idle: Mutex::new(idle),
        }))
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Take exclusive ownership of a codec for one utterance.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledCodec, DecodeError> {
        let reused = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let codec = match reused {
            Some(codec) => codec,
            None => {
                tracing::debug!(codec = %self.kind, "Codec pool empty, creating a new instance");
                self.kind.create()?
            }
        };

        Ok(PooledCodec {
            codec: Some(codec),
            pool: Arc::clone(self),
        })
    }

    fn give_back(&self, mut codec: Box<dyn SpeechCodec>) {
        codec.reset();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.capacity {
            idle.push(codec);
        }
    }
}

/// A codec on loan from a [`CodecPool`].
pub struct PooledCodec {
    codec: Option<Box<dyn SpeechCodec>>,
    pool: Arc<CodecPool>,
}

impl Deref for PooledCodec {
    type Target = dyn SpeechCodec;

    fn deref(&self) -> &Self::Target {
        // Only emptied in drop.
        self.codec.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledCodec {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.codec.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledCodec {
    fn drop(&mut self) {
        if let Some(codec) = self.codec.take() {
            self.pool.give_back(codec);
        }
    }
}
