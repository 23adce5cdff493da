//! Frame delineation for byte-stream transports.
//!
//! Each frame is a 32-bit big-endian length followed by that many payload
//! bytes. Message-oriented transports (WebSocket) do not need this.

use thiserror::Error;

/// Maximum frame size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Reassembles length-prefixed frames from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// An oversized length prefix is an error; the stream cannot be
    /// resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
        let size = u32::from_be_bytes(prefix) as usize;
        if size > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() < LENGTH_PREFIX + size {
            return Ok(None);
        }
        let frame = self.buffer[LENGTH_PREFIX..LENGTH_PREFIX + size].to_vec();
        self.buffer.drain(..LENGTH_PREFIX + size);
        Ok(Some(frame))
    }
}
