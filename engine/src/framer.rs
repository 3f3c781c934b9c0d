//! Length-prefixed record assembly over a reliable byte stream (spec §4.1).
//!
//! Wire frame: an 8-byte little-endian unsigned total length, including the 8 bytes themselves,
//! followed by `length - 8` bytes of payload.

use std::convert::TryInto;

use crate::error::FramerError;

/// Size in bytes of the length prefix.
pub const LEN_PREFIX_SIZE: usize = 8;

/// The largest frame (prefix included) a [`Framer`] will accept before treating the stream as
/// corrupt.
pub const MAX_FRAME_LEN: u64 = 1024 * 1024;

/// Encodes `payload` as a single frame: an 8-byte length prefix (including itself) followed by
/// `payload` verbatim.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let total_len = (LEN_PREFIX_SIZE + payload.len()) as u64;
    let mut frame = Vec::with_capacity(total_len as usize);
    frame.extend_from_slice(&total_len.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Accumulates bytes from a byte stream and yields complete frame payloads as they become
/// available.
///
/// The peek-then-consume discipline is idempotent across arbitrarily short reads: [`push`] may be
/// called with any number of bytes at a time, including zero or one byte, and [`next_frame`] will
/// return `Ok(None)` until a full frame has accumulated.
///
/// [`push`]: Self::push
/// [`next_frame`]: Self::next_frame
#[derive(Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    /// Constructs an empty `Framer`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes just read from the stream to the staging buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete frame payload, if one has fully arrived.
    ///
    /// # Errors
    ///
    /// If the declared length is smaller than the prefix itself or exceeds
    /// [`MAX_FRAME_LEN`], an error is returned; the caller must drop the connection and discard
    /// this `Framer`, since the stream can no longer be trusted to resynchronize.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramerError> {
        if self.buffer.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let len_bytes: [u8; LEN_PREFIX_SIZE] = self.buffer[..LEN_PREFIX_SIZE]
            .try_into()
            .expect("slice of exactly LEN_PREFIX_SIZE bytes");
        let total_len = u64::from_le_bytes(len_bytes);

        if total_len < LEN_PREFIX_SIZE as u64 || total_len > MAX_FRAME_LEN {
            return Err(FramerError::MalformedLength(total_len));
        }

        let total_len = total_len as usize;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let payload = self.buffer[LEN_PREFIX_SIZE..total_len].to_vec();
        self.buffer.drain(..total_len);
        Ok(Some(payload))
    }

    /// Drains every complete frame currently buffered, stopping (and returning the error) at the
    /// first malformed length.
    pub fn drain_frames(&mut self) -> Result<Vec<Vec<u8>>, FramerError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}
