//! Length-prefixed frame codec.
//!
//! Wire layout: a big-endian `i32` payload length followed by exactly that
//! many payload bytes. `-1` is the end-of-stream sentinel. Works over any
//! AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`.
//!
//! Command frames and data frames share the framing but not the size bound;
//! the reader tells the decoder which kind it expects next.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Command frames carry one short line of text.
pub const MAX_COMMAND_SIZE: usize = 1024;

/// Data frames carry classpaths and pixel buffers (enough for an 8K screenshot).
pub const MAX_DATA_SIZE: usize = 100 * 1024 * 1024;

const LENGTH_FIELD_SIZE: usize = 4;
const END_OF_STREAM: i32 = -1;
const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Command,
    Data,
}

impl FrameKind {
    /// Payloads must be strictly smaller than this.
    pub fn limit(&self) -> usize {
        match self {
            Self::Command => MAX_COMMAND_SIZE,
            Self::Data => MAX_DATA_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("frame too large: {size} >= {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("peer signalled end of stream")]
    EndOfStream,

    #[error("invalid frame length: {0}")]
    InvalidLength(i32),
}

impl FrameError {
    /// Oversized frames break the protocol contract; everything else is a
    /// transport failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::TooLarge { .. })
    }
}

/// One outgoing frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn command(line: String) -> Self {
        Self {
            kind: FrameKind::Command,
            payload: Bytes::from(line),
        }
    }

    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    pub fn check_size(&self) -> Result<(), FrameError> {
        check_size(self.payload.len(), self.kind.limit())
    }
}

fn check_size(size: usize, limit: usize) -> Result<(), FrameError> {
    if size >= limit {
        return Err(FrameError::TooLarge { size, limit });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    Payload(usize),
}

#[derive(Debug)]
pub struct FrameCodec {
    expected: FrameKind,
    state: DecodeState,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            expected: FrameKind::Command,
            state: DecodeState::Head,
        }
    }

    /// Selects the size bound applied to the next decoded frame.
    pub fn expect(&mut self, kind: FrameKind) {
        self.expected = kind;
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<usize>, FrameError> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }
        let length = src.get_i32();
        if length == END_OF_STREAM {
            return Err(FrameError::EndOfStream);
        }
        if length < 0 {
            return Err(FrameError::InvalidLength(length));
        }
        let size = length as usize;
        check_size(size, self.expected.limit())?;
        Ok(Some(size))
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let size = match self.state {
            DecodeState::Head => match self.decode_head(src)? {
                Some(size) => {
                    self.state = DecodeState::Payload(size);
                    size
                }
                None => return Ok(None),
            },
            DecodeState::Payload(size) => size,
        };

        if src.len() < size {
            // Grow in bounded steps instead of trusting the announced length.
            src.reserve((size - src.len()).min(READ_CHUNK_SIZE));
            return Ok(None);
        }

        self.state = DecodeState::Head;
        tracing::trace!(size, kind = ?self.expected, "Decoded frame");
        Ok(Some(src.split_to(size).freeze()))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.check_size()?;
        let size = frame.payload.len();
        dst.reserve(LENGTH_FIELD_SIZE + size);
        dst.put_i32(size as i32);
        dst.extend_from_slice(&frame.payload);
        tracing::trace!(size, kind = ?frame.kind, "Encoded frame");
        Ok(())
    }
}
