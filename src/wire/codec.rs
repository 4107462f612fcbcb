//! Length-prefixed frame codec.
//!
//! Wraps [`tokio_util::codec::LengthDelimitedCodec`] (4-byte big-endian
//! length prefix) and adds the one-byte [`FrameKind`] discriminator plus the
//! bincode payload on top.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use live_harness::wire::FrameCodec;
//!
//! let mut reader = FramedRead::new(read_half, FrameCodec::new(max_frame_bytes));
//! // ...after the handshake succeeds:
//! reader.decoder_mut().upgrade();
//! ```

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::wire::messages::{FrameKind, Message};
use crate::{AppError, Result};

/// Frame limit in force until the peer has been verified: 64 KiB.
///
/// Keeps an unauthenticated peer from making the host allocate large
/// buffers before it has proven it knows the shared secret.
pub const MAX_HANDSHAKE_FRAME_BYTES: usize = 64 * 1024;

/// Codec turning a byte stream into [`Message`]s and back.
///
/// # Decoder
///
/// `Ok(None)` means more bytes are needed. A length prefix above the active
/// limit, an empty frame, an unknown kind byte, or a payload that does not
/// decode to exactly the frame's bytes returns [`AppError::Protocol`]. The
/// size check happens before the frame body is buffered.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a codec limited to [`MAX_HANDSHAKE_FRAME_BYTES`] until
    /// [`upgrade`](Self::upgrade) raises it to `max_frame_bytes`.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        let limit = max_frame_bytes.min(MAX_HANDSHAKE_FRAME_BYTES);
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(limit)
                .new_codec(),
            max_frame_bytes,
        }
    }

    /// Create a codec already running at the full limit.
    #[must_use]
    pub fn upgraded(max_frame_bytes: usize) -> Self {
        let mut codec = Self::new(max_frame_bytes);
        codec.upgrade();
        codec
    }

    /// Lift the handshake limit to the configured maximum.
    pub fn upgrade(&mut self) {
        self.inner.set_max_frame_length(self.max_frame_bytes);
    }

    /// Limit currently enforced on both directions.
    #[must_use]
    pub fn max_frame_length(&self) -> usize {
        self.inner.max_frame_length()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let limit = self.max_frame_length();
        match self.inner.decode(src) {
            Ok(Some(frame)) => decode_frame(&frame).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(map_codec_error(err, limit)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(AppError::Network(format!(
                "stream closed with {} bytes of a partial frame buffered",
                src.len()
            ))),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let limit = self.max_frame_length();
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(item.kind().as_byte());
        item.encode_payload(&mut body)?;

        self.inner
            .encode(body.freeze(), dst)
            .map_err(|err| map_codec_error(err, limit))
    }
}

/// Split a complete frame into kind and payload and decode it.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] for empty frames, unknown kinds, or
/// malformed payloads.
pub fn decode_frame(frame: &[u8]) -> Result<Message> {
    let (&kind_byte, payload) = frame
        .split_first()
        .ok_or_else(|| AppError::Protocol("empty frame".into()))?;
    let kind = FrameKind::try_from(kind_byte)?;
    Message::decode_payload(kind, payload)
}

// ── Private helper ────────────────────────────────────────────────────────────

/// Map a [`LengthDelimitedCodec`] error to an [`AppError`].
///
/// The inner codec reports oversized frames as `InvalidData` when decoding
/// and `InvalidInput` when encoding; everything else comes from the transport.
fn map_codec_error(err: std::io::Error, limit: usize) -> AppError {
    if matches!(
        err.kind(),
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput
    ) {
        AppError::Protocol(format!("frame too large: exceeds {limit} bytes"))
    } else {
        AppError::from(err)
    }
}
