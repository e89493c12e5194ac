//! Framed codec for child server communication.
//!
//! Frames each message as `Content-Length: <n>\r\n\r\n<utf-8 json>` and
//! serializes with serde_json. Works over any AsyncRead/AsyncWrite
//! (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted in either direction.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Largest header block scanned before giving up on finding the separator.
const MAX_HEADER_LEN: usize = 4 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Errors produced while framing or unframing messages.
///
/// Every decode failure is structured; a failed decode never leaves a
/// half-parsed item behind.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("frame header missing Content-Length")]
    MissingContentLength,

    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    #[error("frame of {len} bytes exceeds maximum {max}")]
    Oversized { len: usize, max: usize },

    #[error("stream ended mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec that frames messages with a `Content-Length` header and
/// serializes with JSON.
pub struct ContentLengthCodec<T> {
    /// Declared payload length once the current frame's header has been
    /// consumed from the buffer.
    payload_len: Option<usize>,
    _phantom: PhantomData<T>,
}

impl<T> Default for ContentLengthCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ContentLengthCodec<T> {
    pub fn new() -> Self {
        Self {
            payload_len: None,
            _phantom: PhantomData,
        }
    }

    /// Consumes the header block from `src` and records the declared
    /// payload length. `Ok(None)` means the separator has not arrived yet.
    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<usize>, FramingError> {
        let Some(separator) = src
            .windows(HEADER_SEPARATOR.len())
            .position(|w| w == HEADER_SEPARATOR)
        else {
            if src.len() > MAX_HEADER_LEN {
                return Err(FramingError::MissingContentLength);
            }
            return Ok(None);
        };

        let header = src.split_to(separator + HEADER_SEPARATOR.len());
        let len = content_length(&header[..separator])?;
        if len > MAX_FRAME_LEN {
            return Err(FramingError::Oversized {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        self.payload_len = Some(len);
        Ok(Some(len))
    }
}

/// Extracts the Content-Length value from a header block.
fn content_length(header: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(header).map_err(|_| FramingError::MissingContentLength)?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FramingError::MissingContentLength)
}

impl<T: DeserializeOwned> Decoder for ContentLengthCodec<T> {
    type Item = T;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.payload_len {
            Some(len) => len,
            None => match self.decode_header(src)? {
                Some(len) => len,
                None => return Ok(None),
            },
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let payload = src.split_to(len);
        // The buffer now sits on the next frame boundary regardless of
        // whether the payload parses.
        self.payload_len = None;
        let item = serde_json::from_slice(&payload)?;
        Ok(Some(item))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.payload_len.is_none() => Ok(None),
            None => Err(FramingError::Truncated {
                buffered: buf.len(),
            }),
        }
    }
}

impl<T: Serialize> Encoder<T> for ContentLengthCodec<T> {
    type Error = FramingError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        let json_len = json.len();
        if json_len > MAX_FRAME_LEN {
            return Err(FramingError::Oversized {
                len: json_len,
                max: MAX_FRAME_LEN,
            });
        }
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        let header = format!("Content-Length: {json_len}\r\n\r\n");
        dst.reserve(header.len() + json_len);
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(&json);
        Ok(())
    }
}
