//! Newline-delimited JSON frame codec.
//!
//! Wire format:
//! ```text
//! {"port":5555,"players":1,"status":"open"}\n
//! ```
//! One record is one JSON document followed by a single `\n`.  The same
//! framing is used for discovery datagrams (exactly one frame per datagram)
//! and for the session byte stream (any number of frames back to back).
//!
//! # Why a newline is a safe delimiter
//!
//! `serde_json` never emits a raw control character inside its output: a
//! newline inside a string field is written as the two bytes `\` `n`.  The
//! only `0x0A` byte that can appear in an encoded frame is therefore the
//! terminating delimiter itself, so splitting the stream on `0x0A` always
//! lands on a frame boundary.
//!
//! # Streams vs. frames
//!
//! TCP is a *stream* protocol: a single `read()` may return half a frame, or
//! three and a half frames.  [`decode_stream`] handles that by decoding every
//! complete segment and handing back the trailing partial segment untouched.
//! [`FrameBuffer`] wraps this in the accumulate → decode → drain loop the
//! session receive task needs.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::error::Category;
use thiserror::Error;
use tracing::{debug, warn};

/// Byte that terminates every frame.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Written to close a frame that was only partly sent.  A raw NUL is never
/// valid JSON, so the fragment it terminates fails to decode whatever its
/// content, and the frame after it starts clean.
pub const FRAME_ABORT: &[u8] = &[0x00, FRAME_DELIMITER];

/// Largest partial frame the [`FrameBuffer`] will hold while waiting for a
/// delimiter.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The record could not be serialized.
    #[error("failed to encode record: {0}")]
    Encode(String),

    /// The segment is not valid JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The segment is valid JSON but does not have the expected record shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A partial frame grew past [`MAX_FRAME_LEN`] without a delimiter.
    #[error("frame exceeds {limit} bytes without a delimiter ({len} buffered)")]
    Oversized { len: usize, limit: usize },
}

impl FrameError {
    fn from_decode(e: serde_json::Error) -> Self {
        match e.classify() {
            Category::Data => FrameError::ProtocolViolation(e.to_string()),
            Category::Syntax | Category::Eof | Category::Io => FrameError::Malformed(e.to_string()),
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `record` as a single frame (JSON text plus the trailing delimiter).
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if the record cannot be represented as JSON
/// (for example a map with non-string keys).
///
/// # Examples
///
/// ```rust
/// use lobby_core::protocol::codec::encode;
///
/// let bytes = encode(&serde_json::json!({"x": 1})).unwrap();
/// assert_eq!(bytes, b"{\"x\":1}\n");
/// ```
pub fn encode<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(record).map_err(|e| FrameError::Encode(e.to_string()))?;
    debug_assert!(!buf.contains(&FRAME_DELIMITER));
    buf.push(FRAME_DELIMITER);
    Ok(buf)
}

/// Decodes one frame body.  A trailing delimiter is tolerated.
///
/// # Errors
///
/// [`FrameError::Malformed`] for invalid JSON, [`FrameError::ProtocolViolation`]
/// when the JSON does not fit `T`.
pub fn decode_frame<T: DeserializeOwned>(segment: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(segment).map_err(FrameError::from_decode)
}

/// Result of scanning a buffer for complete frames.
#[derive(Debug)]
pub struct DecodedStream<'a, T> {
    /// One entry per complete, non-blank segment, in stream order.
    pub records: Vec<Result<T, FrameError>>,
    /// Bytes after the last delimiter: the start of a frame not yet complete.
    pub remainder: &'a [u8],
}

/// Splits `buffer` on [`FRAME_DELIMITER`] and decodes every complete segment.
///
/// A malformed segment produces an `Err` entry but does not stop the scan:
/// the following segments are still decoded.  Blank segments (for example a
/// stray `\r\n`) are skipped.
///
/// # Examples
///
/// ```rust
/// use lobby_core::protocol::codec::decode_stream;
/// use serde_json::Value;
///
/// let out = decode_stream::<Value>(b"{\"a\":1}\n{\"b\"");
/// assert_eq!(out.records.len(), 1);
/// assert_eq!(out.remainder, b"{\"b\"");
/// ```
pub fn decode_stream<T: DeserializeOwned>(buffer: &[u8]) -> DecodedStream<'_, T> {
    let mut records = Vec::new();
    let mut start = 0;

    while let Some(offset) = buffer[start..].iter().position(|&b| b == FRAME_DELIMITER) {
        let segment = &buffer[start..start + offset];
        start += offset + 1;

        if segment.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        records.push(decode_frame(segment));
    }

    DecodedStream {
        records,
        remainder: &buffer[start..],
    }
}

// ── Streaming accumulator ─────────────────────────────────────────────────────

/// Receive-side accumulator for a frame stream.
///
/// Bytes are appended with [`FrameBuffer::push`]; every frame completed by
/// those bytes is decoded and returned.  Malformed frames are logged and
/// dropped so that one bad record never ends the stream.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Set after an oversized frame was discarded: input is ignored up to and
    /// including the next delimiter.
    resyncing: bool,
    dropped: u64,
}

impl FrameBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            resyncing: false,
            dropped: 0,
        }
    }

    /// Appends `bytes` and returns every record they completed, oldest first.
    pub fn push<T: DeserializeOwned>(&mut self, mut bytes: &[u8]) -> Vec<T> {
        if self.resyncing {
            match bytes.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(pos) => {
                    bytes = &bytes[pos + 1..];
                    self.resyncing = false;
                }
                None => return Vec::new(),
            }
        }

        self.buf.extend_from_slice(bytes);

        let DecodedStream { records, remainder } = decode_stream::<T>(&self.buf);
        let consumed = self.buf.len() - remainder.len();

        let mut good = Vec::with_capacity(records.len());
        for record in records {
            match record {
                Ok(r) => good.push(r),
                Err(e) => {
                    self.dropped += 1;
                    warn!("dropping frame: {e}");
                }
            }
        }

        self.buf.drain(..consumed);

        if self.buf.len() > MAX_FRAME_LEN {
            let e = FrameError::Oversized {
                len: self.buf.len(),
                limit: MAX_FRAME_LEN,
            };
            warn!("discarding partial frame: {e}");
            self.buf.clear();
            self.resyncing = true;
            self.dropped += 1;
        }

        if !good.is_empty() {
            debug!("decoded {} frame(s), {} byte(s) pending", good.len(), self.buf.len());
        }
        good
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Number of frames dropped as malformed or oversized so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
