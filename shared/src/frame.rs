//! Length-prefixed framing used by both ends of a connection.
//!
//! Every frame is a 2-byte big-endian payload length, an optional 8-byte
//! big-endian timestamp, then exactly `length` payload bytes:
//!
//! ```text
//! [u16 length][u64 timestamp (Timestamped only)][payload]
//! ```
//!
//! [`decode_frame`] inspects a single read window and reports short or
//! oversized frames as distinct errors. [`FrameReader`] keeps a streaming
//! buffer on top of it so frames split across TCP reads are reassembled.

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX_SIZE: usize = 2;
pub const TIMESTAMP_SIZE: usize = 8;
/// Largest payload a 2-byte length prefix can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

const READ_CHUNK_SIZE: usize = 4096;

/// Which header layout frames use on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// `[length][payload]`
    #[default]
    Plain,
    /// `[length][timestamp][payload]`, the timestamp being sender-side unix nanoseconds
    Timestamped,
}

impl FrameFormat {
    pub fn header_size(self) -> usize {
        match self {
            FrameFormat::Plain => LENGTH_PREFIX_SIZE,
            FrameFormat::Timestamped => LENGTH_PREFIX_SIZE + TIMESTAMP_SIZE,
        }
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Present only for [`FrameFormat::Timestamped`] frames
    pub timestamp: Option<u64>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: None,
            payload: payload.into(),
        }
    }

    pub fn stamped(payload: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            timestamp: Some(timestamp),
            payload: payload.into(),
        }
    }

    /// Appends this frame's wire form to `out`.
    ///
    /// A timestamped frame without a timestamp of its own is stamped with the
    /// current time.
    pub fn encode(&self, format: FrameFormat, out: &mut Vec<u8>) -> Result<usize, FrameError> {
        encode_with(format, &self.payload, self.timestamp, out)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("need {needed} header bytes, only {available} available")]
    ShortHeader { needed: usize, available: usize },
    #[error("declared length {declared} exceeds the {available} bytes available")]
    Truncated { declared: usize, available: usize },
    #[error("declared length {declared} exceeds the maximum of {max} bytes")]
    TooLarge { declared: usize, max: usize },
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the length prefix itself cannot describe a valid frame,
    /// as opposed to a failure of the underlying connection.
    pub fn is_malformed(&self) -> bool {
        matches!(self, FrameError::Truncated { .. } | FrameError::TooLarge { .. })
    }
}

/// Encodes `payload` as a single frame, stamping it with the current time
/// when the format carries a timestamp.
pub fn encode_frame(
    format: FrameFormat,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<usize, FrameError> {
    encode_with(format, payload, None, out)
}

fn encode_with(
    format: FrameFormat,
    payload: &[u8],
    timestamp: Option<u64>,
    out: &mut Vec<u8>,
) -> Result<usize, FrameError> {
    let len = payload.len();
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::TooLarge {
            declared: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    out.reserve(format.header_size() + len);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    if format == FrameFormat::Timestamped {
        let timestamp = timestamp.unwrap_or_else(unix_nanos);
        out.extend_from_slice(&timestamp.to_be_bytes());
    }
    out.extend_from_slice(payload);

    Ok(format.header_size() + len)
}

/// Decodes the frame at the start of `window`.
///
/// Returns the frame and the number of bytes it occupied. Nothing is
/// consumed on error; a declared length above `max_len` is reported as
/// soon as the length prefix is visible.
pub fn decode_frame(
    window: &[u8],
    format: FrameFormat,
    max_len: usize,
) -> Result<(Frame, usize), FrameError> {
    if window.len() < LENGTH_PREFIX_SIZE {
        return Err(FrameError::ShortHeader {
            needed: format.header_size(),
            available: window.len(),
        });
    }

    let declared = u16::from_be_bytes([window[0], window[1]]) as usize;
    if declared > max_len {
        return Err(FrameError::TooLarge {
            declared,
            max: max_len,
        });
    }

    let header = format.header_size();
    if window.len() < header {
        return Err(FrameError::ShortHeader {
            needed: header,
            available: window.len(),
        });
    }

    let timestamp = match format {
        FrameFormat::Plain => None,
        FrameFormat::Timestamped => {
            let mut raw = [0u8; TIMESTAMP_SIZE];
            raw.copy_from_slice(&window[LENGTH_PREFIX_SIZE..header]);
            Some(u64::from_be_bytes(raw))
        }
    };

    let available = window.len() - header;
    if declared > available {
        return Err(FrameError::Truncated {
            declared,
            available,
        });
    }

    let frame = Frame {
        timestamp,
        payload: window[header..header + declared].to_vec(),
    };
    Ok((frame, header + declared))
}

/// Writes one frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    format: FrameFormat,
    payload: &[u8],
) -> Result<(), FrameError> {
    let mut buf = Vec::with_capacity(format.header_size() + payload.len());
    encode_frame(format, payload, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Streaming frame decoder over any async byte source.
///
/// Bytes read past the end of one frame stay buffered for the next call,
/// so frames that arrive split or coalesced by TCP decode the same way.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    format: FrameFormat,
    max_len: usize,
    discard: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, format: FrameFormat, max_len: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
            format,
            max_len: max_len.min(MAX_PAYLOAD_SIZE),
            discard: 0,
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Number of bytes read from the source but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next complete frame.
    ///
    /// Returns [`FrameError::Closed`] when the peer closes cleanly between
    /// frames and an `UnexpectedEof` I/O error when it closes mid-frame.
    /// Cancel safe: a dropped call loses no buffered bytes.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.buf.len());
                self.buf.drain(..n);
                self.discard -= n;
            }

            if self.discard == 0 {
                match decode_frame(&self.buf, self.format, self.max_len) {
                    Ok((frame, used)) => {
                        self.buf.drain(..used);
                        return Ok(frame);
                    }
                    Err(FrameError::ShortHeader { .. }) | Err(FrameError::Truncated { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            self.fill().await?;
        }
    }

    /// Drops the frame at the head of the buffer, including payload bytes
    /// that have not arrived yet. Used to step over an oversized frame.
    ///
    /// Returns the declared payload length that is being skipped.
    pub fn skip_frame(&mut self) -> usize {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return 0;
        }
        let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        self.discard = self.format.header_size() + declared;
        declared
    }

    async fn fill(&mut self) -> Result<(), FrameError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            if self.buf.is_empty() && self.discard == 0 {
                return Err(FrameError::Closed);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// Current wall-clock time in unix nanoseconds.
pub fn unix_nanos() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    (nanos.min(u64::MAX as u128)) as u64
}
