//! Payload contract and the closed message schema spoken by the bundled
//! applications.
//!
//! The server core only ever moves [`Payload`] bytes. Anything implementing
//! [`Encode`] can be turned into one: the hand-written [`ErrorPacket`] that
//! the core itself sends, and the serde-derived [`Packet`] enum used by the
//! echo and chat applications.

use crate::frame::MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("buffer of {available} bytes cannot hold {needed} bytes")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
}

/// Size/Encode contract for anything sent over the wire.
pub trait Encode {
    /// Exact number of bytes `encode` writes.
    fn size(&self) -> usize;

    /// Writes the encoded form into the start of `buf`.
    fn encode(&self, buf: &mut [u8]) -> Result<(), EncodeError>;

    fn to_payload(&self) -> Result<Payload, EncodeError> {
        let size = self.size();
        if size > MAX_PAYLOAD_SIZE {
            return Err(EncodeError::TooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut buf = vec![0u8; size];
        self.encode(&mut buf)?;
        Ok(Payload::from(buf))
    }
}

impl Encode for [u8] {
    fn size(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        check_capacity(self.len(), buf)?;
        buf[..self.len()].copy_from_slice(self);
        Ok(())
    }
}

impl Encode for str {
    fn size(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        self.as_bytes().encode(buf)
    }
}

fn check_capacity(needed: usize, buf: &[u8]) -> Result<(), EncodeError> {
    if buf.len() < needed {
        return Err(EncodeError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Immutable, cheaply cloneable encoded message body.
///
/// Broadcasting one payload to many sessions clones the handle, not the bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload(bytes.into())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload(text.as_bytes().into())
    }
}

/// Error notice the server sends before closing a connection it will not
/// admit. Encoded as a big-endian `u16` code followed by the UTF-8 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u16,
    pub message: String,
}

impl ErrorPacket {
    pub const SERVER_FULL: u16 = 0;
    pub const BAD_PACKET_SIZE: u16 = 1;

    pub fn server_full() -> Self {
        Self {
            code: Self::SERVER_FULL,
            message: "server is full".to_string(),
        }
    }

    pub fn bad_packet_size() -> Self {
        Self {
            code: Self::BAD_PACKET_SIZE,
            message: "packet size sent by client is of wrong length".to_string(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([bytes[0], bytes[1]]);
        let message = std::str::from_utf8(&bytes[2..]).ok()?.to_string();
        Some(Self { code, message })
    }
}

impl Encode for ErrorPacket {
    fn size(&self) -> usize {
        2 + self.message.len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        check_capacity(self.size(), buf)?;
        buf[..2].copy_from_slice(&self.code.to_be_bytes());
        buf[2..self.size()].copy_from_slice(self.message.as_bytes());
        Ok(())
    }
}

/// Messages exchanged by the bundled echo and chat applications.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    /// First frame of every connection.
    Hello {
        name: String,
        password: Option<String>,
    },
    Welcome {
        session_id: u64,
    },
    Rejected {
        reason: String,
    },
    Text(String),
    Chat {
        from: String,
        room: String,
        text: String,
    },
    Notice(String),
}

impl Packet {
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl Encode for Packet {
    fn size(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |n| n as usize)
    }

    fn encode(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        let needed = bincode::serialized_size(self)? as usize;
        check_capacity(needed, buf)?;
        bincode::serialize_into(&mut buf[..needed], self)?;
        Ok(())
    }
}
