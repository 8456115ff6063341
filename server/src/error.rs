//! Errors that stop the server from starting or running.
//!
//! Session-level failures never surface here; they end the affected session
//! and reach the application as a [`DisconnectReason`](crate::DisconnectReason).

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
