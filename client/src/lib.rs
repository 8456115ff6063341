//! # Tick Client Library
//!
//! This library connects to a tick server over TCP and speaks its framing.
//! It is used by the interactive chat client in this crate and by the
//! workspace integration tests.
//!
//! ## Connection Lifecycle
//!
//! ### Handshake
//! A client opens a connection and sends a `Hello` as its first frame. The
//! server answers with `Welcome` carrying the session id, a `Rejected`
//! with a reason, or an error notice when it is full. All refusals surface
//! as [`ClientError::Refused`].
//!
//! ### Steady State
//! After the handshake, frames can be read one at a time with
//! [`Client::recv`], or the connection can be split with [`Client::start`]
//! into a [`Sender`] and a background reader feeding [`Incoming`].
//!
//! ### Timeouts
//! Every read and write is bounded by the client's timeout. The server
//! drops sessions that stay silent past its own read timeout, so long-lived
//! clients should send something periodically.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::Client;
//! use shared::{FrameFormat, Packet};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), client::ClientError> {
//!     let mut client = Client::connect("127.0.0.1:8888", FrameFormat::Plain).await?;
//!     let id = client.hello("ada", Some("banana")).await?;
//!     println!("joined as session {}", id);
//!
//!     client.send(&Packet::Text("hello".to_string())).await?;
//!     let reply = client.recv_packet().await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{Client, ClientError, Incoming, Result, Sender, DEFAULT_TIMEOUT};
