//! # Tick Server Library
//!
//! This library provides a tick-driven TCP server core for real-time
//! multiplayer applications. It accepts connections, frames the byte
//! stream into messages, batches every message received during a tick,
//! hands the batch to application code, and delivers the application's
//! replies back to the right sessions at the end of the tick.
//!
//! ## Core Responsibilities
//!
//! ### Connection Handling
//! The listener accepts TCP connections and runs a one-frame handshake
//! with each of them. The application sees the first frame and decides
//! whether the connection becomes a session. A full server answers with
//! an error notice instead.
//!
//! ### Input Batching
//! Every session's read loop appends decoded frames to the accumulator of
//! its instance. Once per tick the instance drains the accumulator and
//! hands the application everything received since the previous tick.
//!
//! ### Output Coalescing
//! Messages the application addresses to a session, a group, or everyone
//! are merged per recipient and shipped as one batch, so each session gets
//! a single write per tick.
//!
//! ### Session Health
//! Sessions that go silent past the read timeout, stall on writes, or let
//! their outbound queue fill up are terminated. The application is told
//! about each termination exactly once.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! Each session runs a read task and a write task. Each instance runs a
//! tick task and a disconnect task. The listener runs an accept loop plus
//! one short-lived task per handshake. No task ever waits on a slow peer
//! while holding a lock shared with another session.
//!
//! ### Backpressure
//! Outbound queues are bounded. Delivery never blocks: a session whose
//! queue is full is dropped as a bad receiver, which keeps the tick loop
//! running at its configured rate regardless of individual clients.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! One admitted connection: framing, timeouts, the outbound queue and the
//! idempotent terminate path.
//!
//! ### Group Module (`group`)
//! Thread-safe sets of sessions with broadcast delivery.
//!
//! ### Accumulator Module (`accumulator`)
//! Append/drain staging of inputs between read loops and the tick loop.
//!
//! ### Dispatcher Module (`dispatcher`)
//! Per-recipient coalescing and end-of-tick flushing.
//!
//! ### Instance Module (`instance`)
//! The tick loop, admission, session transfer and shutdown.
//!
//! ### Listener Module (`listener`)
//! Accept loop, handshake and signal-driven shutdown.
//!
//! ### Apps Module (`apps`)
//! Bundled echo and chat applications.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::apps::Echo;
//! use server::{Config, Instance, Listener};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), server::Error> {
//!     // 20 ticks per second, at most 32 sessions
//!     let config = Config::default().with_tick_rate(20).with_max_sessions(32);
//!     let instance = Instance::new(Echo::default(), config);
//!
//!     // Serve until Ctrl+C; every session is closed on the way out
//!     let listener = Listener::bind("127.0.0.1:8888", instance).await?;
//!     listener.run().await
//! }
//! ```

pub mod accumulator;
pub mod apps;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod game;
pub mod group;
pub mod instance;
pub mod listener;
pub mod session;

pub use accumulator::{Accumulator, Input};
pub use config::{Config, MalformedFramePolicy};
pub use dispatcher::{Dispatcher, FlushStats, Recipient, RecipientKey};
pub use error::{Error, Result};
pub use game::{Admission, Game, Outbox};
pub use group::{Group, GroupId};
pub use instance::{AdmitError, Instance, Lifecycle};
pub use listener::{shutdown_signal, Listener};
pub use session::{Batch, Disconnect, DisconnectReason, Session, SessionId};
