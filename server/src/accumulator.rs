//! Inbound staging area between the session read loops and the tick loop
//!
//! Every read loop appends to the accumulator of the instance its session
//! is bound to. Once per tick the instance takes everything appended so far
//! in one atomic step and hands it to the application. Inputs from a single
//! session keep their arrival order; inputs from different sessions are
//! interleaved in whatever order the read loops won the lock.

use crate::session::{Session, SessionId};
use parking_lot::Mutex;
use shared::{Frame, Payload};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inputs expected per tick before the buffer has to grow
const DEFAULT_CAPACITY: usize = 64;

/// One decoded frame together with the session that sent it
#[derive(Debug, Clone)]
pub struct Input {
    session: Arc<Session>,
    payload: Payload,
    timestamp: Option<u64>,
    received_at: Instant,
}

impl Input {
    pub fn new(session: Arc<Session>, frame: Frame) -> Self {
        Self {
            session,
            payload: Payload::from(frame.payload),
            timestamp: frame.timestamp,
            received_at: Instant::now(),
        }
    }

    /// The sending session, usable directly as a reply recipient
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Sender's unix timestamp in nanoseconds, for timestamped framing only
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Time between the sender stamping the frame and the server reading it.
    ///
    /// `None` without a timestamp, or when the sender's clock is ahead of ours.
    pub fn transit(&self) -> Option<Duration> {
        let sent = self.timestamp?;
        let now = shared::unix_nanos();
        now.checked_sub(sent).map(Duration::from_nanos)
    }
}

/// Thread-safe append/drain buffer of [`Input`]s
pub struct Accumulator {
    inputs: Mutex<Vec<Input>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inputs: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn add(&self, input: Input) {
        self.inputs.lock().push(input);
    }

    /// Appends several inputs under a single lock acquisition, keeping
    /// them contiguous.
    pub fn extend(&self, inputs: impl IntoIterator<Item = Input>) {
        self.inputs.lock().extend(inputs);
    }

    /// Takes every input appended so far and leaves the accumulator empty.
    ///
    /// Each input is returned by exactly one call. The returned vector is
    /// sized to its contents; the internal buffer keeps its capacity for
    /// the next tick.
    pub fn consume(&self) -> Vec<Input> {
        let mut inputs = self.inputs.lock();
        inputs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.lock().is_empty()
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}
