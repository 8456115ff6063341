//! The application contract plugged into an instance
//!
//! The core never interprets payloads. An application decides who may
//! join, turns each tick's inputs into outbound messages, and learns when
//! a session leaves. The hooks may be called concurrently with each other
//! (handshakes and disconnects run on their own tasks while the tick loop
//! runs `update`), so implementations guard their own state.

use crate::accumulator::Input;
use crate::dispatcher::Recipient;
use crate::session::{DisconnectReason, Session, SessionId};
use shared::{Frame, Payload};
use std::sync::Arc;

/// Answer to a handshake
#[derive(Debug, Clone)]
pub struct Admission {
    pub accepted: bool,
    /// Written to the client before it is admitted or closed
    pub response: Option<Payload>,
}

impl Admission {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            response: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            accepted: false,
            response: None,
        }
    }

    pub fn with_response(mut self, response: Payload) -> Self {
        self.response = Some(response);
        self
    }
}

/// Messages produced by one call to [`Game::update`]
///
/// Entries are handed to the dispatcher in the order they were added, so
/// a recipient addressed several times receives its payloads in that order.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: Vec<(Recipient, Vec<Payload>)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, recipient: Recipient, payload: Payload) {
        self.entries.push((recipient, vec![payload]));
    }

    pub fn send_all(&mut self, recipient: Recipient, payloads: Vec<Payload>) {
        self.entries.push((recipient, payloads));
    }

    pub fn reply(&mut self, session: &Arc<Session>, payload: Payload) {
        self.send(Recipient::Session(Arc::clone(session)), payload);
    }

    pub fn broadcast(&mut self, payload: Payload) {
        self.send(Recipient::All, payload);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Extend<(Recipient, Vec<Payload>)> for Outbox {
    fn extend<I: IntoIterator<Item = (Recipient, Vec<Payload>)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl IntoIterator for Outbox {
    type Item = (Recipient, Vec<Payload>);
    type IntoIter = std::vec::IntoIter<(Recipient, Vec<Payload>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Application logic driven by an [`Instance`](crate::Instance)
pub trait Game: Send + Sync + 'static {
    /// Decides whether a new connection may join, given its first frame.
    fn validate(&self, session: SessionId, first: &Frame) -> Admission;

    /// Called once after a validated session has been admitted and before
    /// any of its inputs are delivered. Runs while the instance holds its
    /// admission lock, so it must not call back into `admit` or `stop`.
    fn admitted(&self, _session: &Arc<Session>) {}

    /// Called when a session accepted by `validate` will never be admitted:
    /// the response could not be written, the instance filled up or
    /// stopped, or the connection ended during admission. Anything
    /// reserved in `validate` should be released here.
    fn abandoned(&self, _session: SessionId) {}

    /// Called once per tick with every input received since the last tick,
    /// possibly none.
    fn update(&self, tick: u64, batch: Vec<Input>) -> Outbox;

    /// Called exactly once for every admitted session that terminates,
    /// never before its `admitted`. Same locking rule as `admitted`.
    fn disconnect(&self, session: SessionId, reason: &DisconnectReason);
}
