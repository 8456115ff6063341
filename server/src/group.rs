//! Named sets of sessions with broadcast delivery
//!
//! Every instance owns one group holding all of its admitted sessions.
//! Applications create further groups (rooms, teams) and address them as
//! broadcast recipients. A group only stores handles; membership never
//! keeps a terminated session alive beyond the next cleanup.

use crate::session::{Batch, DisconnectReason, Session, SessionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique group identifier
pub type GroupId = u64;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Thread-safe set of sessions keyed by session id
pub struct Group {
    id: GroupId,
    name: String,
    members: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl Group {
    /// Creates an empty group with a fresh id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a session to the group
    ///
    /// Returns false if a session with the same id was already a member,
    /// in which case the stored handle is replaced.
    pub fn add(&self, session: Arc<Session>) -> bool {
        self.members.lock().insert(session.id(), session).is_none()
    }

    /// Removes a session by id, returning its handle if it was a member
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.members.lock().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.members.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.members.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Snapshot of the member ids
    pub fn ids(&self) -> HashSet<SessionId> {
        self.members.lock().keys().copied().collect()
    }

    /// Snapshot of the member handles
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.members.lock().values().cloned().collect()
    }

    /// Queues the same batch for every member
    ///
    /// Each member receives a clone of the shared handle, not of the bytes.
    /// A member with a full queue is terminated by its own `ship` and does
    /// not stop delivery to the others. Returns how many members accepted
    /// the batch.
    pub fn ship(&self, batch: Batch) -> usize {
        let members = self.members.lock();
        members
            .values()
            .filter(|session| session.ship(Arc::clone(&batch)))
            .count()
    }

    /// Drops every member whose id is not in `live`
    ///
    /// Used to keep application groups consistent with the instance they
    /// belong to. Returns true if at least one member remains.
    pub fn rectify(&self, live: &HashSet<SessionId>) -> bool {
        let mut members = self.members.lock();
        members.retain(|id, _| live.contains(id));
        !members.is_empty()
    }

    /// Terminates every member and empties the group
    ///
    /// Returns the number of sessions that were members.
    pub fn close(&self, reason: DisconnectReason) -> usize {
        let members = std::mem::take(&mut *self.members.lock());
        for session in members.values() {
            session.terminate(reason.clone());
        }
        members.len()
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &self.len())
            .finish()
    }
}
