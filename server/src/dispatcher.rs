//! Outbound coalescing for one instance
//!
//! The application addresses messages to recipients throughout a tick. The
//! dispatcher groups them per recipient and, at the end of the tick, ships
//! one batch per recipient so each session sees a single write containing
//! everything addressed to it.

use crate::group::{Group, GroupId};
use crate::session::{Batch, Session, SessionId};
use log::debug;
use shared::Payload;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Destination of an outbound message
#[derive(Clone)]
pub enum Recipient {
    Session(Arc<Session>),
    Group(Arc<Group>),
    /// Every session admitted to the instance
    All,
}

/// Identity of a [`Recipient`], used to merge messages for the same target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientKey {
    Session(SessionId),
    Group(GroupId),
    All,
}

impl Recipient {
    pub fn key(&self) -> RecipientKey {
        match self {
            Recipient::Session(session) => RecipientKey::Session(session.id()),
            Recipient::Group(group) => RecipientKey::Group(group.id()),
            Recipient::All => RecipientKey::All,
        }
    }
}

impl From<Arc<Session>> for Recipient {
    fn from(session: Arc<Session>) -> Self {
        Recipient::Session(session)
    }
}

impl From<Arc<Group>> for Recipient {
    fn from(group: Arc<Group>) -> Self {
        Recipient::Group(group)
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Session(session) => write!(f, "Session({})", session.id()),
            Recipient::Group(group) => write!(f, "Group({:?})", group.name()),
            Recipient::All => write!(f, "All"),
        }
    }
}

/// Outcome of one flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Distinct recipients that had something queued
    pub recipients: usize,
    /// Batches accepted by session queues
    pub delivered: usize,
    /// Recipients dropped because they had already left
    pub skipped: usize,
}

pub struct Dispatcher {
    /// All sessions of the owning instance
    members: Arc<Group>,
    pending: Vec<(Recipient, Vec<Payload>)>,
    index: HashMap<RecipientKey, usize>,
}

impl Dispatcher {
    pub fn new(members: Arc<Group>) -> Self {
        Self {
            members,
            pending: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Appends payloads to the recipient's pending list, in order.
    pub fn enqueue(&mut self, recipient: Recipient, payloads: impl IntoIterator<Item = Payload>) {
        let slot = match self.index.get(&recipient.key()) {
            Some(&slot) => slot,
            None => {
                self.index.insert(recipient.key(), self.pending.len());
                self.pending.push((recipient, Vec::new()));
                self.pending.len() - 1
            }
        };
        self.pending[slot].1.extend(payloads);
    }

    /// Number of distinct recipients with queued payloads
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Ships every pending list as one batch and clears the dispatcher.
    ///
    /// Group recipients are first reconciled with the instance's current
    /// membership, so a session that left since the message was addressed
    /// is not written to. A session recipient that has terminated is skipped.
    pub fn flush(&mut self) -> FlushStats {
        let pending = std::mem::take(&mut self.pending);
        self.index.clear();

        let mut stats = FlushStats::default();
        let mut live: Option<HashSet<SessionId>> = None;

        for (recipient, payloads) in pending {
            if payloads.is_empty() {
                continue;
            }
            stats.recipients += 1;
            let batch: Batch = payloads.into();

            match recipient {
                Recipient::Session(session) => {
                    if session.ship(batch) {
                        stats.delivered += 1;
                    } else {
                        debug!("Skipping batch for departed session {}", session.id());
                        stats.skipped += 1;
                    }
                }
                Recipient::Group(group) => {
                    let live = live.get_or_insert_with(|| self.members.ids());
                    if group.rectify(live) {
                        stats.delivered += group.ship(batch);
                    } else {
                        debug!("Skipping batch for empty group {:?}", group.name());
                        stats.skipped += 1;
                    }
                }
                Recipient::All => stats.delivered += self.members.ship(batch),
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn members(count: u64) -> (Arc<Group>, Vec<(Arc<Session>, mpsc::Receiver<Batch>)>) {
        let group = Arc::new(Group::new("members"));
        let sessions: Vec<_> = (1..=count).map(|id| Session::new(id, None, 8)).collect();
        for (session, _) in &sessions {
            group.add(Arc::clone(session));
        }
        (group, sessions)
    }

    fn payload(text: &str) -> Payload {
        Payload::from(text)
    }

    #[test]
    fn test_same_recipient_coalesces_into_one_batch() {
        let (group, mut sessions) = members(1);
        let mut dispatcher = Dispatcher::new(group);
        let target = Recipient::Session(Arc::clone(&sessions[0].0));

        for n in 0..5 {
            dispatcher.enqueue(target.clone(), [payload(&format!("m{}", n))]);
        }
        assert_eq!(dispatcher.pending(), 1);

        let stats = dispatcher.flush();
        assert_eq!(stats.delivered, 1);

        let rx = &mut sessions[0].1;
        let batch = rx.try_recv().unwrap();
        let texts: Vec<_> = batch.iter().map(|p| p.as_bytes().to_vec()).collect();
        assert_eq!(
            texts,
            vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec(), b"m4".to_vec()]
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_departed_session_skipped() {
        let (group, mut sessions) = members(2);
        let mut dispatcher = Dispatcher::new(group);

        for (session, _) in &sessions {
            dispatcher.enqueue(Recipient::Session(Arc::clone(session)), [payload("state")]);
        }
        sessions[0].0.close();

        let stats = dispatcher.flush();
        assert_eq!(stats.recipients, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.skipped, 1);
        assert!(sessions[0].1.try_recv().is_err());
        assert!(sessions[1].1.try_recv().is_ok());
    }

    #[test]
    fn test_all_reaches_every_member() {
        let (group, mut sessions) = members(3);
        let mut dispatcher = Dispatcher::new(group);

        dispatcher.enqueue(Recipient::All, [payload("a")]);
        dispatcher.enqueue(Recipient::All, [payload("b")]);
        assert_eq!(dispatcher.flush().delivered, 3);

        for (_, rx) in &mut sessions {
            assert_eq!(rx.try_recv().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_group_rectified_against_members() {
        let (members_group, mut sessions) = members(2);
        let (outsider, mut outsider_rx) = Session::new(99, None, 8);

        let room = Arc::new(Group::new("room"));
        room.add(Arc::clone(&sessions[0].0));
        room.add(Arc::clone(&outsider));

        let mut dispatcher = Dispatcher::new(members_group);
        dispatcher.enqueue(Recipient::Group(Arc::clone(&room)), [payload("hi room")]);
        let stats = dispatcher.flush();

        assert_eq!(stats.delivered, 1);
        assert!(!room.contains(99));
        assert!(outsider_rx.try_recv().is_err());
        assert!(sessions[0].1.try_recv().is_ok());
        assert!(sessions[1].1.try_recv().is_err());
    }

    #[test]
    fn test_flush_clears_pending() {
        let (group, mut sessions) = members(1);
        let mut dispatcher = Dispatcher::new(group);

        dispatcher.enqueue(Recipient::All, [payload("once")]);
        dispatcher.enqueue(Recipient::All, Vec::new());
        dispatcher.flush();
        assert!(dispatcher.is_empty());

        let stats = dispatcher.flush();
        assert_eq!(stats, FlushStats::default());
        assert_eq!(sessions[0].1.try_recv().unwrap().len(), 1);
        assert!(sessions[0].1.try_recv().is_err());
    }

    #[test]
    fn test_distinct_recipients_get_distinct_batches() {
        let (group, mut sessions) = members(2);
        let mut dispatcher = Dispatcher::new(group);
        let first = Recipient::from(Arc::clone(&sessions[0].0));
        let second = Recipient::from(Arc::clone(&sessions[1].0));

        dispatcher.enqueue(first.clone(), [payload("one")]);
        dispatcher.enqueue(second, [payload("two")]);
        dispatcher.enqueue(first, [payload("three")]);
        assert_eq!(dispatcher.pending(), 2);
        dispatcher.flush();

        assert_eq!(sessions[0].1.try_recv().unwrap().len(), 2);
        assert_eq!(sessions[1].1.try_recv().unwrap().len(), 1);
    }
}
