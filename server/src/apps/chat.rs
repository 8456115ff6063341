//! Multi-room chat
//!
//! Users pick a unique name in their `Hello`, start in the lobby and move
//! between rooms with slash commands. Each room is a [`Group`] addressed
//! as a broadcast recipient, so a message reaches only the sessions in the
//! sender's room.
//!
//! Commands:
//! - `/join <room>`: leave the current room and enter (or create) another
//! - `/rename <name>`: change name, announced to the current room
//! - `/who`: list the users in the current room
//! - `/rooms`: list the open rooms and their sizes

use super::{encode, password_matches};
use crate::accumulator::Input;
use crate::dispatcher::Recipient;
use crate::game::{Admission, Game, Outbox};
use crate::group::Group;
use crate::session::{DisconnectReason, Session, SessionId};
use log::{debug, info};
use parking_lot::Mutex;
use shared::{Frame, Packet};
use std::collections::HashMap;
use std::sync::Arc;

/// Room every user starts in; never removed
pub const LOBBY: &str = "lobby";

pub const MAX_NAME_LEN: usize = 24;

struct User {
    name: String,
    room: String,
}

#[derive(Default)]
struct State {
    /// Names reserved by a validated handshake, awaiting admission
    pending: HashMap<SessionId, String>,
    users: HashMap<SessionId, User>,
    rooms: HashMap<String, Arc<Group>>,
    /// Produced by hooks outside `update`, sent with the next tick
    notices: Outbox,
}

impl State {
    fn name_taken(&self, name: &str) -> bool {
        self.pending.values().any(|taken| taken == name)
            || self.users.values().any(|user| user.name == name)
    }

    fn room(&mut self, name: &str) -> Arc<Group> {
        Arc::clone(
            self.rooms
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Group::new(name))),
        )
    }

    /// Removes a session from a room, closing the room if it empties.
    fn leave(&mut self, id: SessionId, room: &str) {
        if let Some(group) = self.rooms.get(room) {
            group.remove(id);
            if group.is_empty() && room != LOBBY {
                debug!("Closing empty room {}", room);
                self.rooms.remove(room);
            }
        }
    }

    fn notify_room(&mut self, room: &str, text: String) {
        if let Some(group) = self.rooms.get(room).cloned() {
            if let Some(payload) = encode(&Packet::Notice(text)) {
                self.notices.send(Recipient::Group(group), payload);
            }
        }
    }
}

pub struct Chat {
    password: Option<String>,
    state: Mutex<State>,
}

impl Chat {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password,
            state: Mutex::new(State::default()),
        }
    }

    /// Names of the rooms that currently have members, sorted.
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<_> = self.state.lock().rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn users(&self) -> usize {
        self.state.lock().users.len()
    }

    fn reject(reason: &str) -> Admission {
        let response = encode(&Packet::Rejected {
            reason: reason.to_string(),
        });
        match response {
            Some(payload) => Admission::reject().with_response(payload),
            None => Admission::reject(),
        }
    }

    fn command(state: &mut State, outbox: &mut Outbox, input: &Input, line: &str) {
        let id = input.session_id();
        let mut parts = line.trim_start_matches('/').splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let argument = parts.next().map(str::trim).unwrap_or_default();

        let Some(user) = state.users.get(&id) else {
            return;
        };
        let name = user.name.clone();
        let room = user.room.clone();

        let reply = match command {
            "join" if argument.is_empty() => "usage: /join <room>".to_string(),
            "join" if argument == room => format!("already in {}", room),
            "join" => {
                state.leave(id, &room);
                state.notify_room(&room, format!("{} left for {}", name, argument));

                let group = state.room(argument);
                group.add(Arc::clone(input.session()));
                if let Some(user) = state.users.get_mut(&id) {
                    user.room = argument.to_string();
                }
                state.notify_room(argument, format!("{} joined {}", name, argument));
                return;
            }
            "rename" if !valid_name(argument) => format!(
                "names must be 1 to {} characters without spaces",
                MAX_NAME_LEN
            ),
            "rename" if state.name_taken(argument) => format!("{} is taken", argument),
            "rename" => {
                if let Some(user) = state.users.get_mut(&id) {
                    user.name = argument.to_string();
                }
                state.notify_room(&room, format!("{} is now known as {}", name, argument));
                return;
            }
            "who" => {
                let mut names: Vec<_> = state
                    .users
                    .values()
                    .filter(|user| user.room == room)
                    .map(|user| user.name.as_str())
                    .collect();
                names.sort();
                format!("in {}: {}", room, names.join(", "))
            }
            "rooms" => {
                let mut rooms: Vec<_> = state
                    .rooms
                    .iter()
                    .map(|(name, group)| format!("{} ({})", name, group.len()))
                    .collect();
                rooms.sort();
                format!("rooms: {}", rooms.join(", "))
            }
            other => format!("unknown command /{}", other),
        };

        if let Some(payload) = encode(&Packet::Notice(reply)) {
            outbox.reply(input.session(), payload);
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().count() <= MAX_NAME_LEN && !name.contains(char::is_whitespace)
}

impl Game for Chat {
    fn validate(&self, session: SessionId, first: &Frame) -> Admission {
        let (name, password) = match Packet::decode(&first.payload) {
            Ok(Packet::Hello { name, password }) => (name, password),
            _ => return Self::reject("expected hello"),
        };
        if !password_matches(self.password.as_deref(), password.as_deref()) {
            return Self::reject("invalid password");
        }
        if !valid_name(&name) {
            return Self::reject("invalid name");
        }

        let mut state = self.state.lock();
        if state.name_taken(&name) {
            return Self::reject("name is taken");
        }
        state.pending.insert(session, name);

        match encode(&Packet::Welcome {
            session_id: session,
        }) {
            Some(payload) => Admission::accept().with_response(payload),
            None => Admission::accept(),
        }
    }

    fn admitted(&self, session: &Arc<Session>) {
        let id = session.id();
        let mut state = self.state.lock();
        let name = state
            .pending
            .remove(&id)
            .unwrap_or_else(|| format!("user{}", id));

        state.room(LOBBY).add(Arc::clone(session));
        state.users.insert(
            id,
            User {
                name: name.clone(),
                room: LOBBY.to_string(),
            },
        );
        info!("{} ({}) joined", name, id);
        state.notify_room(LOBBY, format!("{} joined {}", name, LOBBY));
    }

    fn abandoned(&self, session: SessionId) {
        if let Some(name) = self.state.lock().pending.remove(&session) {
            debug!("Released name {} reserved by {}", name, session);
        }
    }

    fn update(&self, _tick: u64, batch: Vec<Input>) -> Outbox {
        let mut state = self.state.lock();
        let mut outbox = std::mem::take(&mut state.notices);

        for input in batch {
            let line = match Packet::decode(input.payload().as_bytes()) {
                Ok(Packet::Text(line)) => line,
                Ok(other) => {
                    debug!("Ignoring {:?} from {}", other, input.session_id());
                    continue;
                }
                Err(e) => {
                    debug!("Undecodable input from {}: {}", input.session_id(), e);
                    continue;
                }
            };

            if line.starts_with('/') {
                Self::command(&mut state, &mut outbox, &input, &line);
                // Room notices queued by the command go out this tick
                let queued = std::mem::take(&mut state.notices);
                outbox.extend(queued);
                continue;
            }

            let Some(user) = state.users.get(&input.session_id()) else {
                continue;
            };
            let message = Packet::Chat {
                from: user.name.clone(),
                room: user.room.clone(),
                text: line,
            };
            let Some(group) = state.rooms.get(&user.room).cloned() else {
                continue;
            };
            if let Some(payload) = encode(&message) {
                outbox.send(Recipient::Group(group), payload);
            }
        }

        outbox
    }

    fn disconnect(&self, session: SessionId, reason: &DisconnectReason) {
        let mut state = self.state.lock();
        state.pending.remove(&session);
        let Some(user) = state.users.remove(&session) else {
            return;
        };

        info!("{} ({}) left: {}", user.name, session, reason);
        state.leave(session, &user.room);
        state.notify_room(&user.room, format!("{} left", user.name));
    }
}
