//! Echo server: every input is sent back to every connected session.

use super::{encode, password_matches};
use crate::accumulator::Input;
use crate::game::{Admission, Game, Outbox};
use crate::session::{DisconnectReason, SessionId};
use log::info;
use shared::{Frame, Packet};

pub const DEFAULT_PASSWORD: &str = "banana";

pub struct Echo {
    password: Option<String>,
}

impl Echo {
    /// `None` admits everyone who sends a `Hello`.
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

impl Default for Echo {
    fn default() -> Self {
        Self::new(Some(DEFAULT_PASSWORD.to_string()))
    }
}

impl Game for Echo {
    fn validate(&self, session: SessionId, first: &Frame) -> Admission {
        let reason = match Packet::decode(&first.payload) {
            Ok(Packet::Hello { name, password }) => {
                if password_matches(self.password.as_deref(), password.as_deref()) {
                    info!("{} ({}) connected", name, session);
                    let welcome = encode(&Packet::Welcome {
                        session_id: session,
                    });
                    return match welcome {
                        Some(payload) => Admission::accept().with_response(payload),
                        None => Admission::accept(),
                    };
                }
                "invalid password"
            }
            _ => "expected hello",
        };

        let rejected = encode(&Packet::Rejected {
            reason: reason.to_string(),
        });
        match rejected {
            Some(payload) => Admission::reject().with_response(payload),
            None => Admission::reject(),
        }
    }

    fn update(&self, _tick: u64, batch: Vec<Input>) -> Outbox {
        let mut outbox = Outbox::new();
        for input in batch {
            outbox.broadcast(input.payload().clone());
        }
        outbox
    }

    fn disconnect(&self, session: SessionId, reason: &DisconnectReason) {
        info!("{} disconnected, reason: {}", session, reason);
    }
}
