//! Ready-made applications built on the core
//!
//! - [`Echo`]: password-gated rebroadcast of every input to every session
//! - [`Chat`]: named users in rooms, with join and leave notices
//!
//! Both speak [`shared::Packet`] and double as reference implementations
//! of the [`Game`](crate::Game) contract.

pub mod chat;
pub mod echo;

pub use chat::Chat;
pub use echo::Echo;

use log::error;
use shared::{Encode, Packet, Payload};

/// Serializes a packet, logging instead of failing when it cannot be encoded.
pub(crate) fn encode(packet: &Packet) -> Option<Payload> {
    match packet.to_payload() {
        Ok(payload) => Some(payload),
        Err(e) => {
            error!("Failed to encode {:?}: {}", packet, e);
            None
        }
    }
}

/// Checks the password carried by a `Hello` against the configured one.
pub(crate) fn password_matches(expected: Option<&str>, given: Option<&str>) -> bool {
    match expected {
        Some(expected) => given == Some(expected),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_matches() {
        assert!(password_matches(None, None));
        assert!(password_matches(None, Some("anything")));
        assert!(password_matches(Some("banana"), Some("banana")));
        assert!(!password_matches(Some("banana"), Some("apple")));
        assert!(!password_matches(Some("banana"), None));
    }

    #[test]
    fn test_encode_packet() {
        let payload = encode(&Packet::Notice("hi".to_string())).unwrap();
        assert_eq!(
            Packet::decode(payload.as_bytes()).unwrap(),
            Packet::Notice("hi".to_string())
        );
    }
}
