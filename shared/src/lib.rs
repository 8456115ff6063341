//! Wire format shared by the server core and its clients.
//!
//! - [`frame`]: length-prefixed framing, with an optional timestamp header
//! - [`packet`]: the `Encode` payload contract, the core's `ErrorPacket`
//!   and the closed `Packet` schema used by the bundled applications

pub mod frame;
pub mod packet;

pub use frame::{
    decode_frame, encode_frame, unix_nanos, write_frame, Frame, FrameError, FrameFormat,
    FrameReader, MAX_PAYLOAD_SIZE,
};
pub use packet::{Encode, EncodeError, ErrorPacket, Packet, Payload};
