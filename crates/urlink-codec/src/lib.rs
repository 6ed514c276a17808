//! `urlink-codec` – wire formats for both controller channels.
//!
//! Pure encode/decode; nothing in this crate touches a socket.
//!
//! # Modules
//!
//! - [`primary`] – length-prefixed robot-state packets streamed by the
//!   controller's primary port, plus a [`tokio_util::codec::Decoder`] that
//!   frames them out of a growing byte buffer.
//! - [`reverse`] – the type-tagged message stream spoken between the driver
//!   and the program it uploads: telemetry decoding on one side, motion
//!   command encoding on the other.

pub mod primary;
pub mod reverse;

pub use primary::{PrimaryPacket, PrimaryPacketCodec, decode_packet, encode_state_packet};
pub use reverse::{
    Command, ReverseMessage, ReverseMessageCodec, decode_command, decode_message,
    encode_command, encode_message,
};
