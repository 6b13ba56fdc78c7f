//! Wire protocol definitions for the voice relay.
//!
//! This crate is shared by the server and by test clients. It contains three
//! layers, from outermost to innermost:
//!
//! - [`codec`]: length-independent typed message framing. Every transport
//!   datagram starts with an 8-byte type hash derived from the message's
//!   canonical name; the codec dispatches inbound messages to subscribers.
//! - [`envelope`]: the three relay envelopes ([`VoiceUp`], [`VoiceDown`],
//!   [`VoiceDirected`]) that carry opaque voice payloads. All envelope
//!   fields are little-endian.
//! - [`payload`]: the inner voice payload formats. Every payload starts with
//!   the big-endian magic `0x8BC7` and a one-byte message kind. The relay
//!   only parses the handful of kinds it must act on; everything else is
//!   forwarded untouched.
//!
//! Note the endianness split: envelope fields are little-endian, everything
//! inside a voice payload is big-endian.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod payload;
pub mod player;

pub use codec::{type_hash, write_message, MessageCodec, WireMessage};
pub use envelope::{VoiceDirected, VoiceDown, VoiceUp};
pub use error::WireError;
pub use player::PlayerId;

/// Relay-assigned 16-bit client handle used inside voice payloads.
pub type ClientId = u16;

/// Sentinel client id meaning "no destination".
pub const CLIENT_NONE: ClientId = 0xFFFF;
