//! The three relay envelopes.
//!
//! Envelopes are what actually crosses the transport: an opaque voice payload
//! plus just enough routing information for the relay. All fields here are
//! little-endian; payloads are `u32` length-prefixed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::WireMessage;
use crate::error::WireError;
use crate::player::PlayerId;

fn write_payload(dst: &mut BytesMut, payload: &Bytes) {
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
}

fn read_payload(src: &mut Bytes) -> Result<Bytes, WireError> {
    WireError::check(src, 4)?;
    let len = src.get_u32_le() as usize;
    WireError::check(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Client to server: an opaque voice payload to be routed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceUp {
    pub reliable: bool,
    pub payload: Bytes,
}

impl WireMessage for VoiceUp {
    const NAME: &'static str = "voice.up";

    fn write_body(&self, dst: &mut BytesMut) {
        dst.put_u8(self.reliable as u8);
        write_payload(dst, &self.payload);
    }

    fn read_body(src: &mut Bytes) -> Result<Self, WireError> {
        WireError::check(src, 1)?;
        let reliable = src.get_u8() != 0;
        let payload = read_payload(src)?;
        Ok(VoiceUp { reliable, payload })
    }
}

/// Server to client: a voice payload attributed to the originating player.
///
/// `from_player` is [`PlayerId::ZERO`] when the server itself is the origin
/// (handshake responses, error and removal notices).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceDown {
    pub from_player: PlayerId,
    pub reliable: bool,
    pub payload: Bytes,
}

impl WireMessage for VoiceDown {
    const NAME: &'static str = "voice.down";

    fn write_body(&self, dst: &mut BytesMut) {
        self.from_player.write(dst);
        dst.put_u8(self.reliable as u8);
        write_payload(dst, &self.payload);
    }

    fn read_body(src: &mut Bytes) -> Result<Self, WireError> {
        let from_player = PlayerId::read(src)?;
        WireError::check(src, 1)?;
        let reliable = src.get_u8() != 0;
        let payload = read_payload(src)?;
        Ok(VoiceDown {
            from_player,
            reliable,
            payload,
        })
    }
}

/// Client to server: a voice payload addressed to exactly one other player.
///
/// Sent by a client acting as host. The relay forwards the payload to the
/// peer owning `target_player` and nobody else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceDirected {
    pub target_player: PlayerId,
    pub reliable: bool,
    pub payload: Bytes,
}

impl WireMessage for VoiceDirected {
    const NAME: &'static str = "voice.directed";

    fn write_body(&self, dst: &mut BytesMut) {
        self.target_player.write(dst);
        dst.put_u8(self.reliable as u8);
        write_payload(dst, &self.payload);
    }

    fn read_body(src: &mut Bytes) -> Result<Self, WireError> {
        let target_player = PlayerId::read(src)?;
        WireError::check(src, 1)?;
        let reliable = src.get_u8() != 0;
        let payload = read_payload(src)?;
        Ok(VoiceDirected {
            target_player,
            reliable,
            payload,
        })
    }
}
