//! Inner voice payload formats.
//!
//! Every voice payload starts with the big-endian magic `0x8BC7` followed by
//! a one-byte message kind. The relay parses only the kinds it has to act on
//! (handshakes, relay envelopes, channel state, text routing); voice data and
//! unknown kinds are forwarded without interpretation.
//!
//! All multi-byte integers in this module are big-endian, unlike the
//! little-endian envelope layer around it.
//!
//! Strings use a `u16` length prefix where zero means empty and a non-zero
//! value means `length - 1` UTF-8 bytes follow.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::{ClientId, CLIENT_NONE};

/// Constant marking the start of every voice payload.
pub const MAGIC: u16 = 0x8BC7;

/// Magic (2 bytes) plus kind (1 byte).
pub const HEADER_LEN: usize = 3;

/// Opaque codec negotiation blob carried verbatim through handshakes.
pub type CodecSettings = [u8; 9];

pub const CODEC_SETTINGS_LEN: usize = 9;

/// Message kinds the relay understands.
///
/// Discriminants outside this set are legal on the wire; the relay treats
/// them like voice data and forwards them to all other peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    ClientState = 1,
    VoiceData = 2,
    TextData = 3,
    HandshakeRequest = 4,
    HandshakeResponse = 5,
    ErrorWrongSession = 6,
    ServerRelayReliable = 7,
    ServerRelayUnreliable = 8,
    DeltaChannelState = 9,
    RemoveClient = 10,
    HandshakePeerToPeer = 11,
}

impl PayloadKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::ClientState,
            2 => Self::VoiceData,
            3 => Self::TextData,
            4 => Self::HandshakeRequest,
            5 => Self::HandshakeResponse,
            6 => Self::ErrorWrongSession,
            7 => Self::ServerRelayReliable,
            8 => Self::ServerRelayUnreliable,
            9 => Self::DeltaChannelState,
            10 => Self::RemoveClient,
            11 => Self::HandshakePeerToPeer,
            _ => return None,
        })
    }

    /// Kinds that only the server may originate or that address the server
    /// itself. A directed payload of one of these kinds is never forwarded.
    pub fn is_server_only(self) -> bool {
        !matches!(self, Self::VoiceData)
    }
}

/// Read and validate the three-byte payload header, returning the raw kind.
pub fn kind_byte(payload: &[u8]) -> Result<u8, WireError> {
    if payload.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            expected: HEADER_LEN - payload.len(),
            actual: payload.len(),
        });
    }
    let magic = u16::from_be_bytes([payload[0], payload[1]]);
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    Ok(payload[2])
}

fn begin(dst: &mut BytesMut, kind: PayloadKind) {
    dst.put_u16(MAGIC);
    dst.put_u8(kind as u8);
}

fn expect_header(src: &mut Bytes, kinds: &[PayloadKind]) -> Result<PayloadKind, WireError> {
    WireError::check(src, HEADER_LEN)?;
    let magic = src.get_u16();
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let raw = src.get_u8();
    match PayloadKind::from_u8(raw).filter(|k| kinds.contains(k)) {
        Some(kind) => Ok(kind),
        None => Err(WireError::WrongKind {
            expected: kinds[0] as u8,
            actual: raw,
        }),
    }
}

/// Write a length-prefixed string (zero means empty, else `length - 1` bytes).
pub fn write_string(dst: &mut BytesMut, value: &str) {
    if value.is_empty() {
        dst.put_u16(0);
    } else {
        dst.put_u16(value.len() as u16 + 1);
        dst.put_slice(value.as_bytes());
    }
}

/// Read a length-prefixed string.
pub fn read_string(src: &mut Bytes) -> Result<String, WireError> {
    WireError::check(src, 2)?;
    let prefix = src.get_u16();
    if prefix == 0 {
        return Ok(String::new());
    }
    let len = prefix as usize - 1;
    WireError::check(src, len)?;
    let bytes = src.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn read_codec_settings(src: &mut Bytes) -> Result<CodecSettings, WireError> {
    WireError::check(src, CODEC_SETTINGS_LEN)?;
    let mut settings = [0u8; CODEC_SETTINGS_LEN];
    src.copy_to_slice(&mut settings);
    Ok(settings)
}

/// First payload a client sends: codec parameters and a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub codec_settings: CodecSettings,
    pub name: String,
}

impl HandshakeRequest {
    pub fn decode(mut src: Bytes) -> Result<Self, WireError> {
        expect_header(&mut src, &[PayloadKind::HandshakeRequest])?;
        let codec_settings = read_codec_settings(&mut src)?;
        let name = read_string(&mut src)?;
        Ok(HandshakeRequest {
            codec_settings,
            name,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        begin(&mut dst, PayloadKind::HandshakeRequest);
        dst.put_slice(&self.codec_settings);
        write_string(&mut dst, &self.name);
        dst.freeze()
    }
}

/// One already-connected client as listed in a handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: String,
    pub client_id: ClientId,
    pub codec_settings: CodecSettings,
}

/// Reply to a handshake request.
///
/// Lists every other client with complete metadata so the new client can
/// route directed voice immediately. The room and channel tables trail the
/// peer list and are always empty on this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub session_id: u32,
    pub client_id: ClientId,
    pub peers: Vec<PeerRecord>,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        begin(&mut dst, PayloadKind::HandshakeResponse);
        dst.put_u32(self.session_id);
        dst.put_u16(self.client_id);
        dst.put_u16(self.peers.len() as u16);
        for peer in &self.peers {
            write_string(&mut dst, &peer.name);
            dst.put_u16(peer.client_id);
            dst.put_slice(&peer.codec_settings);
        }
        dst.put_u16(0); // room names
        dst.put_u16(0); // channels
        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self, WireError> {
        expect_header(&mut src, &[PayloadKind::HandshakeResponse])?;
        WireError::check(&src, 8)?;
        let session_id = src.get_u32();
        let client_id = src.get_u16();
        let count = src.get_u16();
        let mut peers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_string(&mut src)?;
            WireError::check(&src, 2)?;
            let client_id = src.get_u16();
            let codec_settings = read_codec_settings(&mut src)?;
            peers.push(PeerRecord {
                name,
                client_id,
                codec_settings,
            });
        }
        Ok(HandshakeResponse {
            session_id,
            client_id,
            peers,
        })
    }
}

/// A payload the sender asks the server to fan out to listed clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRelay {
    pub session_id: u32,
    pub destinations: Vec<ClientId>,
    pub inner: Bytes,
}

impl ServerRelay {
    /// Decode either relay kind; the caller distinguishes reliability by the
    /// kind byte it classified.
    pub fn decode(mut src: Bytes) -> Result<Self, WireError> {
        expect_header(
            &mut src,
            &[
                PayloadKind::ServerRelayReliable,
                PayloadKind::ServerRelayUnreliable,
            ],
        )?;
        WireError::check(&src, 5)?;
        let session_id = src.get_u32();
        let count = src.get_u8() as usize;
        WireError::check(&src, count * 2)?;
        let mut destinations = Vec::with_capacity(count);
        for _ in 0..count {
            destinations.push(src.get_u16());
        }
        WireError::check(&src, 2)?;
        let inner_len = src.get_u16() as usize;
        WireError::check(&src, inner_len)?;
        let inner = src.copy_to_bytes(inner_len);
        Ok(ServerRelay {
            session_id,
            destinations,
            inner,
        })
    }

    pub fn encode(&self, reliable: bool) -> Bytes {
        let kind = if reliable {
            PayloadKind::ServerRelayReliable
        } else {
            PayloadKind::ServerRelayUnreliable
        };
        let mut dst = BytesMut::new();
        begin(&mut dst, kind);
        dst.put_u32(self.session_id);
        dst.put_u8(self.destinations.len() as u8);
        for dest in &self.destinations {
            dst.put_u16(*dest);
        }
        dst.put_u16(self.inner.len() as u16);
        dst.put_slice(&self.inner);
        dst.freeze()
    }

    /// Destinations worth looking up, with the sentinel filtered out.
    pub fn real_destinations(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.destinations.iter().copied().filter(|d| *d != CLIENT_NONE)
    }
}

/// Build the 11-byte wrong-session notice carrying the actual session id twice.
pub fn encode_error_wrong_session(session_id: u32) -> Bytes {
    let mut dst = BytesMut::with_capacity(11);
    begin(&mut dst, PayloadKind::ErrorWrongSession);
    dst.put_u32(session_id);
    dst.put_u32(session_id);
    dst.freeze()
}

/// Build the 11-byte removal notice broadcast when a client leaves.
pub fn encode_remove_client(session_id: u32, client_id: ClientId) -> Bytes {
    let mut dst = BytesMut::with_capacity(11);
    begin(&mut dst, PayloadKind::RemoveClient);
    dst.put_u32(session_id);
    dst.put_u16(client_id);
    dst.put_u16(0); // reason, always zero
    dst.freeze()
}

/// Full per-client state announcement: identity plus the complete set of
/// rooms the client listens to. Replaces any previously known room set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub session_id: u32,
    pub name: String,
    pub client_id: ClientId,
    pub codec_settings: CodecSettings,
    pub rooms: Vec<String>,
}

impl ClientState {
    pub fn decode(mut src: Bytes) -> Result<Self, WireError> {
        expect_header(&mut src, &[PayloadKind::ClientState])?;
        WireError::check(&src, 4)?;
        let session_id = src.get_u32();
        let name = read_string(&mut src)?;
        WireError::check(&src, 2)?;
        let client_id = src.get_u16();
        let codec_settings = read_codec_settings(&mut src)?;
        WireError::check(&src, 2)?;
        let count = src.get_u16();
        let mut rooms = Vec::with_capacity(count as usize);
        for _ in 0..count {
            rooms.push(read_string(&mut src)?);
        }
        Ok(ClientState {
            session_id,
            name,
            client_id,
            codec_settings,
            rooms,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        begin(&mut dst, PayloadKind::ClientState);
        dst.put_u32(self.session_id);
        write_string(&mut dst, &self.name);
        dst.put_u16(self.client_id);
        dst.put_slice(&self.codec_settings);
        dst.put_u16(self.rooms.len() as u16);
        for room in &self.rooms {
            write_string(&mut dst, room);
        }
        dst.freeze()
    }
}

/// Incremental room membership change: one client joins or leaves one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaChannelState {
    pub session_id: u32,
    pub joined: bool,
    pub client_id: ClientId,
    pub room: String,
}

impl DeltaChannelState {
    pub fn decode(mut src: Bytes) -> Result<Self, WireError> {
        expect_header(&mut src, &[PayloadKind::DeltaChannelState])?;
        WireError::check(&src, 7)?;
        let session_id = src.get_u32();
        let joined = src.get_u8() & 1 != 0;
        let client_id = src.get_u16();
        let room = read_string(&mut src)?;
        Ok(DeltaChannelState {
            session_id,
            joined,
            client_id,
            room,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        begin(&mut dst, PayloadKind::DeltaChannelState);
        dst.put_u32(self.session_id);
        dst.put_u8(self.joined as u8);
        dst.put_u16(self.client_id);
        write_string(&mut dst, &self.room);
        dst.freeze()
    }
}

/// Addressing scope of a text payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TextScope {
    /// Deliver to the single client named by `target`.
    Client = 0,
    /// Deliver to every other peer; receivers filter on room membership.
    Room = 1,
}

/// Routed text message. Only the addressing header matters to the relay; the
/// text itself is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextData {
    pub session_id: u32,
    pub scope: TextScope,
    pub target: ClientId,
    pub text: String,
}

impl TextData {
    pub fn decode(mut src: Bytes) -> Result<Self, WireError> {
        expect_header(&mut src, &[PayloadKind::TextData])?;
        WireError::check(&src, 7)?;
        let session_id = src.get_u32();
        let scope = match src.get_u8() {
            0 => TextScope::Client,
            _ => TextScope::Room,
        };
        let target = src.get_u16();
        let text = read_string(&mut src)?;
        Ok(TextData {
            session_id,
            scope,
            target,
            text,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        begin(&mut dst, PayloadKind::TextData);
        dst.put_u32(self.session_id);
        dst.put_u8(self.scope as u8);
        dst.put_u16(self.target);
        write_string(&mut dst, &self.text);
        dst.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_big_endian_on_the_wire() {
        let payload = encode_error_wrong_session(1);
        assert_eq!(&payload[..2], &[0x8B, 0xC7]);
    }

    #[test]
    fn kind_byte_validates_header() {
        assert_eq!(kind_byte(&[0x8B, 0xC7, 2]).unwrap(), 2);
        assert!(matches!(
            kind_byte(&[0x8B, 0xC7]),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            kind_byte(&[0x12, 0x34, 2]),
            Err(WireError::BadMagic(0x1234))
        ));
    }

    #[test]
    fn server_only_excludes_voice_data() {
        assert!(!PayloadKind::VoiceData.is_server_only());
        for kind in [
            PayloadKind::ClientState,
            PayloadKind::TextData,
            PayloadKind::HandshakeRequest,
            PayloadKind::HandshakeResponse,
            PayloadKind::ErrorWrongSession,
            PayloadKind::ServerRelayReliable,
            PayloadKind::ServerRelayUnreliable,
            PayloadKind::DeltaChannelState,
            PayloadKind::RemoveClient,
            PayloadKind::HandshakePeerToPeer,
        ] {
            assert!(kind.is_server_only(), "{kind:?}");
        }
    }

    #[test]
    fn string_prefix_convention() {
        let mut dst = BytesMut::new();
        write_string(&mut dst, "");
        assert_eq!(&dst[..], &[0, 0]);

        let mut dst = BytesMut::new();
        write_string(&mut dst, "A");
        // Non-zero prefix means length - 1 bytes follow.
        assert_eq!(&dst[..], &[0, 2, 0x41]);

        assert_eq!(read_string(&mut dst.freeze()).unwrap(), "A");
    }

    #[test]
    fn handshake_request_round_trip() {
        let request = HandshakeRequest {
            codec_settings: [0x11; 9],
            name: "A".to_string(),
        };
        let encoded = request.encode();
        assert_eq!(encoded.len(), 3 + 9 + 2 + 1);
        assert_eq!(HandshakeRequest::decode(encoded).unwrap(), request);
    }

    #[test]
    fn handshake_response_layout() {
        let response = HandshakeResponse {
            session_id: 0xA1B2C3D4,
            client_id: 1,
            peers: vec![],
        };
        let encoded = response.encode();
        assert_eq!(
            &encoded[..],
            &[
                0x8B, 0xC7, 5, // header
                0xA1, 0xB2, 0xC3, 0xD4, // session id
                0x00, 0x01, // assigned client id
                0x00, 0x00, // other clients
                0x00, 0x00, // room names
                0x00, 0x00, // channels
            ]
        );
    }

    #[test]
    fn handshake_response_lists_peers() {
        let response = HandshakeResponse {
            session_id: 7,
            client_id: 3,
            peers: vec![
                PeerRecord {
                    name: "alice".into(),
                    client_id: 1,
                    codec_settings: [1; 9],
                },
                PeerRecord {
                    name: String::new(),
                    client_id: 2,
                    codec_settings: [2; 9],
                },
            ],
        };
        assert_eq!(
            HandshakeResponse::decode(response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn server_relay_round_trip() {
        let relay = ServerRelay {
            session_id: 42,
            destinations: vec![2, CLIENT_NONE, 3],
            inner: Bytes::from_static(&[0x8B, 0xC7, 2, 9, 9]),
        };
        for reliable in [true, false] {
            let decoded = ServerRelay::decode(relay.encode(reliable)).unwrap();
            assert_eq!(decoded, relay);
        }
        assert_eq!(relay.real_destinations().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn server_relay_rejects_truncated_destinations() {
        let mut dst = BytesMut::new();
        dst.put_u16(MAGIC);
        dst.put_u8(PayloadKind::ServerRelayReliable as u8);
        dst.put_u32(1);
        dst.put_u8(4); // four destinations declared, none present
        assert!(matches!(
            ServerRelay::decode(dst.freeze()),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn error_wrong_session_is_eleven_bytes() {
        let payload = encode_error_wrong_session(0xDEADBEEF);
        assert_eq!(payload.len(), 11);
        assert_eq!(payload[2], PayloadKind::ErrorWrongSession as u8);
        assert_eq!(&payload[3..7], &0xDEADBEEFu32.to_be_bytes());
        assert_eq!(&payload[7..11], &0xDEADBEEFu32.to_be_bytes());
    }

    #[test]
    fn remove_client_is_eleven_bytes() {
        let payload = encode_remove_client(0x01020304, 9);
        assert_eq!(
            &payload[..],
            &[0x8B, 0xC7, 10, 1, 2, 3, 4, 0, 9, 0, 0]
        );
    }

    #[test]
    fn client_state_round_trip() {
        let state = ClientState {
            session_id: 5,
            name: "bob".into(),
            client_id: 2,
            codec_settings: [7; 9],
            rooms: vec!["global".into(), "team".into()],
        };
        assert_eq!(ClientState::decode(state.encode()).unwrap(), state);
    }

    #[test]
    fn delta_channel_state_round_trip() {
        for joined in [true, false] {
            let delta = DeltaChannelState {
                session_id: 5,
                joined,
                client_id: 2,
                room: "global".into(),
            };
            assert_eq!(DeltaChannelState::decode(delta.encode()).unwrap(), delta);
        }
    }

    #[test]
    fn text_data_round_trip() {
        let text = TextData {
            session_id: 5,
            scope: TextScope::Client,
            target: 4,
            text: "hello".into(),
        };
        assert_eq!(TextData::decode(text.encode()).unwrap(), text);
    }
}
