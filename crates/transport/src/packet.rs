//! Internal datagram framing.
//!
//! One UDP datagram carries exactly one packet. The first byte is the packet
//! type; everything after it is type-specific. All multi-byte fields here are
//! little-endian.
//!
//! Application payloads ride in [`Packet::Unreliable`],
//! [`Packet::ReliableOrdered`] and [`Packet::ReliableSequenced`]; the
//! remaining types are connection management.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;

/// Protocol version carried in every connect request.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram this transport will emit.
pub const MAX_DATAGRAM: usize = 1200;

/// Header bytes of a fragmented reliable-ordered packet:
/// type, flags, sequence, fragment group, fragment index, fragment total.
pub const FRAGMENT_HEADER: usize = 1 + 1 + 2 + 2 + 2 + 2;

/// Payload budget of a single fragment.
pub const FRAGMENT_PAYLOAD: usize = MAX_DATAGRAM - FRAGMENT_HEADER;

/// Largest payload for a packet that must fit one datagram.
pub const MAX_SINGLE_PAYLOAD: usize = MAX_DATAGRAM - 4;

/// Cap on fragments per message, bounding reassembly memory.
pub const MAX_FRAGMENTS: usize = 256;

/// Largest reliable-ordered message after fragmentation.
pub const MAX_ORDERED_PAYLOAD: usize = FRAGMENT_PAYLOAD * MAX_FRAGMENTS;

const TYPE_CONNECT_REQUEST: u8 = 1;
const TYPE_CONNECT_ACCEPT: u8 = 2;
const TYPE_DISCONNECT: u8 = 3;
const TYPE_PING: u8 = 4;
const TYPE_PONG: u8 = 5;
const TYPE_ACK: u8 = 6;
const TYPE_UNRELIABLE: u8 = 7;
const TYPE_RELIABLE_ORDERED: u8 = 8;
const TYPE_RELIABLE_SEQUENCED: u8 = 9;

const FLAG_FRAGMENT: u8 = 0b0000_0001;

/// Ack channel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckChannel {
    Ordered = 0,
    Sequenced = 1,
}

/// Wire-level disconnect reason codes.
pub mod disconnect_code {
    pub const CLOSED: u8 = 0;
    pub const REJECTED: u8 = 1;
    pub const KEY_MISMATCH: u8 = 2;
    pub const VERSION_MISMATCH: u8 = 3;
}

/// Fragment position within a reliable-ordered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub group: u16,
    pub index: u16,
    pub total: u16,
}

/// A parsed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectRequest { version: u8, key: String },
    ConnectAccept { peer_id: u64 },
    Disconnect { code: u8 },
    Ping,
    Pong,
    Ack { channel: AckChannel, seq: u16 },
    Unreliable { payload: Bytes },
    ReliableOrdered {
        seq: u16,
        fragment: Option<FragmentInfo>,
        payload: Bytes,
    },
    ReliableSequenced { seq: u16, payload: Bytes },
}

impl Packet {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        match self {
            Packet::ConnectRequest { version, key } => {
                dst.put_u8(TYPE_CONNECT_REQUEST);
                dst.put_u8(*version);
                dst.put_u16_le(key.len() as u16);
                dst.put_slice(key.as_bytes());
            }
            Packet::ConnectAccept { peer_id } => {
                dst.put_u8(TYPE_CONNECT_ACCEPT);
                dst.put_u64_le(*peer_id);
            }
            Packet::Disconnect { code } => {
                dst.put_u8(TYPE_DISCONNECT);
                dst.put_u8(*code);
            }
            Packet::Ping => dst.put_u8(TYPE_PING),
            Packet::Pong => dst.put_u8(TYPE_PONG),
            Packet::Ack { channel, seq } => {
                dst.put_u8(TYPE_ACK);
                dst.put_u8(*channel as u8);
                dst.put_u16_le(*seq);
            }
            Packet::Unreliable { payload } => {
                dst.put_u8(TYPE_UNRELIABLE);
                dst.put_slice(payload);
            }
            Packet::ReliableOrdered {
                seq,
                fragment,
                payload,
            } => {
                dst.put_u8(TYPE_RELIABLE_ORDERED);
                dst.put_u8(if fragment.is_some() { FLAG_FRAGMENT } else { 0 });
                dst.put_u16_le(*seq);
                if let Some(frag) = fragment {
                    dst.put_u16_le(frag.group);
                    dst.put_u16_le(frag.index);
                    dst.put_u16_le(frag.total);
                }
                dst.put_slice(payload);
            }
            Packet::ReliableSequenced { seq, payload } => {
                dst.put_u8(TYPE_RELIABLE_SEQUENCED);
                dst.put_u16_le(*seq);
                dst.put_slice(payload);
            }
        }
        dst.freeze()
    }

    pub fn parse(mut src: Bytes) -> Result<Packet, TransportError> {
        if src.is_empty() {
            return Err(TransportError::Malformed);
        }
        let packet_type = src.get_u8();
        match packet_type {
            TYPE_CONNECT_REQUEST => {
                if src.remaining() < 3 {
                    return Err(TransportError::Malformed);
                }
                let version = src.get_u8();
                let key_len = src.get_u16_le() as usize;
                if src.remaining() < key_len {
                    return Err(TransportError::Malformed);
                }
                let key = String::from_utf8(src.copy_to_bytes(key_len).to_vec())
                    .map_err(|_| TransportError::Malformed)?;
                Ok(Packet::ConnectRequest { version, key })
            }
            TYPE_CONNECT_ACCEPT => {
                if src.remaining() < 8 {
                    return Err(TransportError::Malformed);
                }
                Ok(Packet::ConnectAccept {
                    peer_id: src.get_u64_le(),
                })
            }
            TYPE_DISCONNECT => {
                if src.remaining() < 1 {
                    return Err(TransportError::Malformed);
                }
                Ok(Packet::Disconnect { code: src.get_u8() })
            }
            TYPE_PING => Ok(Packet::Ping),
            TYPE_PONG => Ok(Packet::Pong),
            TYPE_ACK => {
                if src.remaining() < 3 {
                    return Err(TransportError::Malformed);
                }
                let channel = match src.get_u8() {
                    0 => AckChannel::Ordered,
                    1 => AckChannel::Sequenced,
                    _ => return Err(TransportError::Malformed),
                };
                Ok(Packet::Ack {
                    channel,
                    seq: src.get_u16_le(),
                })
            }
            TYPE_UNRELIABLE => Ok(Packet::Unreliable { payload: src }),
            TYPE_RELIABLE_ORDERED => {
                if src.remaining() < 3 {
                    return Err(TransportError::Malformed);
                }
                let flags = src.get_u8();
                let seq = src.get_u16_le();
                let fragment = if flags & FLAG_FRAGMENT != 0 {
                    if src.remaining() < 6 {
                        return Err(TransportError::Malformed);
                    }
                    let info = FragmentInfo {
                        group: src.get_u16_le(),
                        index: src.get_u16_le(),
                        total: src.get_u16_le(),
                    };
                    if info.total == 0 || info.index >= info.total {
                        return Err(TransportError::Malformed);
                    }
                    Some(info)
                } else {
                    None
                };
                Ok(Packet::ReliableOrdered {
                    seq,
                    fragment,
                    payload: src,
                })
            }
            TYPE_RELIABLE_SEQUENCED => {
                if src.remaining() < 2 {
                    return Err(TransportError::Malformed);
                }
                Ok(Packet::ReliableSequenced {
                    seq: src.get_u16_le(),
                    payload: src,
                })
            }
            _ => Err(TransportError::Malformed),
        }
    }
}

/// True when `a` is strictly newer than `b` in the wrapping u16 space.
///
/// The sequence space is half-open: a distance of up to 0x7FFF counts as
/// newer, anything beyond wraps into the past.
pub fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) {
        assert_eq!(Packet::parse(packet.encode()).unwrap(), packet);
    }

    #[test]
    fn packets_round_trip() {
        round_trip(Packet::ConnectRequest {
            version: PROTOCOL_VERSION,
            key: "swordfish".into(),
        });
        round_trip(Packet::ConnectAccept { peer_id: 77 });
        round_trip(Packet::Disconnect {
            code: disconnect_code::REJECTED,
        });
        round_trip(Packet::Ping);
        round_trip(Packet::Pong);
        round_trip(Packet::Ack {
            channel: AckChannel::Sequenced,
            seq: 0xFFFF,
        });
        round_trip(Packet::Unreliable {
            payload: Bytes::from_static(&[1, 2, 3]),
        });
        round_trip(Packet::ReliableOrdered {
            seq: 9,
            fragment: None,
            payload: Bytes::from_static(b"voice"),
        });
        round_trip(Packet::ReliableOrdered {
            seq: 10,
            fragment: Some(FragmentInfo {
                group: 1,
                index: 0,
                total: 4,
            }),
            payload: Bytes::from_static(b"part"),
        });
        round_trip(Packet::ReliableSequenced {
            seq: 3,
            payload: Bytes::from_static(b"state"),
        });
    }

    #[test]
    fn fields_are_little_endian() {
        let encoded = Packet::Ack {
            channel: AckChannel::Ordered,
            seq: 0x0102,
        }
        .encode();
        assert_eq!(&encoded[..], &[6, 0, 0x02, 0x01]);
    }

    #[test]
    fn rejects_truncated_and_unknown() {
        assert!(Packet::parse(Bytes::new()).is_err());
        assert!(Packet::parse(Bytes::from_static(&[TYPE_ACK, 0])).is_err());
        assert!(Packet::parse(Bytes::from_static(&[0xEE])).is_err());
        // Fragment index out of range.
        let bad = Packet::ReliableOrdered {
            seq: 1,
            fragment: Some(FragmentInfo {
                group: 0,
                index: 5,
                total: 4,
            }),
            payload: Bytes::new(),
        };
        assert!(Packet::parse(bad.encode()).is_err());
    }

    #[test]
    fn seq_comparison_wraps() {
        assert!(seq_newer(1, 0));
        assert!(seq_newer(0, 0xFFFF));
        assert!(seq_newer(0x8000, 1));
        assert!(!seq_newer(0, 1));
        assert!(!seq_newer(0xFFFF, 0));
        assert!(!seq_newer(5, 5));
    }
}
