use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::WireError;

/// Host-assigned 128-bit identity of a user.
///
/// Stable for the lifetime of a peer's session. On the wire a player id is
/// written as a little-endian `u32` length prefix (always 16) followed by the
/// 16 raw bytes. The all-zero id is reserved for messages originated by the
/// server itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlayerId([u8; 16]);

impl PlayerId {
    /// The zero id, used as `from_player` on server-originated messages.
    pub const ZERO: PlayerId = PlayerId([0; 16]);

    pub const WIRE_LEN: usize = 4 + 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PlayerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u32_le(16);
        dst.put_slice(&self.0);
    }

    pub fn read(src: &mut Bytes) -> Result<Self, WireError> {
        WireError::check(src, 4)?;
        let len = src.get_u32_le();
        if len != 16 {
            return Err(WireError::BadPlayerIdLength(len));
        }
        WireError::check(src, 16)?;
        let mut bytes = [0u8; 16];
        src.copy_to_slice(&mut bytes);
        Ok(PlayerId(bytes))
    }
}

impl From<Uuid> for PlayerId {
    fn from(uuid: Uuid) -> Self {
        PlayerId(*uuid.as_bytes())
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

impl std::fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlayerId({})", Uuid::from_bytes(self.0))
    }
}
