use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
///
/// Parse errors never tear down a peer; callers count them and drop the
/// offending datagram.
#[derive(Debug, Error)]
pub enum WireError {
    /// Datagram shorter than the 8-byte type-hash prefix.
    #[error("datagram too short for type hash: {actual} bytes")]
    ShortPrefix { actual: usize },

    /// No message type registered under this hash.
    #[error("unknown message type hash {0:#018x}")]
    UnknownTypeHash(u64),

    /// Buffer ended before the declared field.
    #[error("truncated message: needed {expected} more bytes, had {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Voice payload did not start with the protocol magic.
    #[error("bad voice payload magic {0:#06x}")]
    BadMagic(u16),

    /// Payload kind byte did not match what the parser expected.
    #[error("unexpected payload kind {actual} (expected {expected})")]
    WrongKind { expected: u8, actual: u8 },

    /// Player id length prefix was not 16 bytes.
    #[error("player id length {0} (must be 16)")]
    BadPlayerIdLength(u32),

    /// Length-prefixed string was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl WireError {
    /// Ensure `buf` has at least `need` bytes remaining.
    pub(crate) fn check(buf: &impl bytes::Buf, need: usize) -> Result<(), WireError> {
        let actual = buf.remaining();
        if actual < need {
            Err(WireError::Truncated {
                expected: need - actual,
                actual,
            })
        } else {
            Ok(())
        }
    }
}
