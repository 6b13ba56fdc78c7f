//! Typed message framing over opaque datagrams.
//!
//! Every datagram begins with an 8-byte hash identifying the message type.
//! The hash is FNV-1a over the type's canonical name, so it is stable across
//! builds and platforms; both ends of a connection must register the same set
//! of types for traffic to line up.
//!
//! The receive side is a dispatch table: [`MessageCodec::subscribe`] stores a
//! handler per type, [`MessageCodec::read`] decodes one datagram and invokes
//! the matching handler with the originating peer as context.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::WireError;

/// A message that can be framed by the codec.
///
/// `NAME` is the canonical name the type hash is derived from. Renaming a
/// message breaks wire compatibility, so names are part of the protocol.
pub trait WireMessage: Sized {
    const NAME: &'static str;

    fn write_body(&self, dst: &mut BytesMut);
    fn read_body(src: &mut Bytes) -> Result<Self, WireError>;
}

/// Stable 8-byte type hash: FNV-1a 64 over the canonical name.
pub fn type_hash(name: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Append `msg` to `dst` as a complete datagram: hash prefix plus body.
pub fn write_message<M: WireMessage>(dst: &mut BytesMut, msg: &M) {
    dst.extend_from_slice(&type_hash(M::NAME).to_le_bytes());
    msg.write_body(dst);
}

type Handler<C> = Box<dyn FnMut(C, &mut Bytes) -> Result<(), WireError> + Send>;

/// Receive-side dispatch table keyed by type hash.
///
/// The context type `C` identifies the message's origin (the transport peer
/// in the server). Handlers run synchronously inside the caller's poll cycle.
pub struct MessageCodec<C> {
    names: HashMap<u64, &'static str>,
    handlers: HashMap<u64, Handler<C>>,
}

impl<C> Default for MessageCodec<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MessageCodec<C> {
    pub fn new() -> Self {
        Self {
            names: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register a type so its hash is recognized, without subscribing.
    ///
    /// Inbound messages of a registered but unsubscribed type are discarded
    /// without an error; only genuinely unknown hashes are reported.
    pub fn register<M: WireMessage>(&mut self) {
        self.names.insert(type_hash(M::NAME), M::NAME);
    }

    /// Subscribe a handler for inbound messages of type `M`.
    ///
    /// A later subscription for the same type replaces the earlier one.
    pub fn subscribe<M, F>(&mut self, mut handler: F)
    where
        M: WireMessage + 'static,
        F: FnMut(C, M) + Send + 'static,
    {
        self.register::<M>();
        self.handlers.insert(
            type_hash(M::NAME),
            Box::new(move |ctx, src| {
                let msg = M::read_body(src)?;
                handler(ctx, msg);
                Ok(())
            }),
        );
    }

    /// Decode one datagram and dispatch it to the subscribed handler.
    ///
    /// Returns [`WireError::ShortPrefix`] for datagrams smaller than the hash
    /// prefix and [`WireError::UnknownTypeHash`] for unregistered hashes.
    /// Decode failures inside a handler's message type are returned as-is;
    /// none of these outcomes affect codec state.
    pub fn read(&mut self, mut datagram: Bytes, ctx: C) -> Result<(), WireError> {
        if datagram.len() < 8 {
            return Err(WireError::ShortPrefix {
                actual: datagram.len(),
            });
        }
        let hash = datagram.get_u64_le();
        match self.handlers.get_mut(&hash) {
            Some(handler) => handler(ctx, &mut datagram),
            None if self.names.contains_key(&hash) => Ok(()),
            None => Err(WireError::UnknownTypeHash(hash)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    struct Echo(u32);

    impl WireMessage for Echo {
        const NAME: &'static str = "test.echo";

        fn write_body(&self, dst: &mut BytesMut) {
            dst.put_u32_le(self.0);
        }

        fn read_body(src: &mut Bytes) -> Result<Self, WireError> {
            WireError::check(src, 4)?;
            Ok(Echo(src.get_u32_le()))
        }
    }

    #[test]
    fn hash_is_stable() {
        // FNV-1a 64 reference value for an empty input is the offset basis.
        assert_eq!(type_hash(""), 0xcbf29ce484222325);
        assert_eq!(type_hash("test.echo"), type_hash("test.echo"));
        assert_ne!(type_hash("test.echo"), type_hash("test.Echo"));
    }

    #[test]
    fn dispatches_to_subscriber() {
        let mut codec = MessageCodec::<u8>::new();
        let (tx, rx) = std::sync::mpsc::channel();
        codec.subscribe::<Echo, _>(move |ctx, msg| {
            tx.send((ctx, msg.0)).unwrap();
        });

        let mut buf = BytesMut::new();
        write_message(&mut buf, &Echo(7));
        codec.read(buf.freeze(), 42).unwrap();

        assert_eq!(rx.try_recv().unwrap(), (42, 7));
    }

    #[test]
    fn unknown_hash_is_an_error() {
        let mut codec = MessageCodec::<u8>::new();
        let mut buf = BytesMut::new();
        write_message(&mut buf, &Echo(1));
        assert!(matches!(
            codec.read(buf.freeze(), 0),
            Err(WireError::UnknownTypeHash(_))
        ));
    }

    #[test]
    fn registered_without_subscriber_is_ignored() {
        let mut codec = MessageCodec::<u8>::new();
        codec.register::<Echo>();
        let mut buf = BytesMut::new();
        write_message(&mut buf, &Echo(1));
        assert!(codec.read(buf.freeze(), 0).is_ok());
    }

    #[test]
    fn short_datagram_is_reported() {
        let mut codec = MessageCodec::<u8>::new();
        assert!(matches!(
            codec.read(Bytes::from_static(&[1, 2, 3]), 0),
            Err(WireError::ShortPrefix { actual: 3 })
        ));
    }
}
