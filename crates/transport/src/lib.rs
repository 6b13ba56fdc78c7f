//! Event-driven UDP multiplexer with three reliability classes.
//!
//! The transport owns one UDP socket and multiplexes any number of peer
//! connections over it. Messages are sent under one of three classes:
//!
//! - [`Reliability::Unreliable`]: fire and forget.
//! - [`Reliability::ReliableOrdered`]: guaranteed, in send order, with
//!   transparent fragmentation of oversized messages.
//! - [`Reliability::ReliableSequenced`]: guaranteed arrival of the newest
//!   message; anything it overtakes may be dropped.
//!
//! Reliable delivery between one sender and one receiver preserves send
//! order within a class; nothing is guaranteed across classes.
//!
//! # Threading model
//!
//! Socket reads, retransmission and keepalive run on background tasks.
//! Everything the host observes goes through an event queue drained by
//! [`Transport::poll`], which invokes [`TransportListener`] callbacks on the
//! calling thread. A host that polls from a single task can mutate its own
//! state in callbacks without any locking.
//!
//! # Connection lifecycle
//!
//! A dialing endpoint sends a connect request carrying a protocol version
//! and a shared connection key. The listening side validates both, then
//! surfaces the request through `connection_requested`; the host admits or
//! declines it with [`Transport::accept`] / [`Transport::reject`]. Dead
//! peers are detected by keepalive silence and reported with a
//! [`DisconnectReason`].

mod counters;
mod endpoint;
mod error;
mod event;
mod packet;
mod peer;

pub use counters::{CounterSnapshot, TransportCounters};
pub use endpoint::{Transport, TransportConfig};
pub use error::TransportError;
pub use event::{ConnectionRequest, TransportListener};
pub use packet::{MAX_ORDERED_PAYLOAD, MAX_SINGLE_PAYLOAD};
pub use peer::{DisconnectReason, Peer, Reliability};
