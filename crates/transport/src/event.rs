//! Events surfaced to the transport host.
//!
//! Background tasks queue [`TransportEvent`]s; `Transport::poll` drains the
//! queue on the caller's thread and invokes the matching
//! [`TransportListener`] callback for each. Handlers therefore run strictly
//! serially, and hosts may keep all their state lock-free.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::TransportError;
use crate::peer::{DisconnectReason, Peer, Reliability};

/// An inbound connection attempt awaiting the host's decision.
///
/// The transport has already checked the protocol version and connection
/// key; pass the request to `Transport::accept` or `Transport::reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub addr: SocketAddr,
}

/// Everything the transport can tell its host.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    ConnectionRequested(ConnectionRequest),
    PeerConnected(Peer),
    PeerDisconnected(Peer, DisconnectReason),
    Receive(Peer, Bytes, Reliability),
    Error(SocketAddr, TransportError),
}

/// Host-side callbacks, invoked from `Transport::poll` only.
pub trait TransportListener {
    fn connection_requested(&mut self, request: ConnectionRequest);

    fn peer_connected(&mut self, peer: Peer);

    fn peer_disconnected(&mut self, peer: Peer, reason: DisconnectReason);

    fn receive(&mut self, peer: Peer, data: Bytes, reliability: Reliability);

    /// A non-fatal transport-level failure tied to a remote endpoint.
    fn error(&mut self, addr: SocketAddr, error: &TransportError) {
        let _ = (addr, error);
    }
}
