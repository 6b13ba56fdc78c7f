use thiserror::Error;

/// Transport failures.
///
/// Only [`TransportError::BindFailed`] is fatal; everything else is a
/// per-datagram or per-peer condition that leaves the transport running.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind udp port {port}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown peer {0}")]
    UnknownPeer(u64),

    #[error("no pending connection request from {0}")]
    UnknownRequest(std::net::SocketAddr),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("malformed datagram")]
    Malformed,

    #[error("connection rejected by remote peer (code {0})")]
    ConnectRejected(u8),

    #[error("connect attempt timed out")]
    ConnectTimeout,

    #[error("transport is stopped")]
    Stopped,
}
