//! Voice relay server library.
//!
//! Terminates a voice-chat protocol over an unreliable datagram transport:
//! peers connect, announce a player identity, handshake for a relay-local
//! client id, and from then on the server fans their opaque voice payloads
//! out to the right subset of other peers.
//!
//! # Architecture
//!
//! - [`config`]: layered configuration (TOML file, environment, CLI)
//! - [`registry`]: peer / player / client-id / room bookkeeping
//! - [`relay`]: the protocol state machine
//! - [`metrics`]: atomic counters and the poll-duration histogram
//! - [`server`]: wiring, admission, and the driver loop
//!
//! # Concurrency
//!
//! The relay is single-threaded by construction: the transport queues
//! events, the driver drains them in [`server::RelayServer::run`], and every
//! handler completes synchronously before the next event is looked at. The
//! registry and room indices are therefore plain maps; only metric counters
//! are shared with background tasks, as atomics.

pub mod config;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod server;

pub use config::{CliArgs, RelayConfig};
pub use metrics::{RelayMetrics, Subsystem};
pub use registry::{ClientMetadata, SessionRegistry};
pub use relay::{EnvelopeSink, Relay};
pub use server::{ClientHello, RelayServer};
