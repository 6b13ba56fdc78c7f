//! Server wiring and the driver loop.
//!
//! This module connects the pieces: the transport delivers datagrams, the
//! codec dispatches them by type, and the relay state machine reacts and
//! sends envelopes back out through the transport. One driver task owns the
//! polling loop; every handler runs synchronously inside it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use transport::{
    ConnectionRequest, DisconnectReason, Peer, Reliability, Transport, TransportConfig,
    TransportListener,
};
use wire::codec::{write_message, MessageCodec, WireMessage};
use wire::error::WireError;
use wire::{PlayerId, VoiceDirected, VoiceDown, VoiceUp};

use crate::config::RelayConfig;
use crate::metrics::{RelayMetrics, Subsystem, POLL_BUDGET};
use crate::relay::{EnvelopeSink, Relay};

/// How often the driver logs a rolling summary.
const SUMMARY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Game-level join announcement binding a player identity to a connection.
///
/// The game flow that authenticates players is outside the relay; this
/// message is the one piece of it the relay needs, carrying the 128-bit
/// player id the voice envelopes will use from then on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub player_id: PlayerId,
}

impl WireMessage for ClientHello {
    const NAME: &'static str = "client.hello";

    fn write_body(&self, dst: &mut BytesMut) {
        self.player_id.write(dst);
    }

    fn read_body(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(ClientHello {
            player_id: PlayerId::read(src)?,
        })
    }
}

/// Production sink: frames a [`VoiceDown`] and hands it to the transport,
/// mapping the envelope's reliable flag onto the transport class.
pub struct TransportSink {
    transport: Transport,
    metrics: Arc<RelayMetrics>,
}

impl EnvelopeSink for TransportSink {
    fn send(&mut self, peer: &Peer, envelope: VoiceDown) {
        let mut buf = BytesMut::new();
        write_message(&mut buf, &envelope);
        let class = if envelope.reliable {
            Reliability::ReliableOrdered
        } else {
            Reliability::Unreliable
        };
        if let Err(error) = self.transport.send(peer, &buf, class) {
            warn!(peer = peer.id, %error, "failed to send envelope");
            self.metrics.inc_error(Subsystem::Transport);
        }
    }
}

type SharedRelay = Arc<Mutex<Relay<TransportSink>>>;

fn lock_relay(relay: &SharedRelay) -> std::sync::MutexGuard<'_, Relay<TransportSink>> {
    relay.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The assembled voice relay server.
pub struct RelayServer {
    transport: Transport,
    codec: MessageCodec<Peer>,
    relay: SharedRelay,
    metrics: Arc<RelayMetrics>,
    config: RelayConfig,
    session_id: u32,
    shutdown: Arc<AtomicBool>,
}

impl RelayServer {
    /// Bind the transport and wire up the relay. Fails only if the UDP port
    /// cannot be bound.
    pub async fn start(config: RelayConfig) -> Result<RelayServer> {
        let transport = Transport::start(TransportConfig {
            port: config.port,
            connection_key: config.connection_key.clone(),
            keepalive: config.keepalive,
            disconnect_timeout: config.disconnect_timeout,
            ..TransportConfig::default()
        })
        .await?;

        let metrics = Arc::new(RelayMetrics::default());
        let session_id: u32 = rand::random();
        let relay: SharedRelay = Arc::new(Mutex::new(Relay::new(
            session_id,
            metrics.clone(),
            TransportSink {
                transport: transport.clone(),
                metrics: metrics.clone(),
            },
        )));

        // Register the full message set up front so both ends agree on the
        // recognized hashes before any traffic flows.
        let mut codec = MessageCodec::new();
        codec.register::<ClientHello>();
        codec.register::<VoiceUp>();
        codec.register::<VoiceDown>();
        codec.register::<VoiceDirected>();
        {
            let relay = relay.clone();
            codec.subscribe::<ClientHello, _>(move |peer, hello| {
                lock_relay(&relay).register_peer(peer, hello.player_id);
            });
        }
        {
            let relay = relay.clone();
            codec.subscribe::<VoiceUp, _>(move |peer, msg| {
                lock_relay(&relay).handle_voice_up(&peer, msg);
            });
        }
        {
            let relay = relay.clone();
            codec.subscribe::<VoiceDirected, _>(move |peer, msg| {
                lock_relay(&relay).handle_voice_directed(&peer, msg);
            });
        }

        info!(
            port = transport.local_addr()?.port(),
            session_id, "voice relay listening"
        );
        Ok(RelayServer {
            transport,
            codec,
            relay,
            metrics,
            config,
            session_id,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Flag watched by the driver between poll cycles; set it to shut down.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run the polling loop until the shutdown flag is set, then stop the
    /// transport. A handler in flight when the flag goes up completes
    /// normally; only whole poll cycles are skipped.
    pub async fn run(&mut self) -> Result<()> {
        let mut last_summary = Instant::now();
        let mut polls_at_summary = 0u64;
        let mut micros_at_summary = 0u64;

        while !self.shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            let mut listener = RelayListener {
                transport: &self.transport,
                codec: &mut self.codec,
                relay: &self.relay,
                metrics: &self.metrics,
            };
            self.transport.poll(&mut listener);
            let elapsed = started.elapsed();
            self.metrics.record_poll(elapsed);
            if elapsed > POLL_BUDGET {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "poll cycle overran its budget");
            }

            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                let polls = self.metrics.polls.load(Ordering::Relaxed);
                let micros = self.metrics.poll_micros.load(Ordering::Relaxed);
                let window_polls = polls - polls_at_summary;
                let window_micros = micros - micros_at_summary;
                let counters = self.transport.counters();
                info!(
                    polls_per_sec = window_polls / SUMMARY_INTERVAL.as_secs(),
                    avg_poll_us = window_micros.checked_div(window_polls).unwrap_or(0),
                    connected = lock_relay(&self.relay).registry().peer_count(),
                    bytes_in = counters.bytes_in,
                    bytes_out = counters.bytes_out,
                    "relay summary"
                );
                polls_at_summary = polls;
                micros_at_summary = micros;
                last_summary = Instant::now();
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        info!("shutting down");
        self.transport.stop();
        Ok(())
    }
}

/// Transport listener bridging into the codec and relay.
struct RelayListener<'a> {
    transport: &'a Transport,
    codec: &'a mut MessageCodec<Peer>,
    relay: &'a SharedRelay,
    metrics: &'a Arc<RelayMetrics>,
}

impl TransportListener for RelayListener<'_> {
    fn connection_requested(&mut self, request: ConnectionRequest) {
        // Admission is unconditional; trust is established by the game-level
        // join flow before any voice traffic is expected.
        if let Err(error) = self.transport.accept(&request) {
            warn!(addr = %request.addr, %error, "failed to accept connection");
            self.metrics.inc_error(Subsystem::Transport);
        }
    }

    fn peer_connected(&mut self, peer: Peer) {
        info!(peer = peer.id, addr = %peer.addr, "peer connected");
    }

    fn peer_disconnected(&mut self, peer: Peer, reason: DisconnectReason) {
        info!(peer = peer.id, reason = reason.as_str(), "peer disconnected");
        self.metrics.inc_disconnect(reason);
        lock_relay(self.relay).handle_disconnect(&peer);
    }

    fn receive(&mut self, peer: Peer, data: Bytes, _reliability: Reliability) {
        match self.codec.read(data, peer) {
            Ok(()) => {}
            Err(WireError::ShortPrefix { .. }) => {
                self.metrics.short_payloads.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                debug!(%error, "codec rejected datagram");
                self.metrics.inc_error(Subsystem::Codec);
            }
        }
    }

    fn error(&mut self, addr: std::net::SocketAddr, error: &transport::TransportError) {
        debug!(%addr, %error, "transport error");
        self.metrics.inc_error(Subsystem::Transport);
    }
}
