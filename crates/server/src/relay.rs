//! The relay state machine.
//!
//! Driven entirely by inbound envelopes and disconnect events; it owns the
//! session registry and emits [`VoiceDown`] envelopes through an
//! [`EnvelopeSink`]. Separating the sink from the state machine keeps the
//! protocol logic testable without sockets.
//!
//! Inbound [`VoiceUp`] payloads are classified by the kind byte behind the
//! payload magic:
//!
//! - handshakes are answered with the current roster,
//! - relay envelopes are decoded and fanned out to their listed destinations,
//! - channel state is mirrored into the registry and rebroadcast,
//! - text is routed by its addressing header,
//! - voice and unknown kinds are fanned out to every other peer,
//! - server-originated kinds arriving inbound are dropped and counted.
//!
//! Room membership is mirrored so the registry always knows who listens
//! where, but voice fan-out still goes to all other peers; receivers filter
//! on their own membership.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use transport::Peer;
use wire::payload::{
    self, ClientState, DeltaChannelState, HandshakeRequest, HandshakeResponse, PayloadKind,
    PeerRecord, ServerRelay, TextData, TextScope,
};
use wire::{PlayerId, VoiceDirected, VoiceDown, VoiceUp};

use crate::metrics::{RelayMetrics, Subsystem};
use crate::registry::{ClientMetadata, SessionRegistry};

/// Where the relay hands finished envelopes.
///
/// The production sink writes through the codec onto the transport; tests
/// substitute a recorder.
pub trait EnvelopeSink {
    fn send(&mut self, peer: &Peer, envelope: VoiceDown);
}

/// Protocol state machine for one relay lifetime.
pub struct Relay<S> {
    session_id: u32,
    registry: SessionRegistry,
    metrics: Arc<RelayMetrics>,
    sink: S,
}

impl<S: EnvelopeSink> Relay<S> {
    pub fn new(session_id: u32, metrics: Arc<RelayMetrics>, sink: S) -> Self {
        Relay {
            session_id,
            registry: SessionRegistry::new(),
            metrics,
            sink,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Bind a connected peer to its player identity.
    ///
    /// Called by the host once the game-level join supplied the identity;
    /// voice traffic from an unbound peer cannot be attributed and is
    /// dropped.
    pub fn register_peer(&mut self, peer: Peer, player: PlayerId) {
        info!(peer = peer.id, %player, "player joined");
        if let Some(displaced) = self.registry.bind(peer, player) {
            warn!(peer = displaced.id, %player, "player rebound, displacing old peer");
        }
        self.metrics.players_joined.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_players_connected(self.registry.peer_count());
    }

    /// Tear down everything the departed peer owned and tell the others.
    pub fn handle_disconnect(&mut self, peer: &Peer) {
        let Some((player, client_id)) = self.registry.unbind(peer.id) else {
            return;
        };
        info!(peer = peer.id, %player, ?client_id, "player left");
        self.metrics.players_left.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_players_connected(self.registry.peer_count());

        let Some(client_id) = client_id else {
            return;
        };
        let notice = payload::encode_remove_client(self.session_id, client_id);
        for other in self.registry.peers_except(peer.id) {
            self.sink.send(
                &other,
                VoiceDown {
                    from_player: PlayerId::ZERO,
                    reliable: true,
                    payload: notice.clone(),
                },
            );
        }
    }

    /// Route one client-to-server voice envelope.
    pub fn handle_voice_up(&mut self, peer: &Peer, msg: VoiceUp) {
        let kind = match payload::kind_byte(&msg.payload) {
            Ok(kind) => kind,
            Err(error) => {
                debug!(peer = peer.id, %error, "unusable voice payload");
                self.metrics.short_payloads.fetch_add(1, Ordering::Relaxed);
                self.metrics.inc_error(Subsystem::Relay);
                return;
            }
        };
        match PayloadKind::from_u8(kind) {
            Some(PayloadKind::HandshakeRequest) => self.on_handshake(peer, msg.payload),
            Some(PayloadKind::ClientState) => self.on_client_state(peer, msg.payload),
            Some(PayloadKind::DeltaChannelState) => self.on_delta_channel_state(peer, msg.payload),
            Some(PayloadKind::TextData) => self.on_text(peer, msg.payload, msg.reliable),
            Some(PayloadKind::ServerRelayReliable) => self.on_server_relay(peer, msg.payload, true),
            Some(PayloadKind::ServerRelayUnreliable) => {
                self.on_server_relay(peer, msg.payload, false)
            }
            Some(
                PayloadKind::HandshakeResponse
                | PayloadKind::ErrorWrongSession
                | PayloadKind::RemoveClient
                | PayloadKind::HandshakePeerToPeer,
            ) => {
                debug!(peer = peer.id, kind, "dropping server-only payload from client");
                self.metrics.server_only_dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Voice data, and any kind this server does not know, goes to
            // everyone else untouched.
            Some(PayloadKind::VoiceData) | None => {
                self.fan_out(peer, msg.payload, msg.reliable);
            }
        }
    }

    /// Route one directed envelope to the peer owning the target player.
    pub fn handle_voice_directed(&mut self, peer: &Peer, msg: VoiceDirected) {
        let kind = match payload::kind_byte(&msg.payload) {
            Ok(kind) => kind,
            Err(_) => {
                self.metrics.short_payloads.fetch_add(1, Ordering::Relaxed);
                self.metrics.inc_error(Subsystem::Relay);
                return;
            }
        };
        if PayloadKind::from_u8(kind).is_some_and(PayloadKind::is_server_only) {
            debug!(peer = peer.id, kind, "dropping server-only directed payload");
            self.metrics.server_only_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(from_player) = self.registry.player_for_peer(peer.id) else {
            self.drop_unbound(peer);
            return;
        };
        // A target that already left is not an error; the sender will learn
        // through the removal broadcast.
        let Some(target) = self.registry.peer_for_player(&msg.target_player).cloned() else {
            return;
        };
        self.sink.send(
            &target,
            VoiceDown {
                from_player,
                reliable: msg.reliable,
                payload: msg.payload,
            },
        );
    }

    fn on_handshake(&mut self, peer: &Peer, raw: Bytes) {
        let request = match HandshakeRequest::decode(raw) {
            Ok(request) => request,
            Err(error) => {
                debug!(peer = peer.id, %error, "bad handshake request");
                self.metrics.inc_error(Subsystem::Relay);
                return;
            }
        };
        let Some(player) = self.registry.player_for_peer(peer.id) else {
            self.drop_unbound(peer);
            return;
        };
        let Some(client_id) = self.registry.assign_client_id(player) else {
            error!(%player, "client id space exhausted, dropping handshake");
            self.metrics.inc_error(Subsystem::Relay);
            return;
        };
        debug!(peer = peer.id, client_id, name = %request.name, "handshake");
        self.registry.set_metadata(
            client_id,
            ClientMetadata {
                name: request.name,
                codec_settings: request.codec_settings,
            },
        );

        let peers: Vec<PeerRecord> = self
            .registry
            .all_metadata()
            .filter(|(id, _)| *id != client_id)
            .map(|(id, meta)| PeerRecord {
                name: meta.name.clone(),
                client_id: id,
                codec_settings: meta.codec_settings,
            })
            .collect();
        let response = HandshakeResponse {
            session_id: self.session_id,
            client_id,
            peers,
        };
        self.reply(peer, response.encode());
    }

    fn on_server_relay(&mut self, peer: &Peer, raw: Bytes, reliable: bool) {
        let relay = match ServerRelay::decode(raw) {
            Ok(relay) => relay,
            Err(error) => {
                debug!(peer = peer.id, %error, "bad relay envelope");
                self.metrics.inc_error(Subsystem::Relay);
                return;
            }
        };
        if relay.session_id != self.session_id {
            self.wrong_session(peer, relay.session_id);
            return;
        }
        // Peer-to-peer handshakes must not be laundered through the server.
        if relay.inner.len() > 2 && relay.inner[2] == PayloadKind::HandshakePeerToPeer as u8 {
            self.metrics.server_only_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(from_player) = self.registry.player_for_peer(peer.id) else {
            self.drop_unbound(peer);
            return;
        };
        for destination in relay.real_destinations() {
            let Some(target_player) = self.registry.player_for_client(destination) else {
                continue;
            };
            let Some(target) = self.registry.peer_for_player(&target_player).cloned() else {
                continue;
            };
            self.sink.send(
                &target,
                VoiceDown {
                    from_player,
                    reliable,
                    payload: relay.inner.clone(),
                },
            );
        }
    }

    fn on_client_state(&mut self, peer: &Peer, raw: Bytes) {
        let state = match ClientState::decode(raw.clone()) {
            Ok(state) => state,
            Err(error) => {
                debug!(peer = peer.id, %error, "bad client state");
                self.metrics.inc_error(Subsystem::Relay);
                return;
            }
        };
        if state.session_id != self.session_id {
            self.wrong_session(peer, state.session_id);
            return;
        }
        // The sender's registered id is authoritative; the id inside the
        // payload is only read by other clients.
        if let Some(client_id) = self.registry.client_for_peer(peer.id) {
            self.registry.set_rooms(client_id, state.rooms);
        }
        self.fan_out(peer, raw, true);
    }

    fn on_delta_channel_state(&mut self, peer: &Peer, raw: Bytes) {
        let delta = match DeltaChannelState::decode(raw.clone()) {
            Ok(delta) => delta,
            Err(error) => {
                debug!(peer = peer.id, %error, "bad channel delta");
                self.metrics.inc_error(Subsystem::Relay);
                return;
            }
        };
        if delta.session_id != self.session_id {
            self.wrong_session(peer, delta.session_id);
            return;
        }
        if let Some(client_id) = self.registry.client_for_peer(peer.id) {
            if delta.joined {
                self.registry.join_room(client_id, &delta.room);
            } else {
                self.registry.leave_room(client_id, &delta.room);
            }
        }
        self.fan_out(peer, raw, true);
    }

    fn on_text(&mut self, peer: &Peer, raw: Bytes, reliable: bool) {
        let text = match TextData::decode(raw.clone()) {
            Ok(text) => text,
            Err(error) => {
                debug!(peer = peer.id, %error, "bad text payload");
                self.metrics.inc_error(Subsystem::Relay);
                return;
            }
        };
        if text.session_id != self.session_id {
            self.wrong_session(peer, text.session_id);
            return;
        }
        match text.scope {
            TextScope::Client => {
                let Some(from_player) = self.registry.player_for_peer(peer.id) else {
                    self.drop_unbound(peer);
                    return;
                };
                let Some(target_player) = self.registry.player_for_client(text.target) else {
                    return;
                };
                let Some(target) = self.registry.peer_for_player(&target_player).cloned() else {
                    return;
                };
                self.sink.send(
                    &target,
                    VoiceDown {
                        from_player,
                        reliable,
                        payload: raw,
                    },
                );
            }
            TextScope::Room => self.fan_out(peer, raw, reliable),
        }
    }

    /// Send the payload to every bound peer except the sender.
    fn fan_out(&mut self, peer: &Peer, raw: Bytes, reliable: bool) {
        let Some(from_player) = self.registry.player_for_peer(peer.id) else {
            self.drop_unbound(peer);
            return;
        };
        for other in self.registry.peers_except(peer.id) {
            self.sink.send(
                &other,
                VoiceDown {
                    from_player,
                    reliable,
                    payload: raw.clone(),
                },
            );
        }
    }

    /// Reliable server-originated reply to one peer.
    fn reply(&mut self, peer: &Peer, raw: Bytes) {
        self.sink.send(
            peer,
            VoiceDown {
                from_player: PlayerId::ZERO,
                reliable: true,
                payload: raw,
            },
        );
    }

    fn wrong_session(&mut self, peer: &Peer, claimed: u32) {
        debug!(
            peer = peer.id,
            claimed,
            expected = self.session_id,
            "session mismatch"
        );
        self.metrics.session_mismatches.fetch_add(1, Ordering::Relaxed);
        let notice = payload::encode_error_wrong_session(self.session_id);
        self.reply(peer, notice);
    }

    fn drop_unbound(&mut self, peer: &Peer) {
        debug!(peer = peer.id, "voice from peer with no player binding");
        self.metrics.inc_error(Subsystem::Relay);
    }
}
