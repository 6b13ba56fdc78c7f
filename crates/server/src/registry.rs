//! Session bookkeeping: who is connected, under which identities, listening
//! to which rooms.
//!
//! The registry ties together four identities for every participant:
//! the transport peer, the host-assigned [`PlayerId`], the relay-assigned
//! [`ClientId`] and the client's handshake metadata, plus two inverted
//! room-membership indices. Every mutation goes through the registry's
//! methods so the maps can never drift apart.
//!
//! The registry is owned exclusively by the relay and mutated only from
//! handler context, which the transport guarantees is single-threaded, so
//! plain maps suffice.

use std::collections::{HashMap, HashSet};

use transport::Peer;
use wire::payload::CodecSettings;
use wire::{ClientId, PlayerId, CLIENT_NONE};

/// Display name and codec blob captured verbatim from a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMetadata {
    pub name: String,
    pub codec_settings: CodecSettings,
}

/// All live relay state about connected participants.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: HashMap<u64, Peer>,
    players_by_peer: HashMap<u64, PlayerId>,
    peers_by_player: HashMap<PlayerId, u64>,
    clients_by_player: HashMap<PlayerId, ClientId>,
    players_by_client: HashMap<ClientId, PlayerId>,
    metadata: HashMap<ClientId, ClientMetadata>,
    rooms_by_client: HashMap<ClientId, HashSet<String>>,
    clients_by_room: HashMap<String, HashSet<ClientId>>,
    next_client_id: ClientId,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            next_client_id: 1,
            ..SessionRegistry::default()
        }
    }

    /// Associate a transport peer with a player identity.
    ///
    /// Called by the host after the game-level join. If the player was
    /// already bound to another peer, the old binding is replaced and the
    /// displaced peer is returned so the caller can close it.
    pub fn bind(&mut self, peer: Peer, player: PlayerId) -> Option<Peer> {
        let displaced = self
            .peers_by_player
            .get(&player)
            .filter(|old| **old != peer.id)
            .copied()
            .and_then(|old_id| {
                self.players_by_peer.remove(&old_id);
                self.peers.remove(&old_id)
            });
        self.players_by_peer.insert(peer.id, player);
        self.peers_by_player.insert(player, peer.id);
        self.peers.insert(peer.id, peer);
        displaced
    }

    /// Forget every relation the peer had. Returns the player that was
    /// bound and the client id if one had been allocated, so the caller can
    /// broadcast the removal.
    pub fn unbind(&mut self, peer_id: u64) -> Option<(PlayerId, Option<ClientId>)> {
        self.peers.remove(&peer_id);
        let player = self.players_by_peer.remove(&peer_id)?;
        self.peers_by_player.remove(&player);
        let client_id = self.clients_by_player.remove(&player);
        if let Some(client_id) = client_id {
            self.players_by_client.remove(&client_id);
            self.metadata.remove(&client_id);
            self.clear_rooms(client_id);
        }
        Some((player, client_id))
    }

    /// Allocate a client id for the player, or return the existing one.
    ///
    /// Ids are handed out from 1 upward and never reused while the relay
    /// runs. Returns `None` once the id space is exhausted.
    pub fn assign_client_id(&mut self, player: PlayerId) -> Option<ClientId> {
        if let Some(existing) = self.clients_by_player.get(&player) {
            return Some(*existing);
        }
        if self.next_client_id == CLIENT_NONE {
            return None;
        }
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients_by_player.insert(player, id);
        self.players_by_client.insert(id, player);
        Some(id)
    }

    pub fn set_metadata(&mut self, client_id: ClientId, metadata: ClientMetadata) {
        self.metadata.insert(client_id, metadata);
    }

    /// Every client with complete metadata, in unspecified order.
    pub fn all_metadata(&self) -> impl Iterator<Item = (ClientId, &ClientMetadata)> {
        self.metadata.iter().map(|(id, meta)| (*id, meta))
    }

    pub fn peer_for_player(&self, player: &PlayerId) -> Option<&Peer> {
        self.peers_by_player
            .get(player)
            .and_then(|id| self.peers.get(id))
    }

    pub fn player_for_peer(&self, peer_id: u64) -> Option<PlayerId> {
        self.players_by_peer.get(&peer_id).copied()
    }

    pub fn client_for_player(&self, player: &PlayerId) -> Option<ClientId> {
        self.clients_by_player.get(player).copied()
    }

    pub fn player_for_client(&self, client_id: ClientId) -> Option<PlayerId> {
        self.players_by_client.get(&client_id).copied()
    }

    pub fn client_for_peer(&self, peer_id: u64) -> Option<ClientId> {
        self.player_for_peer(peer_id)
            .and_then(|player| self.client_for_player(&player))
    }

    /// Handles of every bound peer except the given one.
    pub fn peers_except(&self, peer_id: u64) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|peer| peer.id != peer_id)
            .cloned()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Replace the client's room set wholesale.
    pub fn set_rooms(&mut self, client_id: ClientId, rooms: impl IntoIterator<Item = String>) {
        self.clear_rooms(client_id);
        let rooms: HashSet<String> = rooms.into_iter().collect();
        for room in &rooms {
            self.clients_by_room
                .entry(room.clone())
                .or_default()
                .insert(client_id);
        }
        if !rooms.is_empty() {
            self.rooms_by_client.insert(client_id, rooms);
        }
    }

    pub fn join_room(&mut self, client_id: ClientId, room: &str) {
        self.rooms_by_client
            .entry(client_id)
            .or_default()
            .insert(room.to_string());
        self.clients_by_room
            .entry(room.to_string())
            .or_default()
            .insert(client_id);
    }

    pub fn leave_room(&mut self, client_id: ClientId, room: &str) {
        if let Some(rooms) = self.rooms_by_client.get_mut(&client_id) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.rooms_by_client.remove(&client_id);
            }
        }
        if let Some(clients) = self.clients_by_room.get_mut(room) {
            clients.remove(&client_id);
            if clients.is_empty() {
                self.clients_by_room.remove(room);
            }
        }
    }

    pub fn rooms_of(&self, client_id: ClientId) -> impl Iterator<Item = &str> {
        self.rooms_by_client
            .get(&client_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn clients_in<'a>(&'a self, room: &str) -> impl Iterator<Item = ClientId> + 'a {
        self.clients_by_room
            .get(room)
            .into_iter()
            .flatten()
            .copied()
    }

    fn clear_rooms(&mut self, client_id: ClientId) {
        if let Some(rooms) = self.rooms_by_client.remove(&client_id) {
            for room in rooms {
                if let Some(clients) = self.clients_by_room.get_mut(&room) {
                    clients.remove(&client_id);
                    if clients.is_empty() {
                        self.clients_by_room.remove(&room);
                    }
                }
            }
        }
    }

    /// Check that the two room indices mirror each other exactly.
    pub fn room_indices_consistent(&self) -> bool {
        for (client, rooms) in &self.rooms_by_client {
            for room in rooms {
                if !self
                    .clients_by_room
                    .get(room)
                    .is_some_and(|c| c.contains(client))
                {
                    return false;
                }
            }
        }
        for (room, clients) in &self.clients_by_room {
            for client in clients {
                if !self
                    .rooms_by_client
                    .get(client)
                    .is_some_and(|r| r.contains(room))
                {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u64) -> Peer {
        Peer {
            id,
            addr: format!("127.0.0.1:{}", 40_000 + id).parse().unwrap(),
        }
    }

    fn player(tag: u8) -> PlayerId {
        PlayerId::from_bytes([tag; 16])
    }

    #[test]
    fn client_id_allocation_is_monotonic_and_idempotent() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(1), player(1));
        reg.bind(peer(2), player(2));

        let a = reg.assign_client_id(player(1)).unwrap();
        let b = reg.assign_client_id(player(2)).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        // Asking again hands back the same id.
        assert_eq!(reg.assign_client_id(player(1)), Some(1));
    }

    #[test]
    fn ids_are_not_reused_after_unbind() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(1), player(1));
        assert_eq!(reg.assign_client_id(player(1)), Some(1));
        reg.unbind(1);

        reg.bind(peer(2), player(1));
        assert_eq!(reg.assign_client_id(player(1)), Some(2));
    }

    #[test]
    fn unbind_returns_what_existed() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(1), player(1));
        assert_eq!(reg.unbind(1), Some((player(1), None)));

        reg.bind(peer(2), player(2));
        let id = reg.assign_client_id(player(2)).unwrap();
        assert_eq!(reg.unbind(2), Some((player(2), Some(id))));
        assert_eq!(reg.unbind(2), None);
    }

    #[test]
    fn unbind_clears_metadata_and_rooms() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(1), player(1));
        let id = reg.assign_client_id(player(1)).unwrap();
        reg.set_metadata(
            id,
            ClientMetadata {
                name: "a".into(),
                codec_settings: [0; 9],
            },
        );
        reg.join_room(id, "global");

        reg.unbind(1);
        assert_eq!(reg.all_metadata().count(), 0);
        assert_eq!(reg.clients_in("global").count(), 0);
        assert!(reg.room_indices_consistent());
    }

    #[test]
    fn rebind_displaces_previous_peer() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(1), player(1));
        let displaced = reg.bind(peer(2), player(1));
        assert_eq!(displaced.unwrap().id, 1);
        assert_eq!(reg.peer_for_player(&player(1)).unwrap().id, 2);
        assert_eq!(reg.player_for_peer(1), None);
    }

    #[test]
    fn peers_except_skips_the_sender() {
        let mut reg = SessionRegistry::new();
        for i in 1..=3 {
            reg.bind(peer(i), player(i as u8));
        }
        let others = reg.peers_except(2);
        assert_eq!(others.len(), 2);
        assert!(others.iter().all(|p| p.id != 2));
    }

    #[test]
    fn set_rooms_replaces_the_whole_set() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(1), player(1));
        let id = reg.assign_client_id(player(1)).unwrap();

        reg.set_rooms(id, ["a".to_string(), "b".to_string()]);
        assert_eq!(reg.rooms_of(id).count(), 2);

        reg.set_rooms(id, ["c".to_string()]);
        let rooms: Vec<&str> = reg.rooms_of(id).collect();
        assert_eq!(rooms, vec!["c"]);
        assert_eq!(reg.clients_in("a").count(), 0);
        assert!(reg.room_indices_consistent());
    }

    #[test]
    fn join_and_leave_keep_indices_mirrored() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(1), player(1));
        reg.bind(peer(2), player(2));
        let a = reg.assign_client_id(player(1)).unwrap();
        let b = reg.assign_client_id(player(2)).unwrap();

        reg.join_room(a, "global");
        reg.join_room(b, "global");
        reg.join_room(a, "team");
        assert!(reg.room_indices_consistent());
        assert_eq!(reg.clients_in("global").count(), 2);

        reg.leave_room(a, "global");
        assert!(reg.room_indices_consistent());
        assert_eq!(reg.clients_in("global").count(), 1);
        assert_eq!(reg.rooms_of(a).collect::<Vec<_>>(), vec!["team"]);

        // Leaving a room twice is harmless.
        reg.leave_room(a, "global");
        assert!(reg.room_indices_consistent());
    }

    #[test]
    fn lookup_chain_peer_player_client() {
        let mut reg = SessionRegistry::new();
        reg.bind(peer(7), player(9));
        let id = reg.assign_client_id(player(9)).unwrap();

        assert_eq!(reg.client_for_peer(7), Some(id));
        assert_eq!(reg.player_for_client(id), Some(player(9)));
        assert_eq!(reg.peer_for_player(&player(9)).unwrap().id, 7);
        assert_eq!(reg.client_for_peer(8), None);
    }
}
