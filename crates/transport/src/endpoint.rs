//! The transport endpoint: socket tasks, peer table, event queue.
//!
//! Three background tasks run per endpoint: a receive loop that parses
//! datagrams and updates peer state, a tick loop that drives retransmission,
//! keepalive and timeout detection, and a flush loop that drains the
//! outbound queue onto the socket. Nothing here blocks the caller: `send`
//! enqueues, `poll` only drains already-queued events.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::counters::{CounterSnapshot, TransportCounters};
use crate::error::TransportError;
use crate::event::{ConnectionRequest, TransportEvent, TransportListener};
use crate::packet::{
    disconnect_code, AckChannel, FragmentInfo, Packet, FRAGMENT_PAYLOAD, MAX_ORDERED_PAYLOAD,
    MAX_SINGLE_PAYLOAD, PROTOCOL_VERSION,
};
use crate::peer::{DisconnectReason, Peer, PeerState, Reliability};

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// UDP port to bind; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Shared key checked during connection establishment.
    pub connection_key: String,
    /// Ping after this much send silence.
    pub keepalive: Duration,
    /// Declare a peer dead after this much receive silence.
    pub disconnect_timeout: Duration,
    /// Retransmit unacked reliable packets after this long.
    pub resend_delay: Duration,
    /// Cadence of the retransmission and keepalive task.
    pub tick_interval: Duration,
    /// Give up on an outbound connect attempt after this long.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            port: 0,
            connection_key: String::new(),
            keepalive: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(5),
            resend_delay: Duration::from_millis(250),
            tick_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct PeerEntry {
    peer: Peer,
    state: Mutex<PeerState>,
}

#[derive(Debug, Clone, Copy)]
struct PendingConnect {
    started: Instant,
    last_attempt: Instant,
}

struct Inner {
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    counters: Arc<TransportCounters>,
    peers: DashMap<u64, PeerEntry>,
    peer_ids: DashMap<SocketAddr, u64>,
    pending_accepts: DashMap<SocketAddr, Instant>,
    pending_connects: DashMap<SocketAddr, PendingConnect>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    next_peer_id: AtomicU64,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An event-driven UDP multiplexer with three reliability classes.
///
/// Cheap to clone; all clones share one socket and peer table. Callbacks are
/// only ever invoked from [`Transport::poll`], so a host that polls from a
/// single task needs no locking of its own.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Bind the UDP socket and start the background tasks.
    pub async fn start(config: TransportConfig) -> Result<Transport, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(|source| TransportError::BindFailed {
                port: config.port,
                source,
            })?;
        let socket = Arc::new(socket);
        let counters = Arc::new(TransportCounters::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            socket: socket.clone(),
            config,
            counters: counters.clone(),
            peers: DashMap::new(),
            peer_ids: DashMap::new(),
            pending_accepts: DashMap::new(),
            pending_connects: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(events_rx),
            outbound_tx,
            next_peer_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let recv_task = tokio::spawn(recv_loop(inner.clone()));
        let tick_task = tokio::spawn(tick_loop(inner.clone()));
        // The flush task does not hold `Inner`; it drains and exits once
        // every handle to the transport is gone.
        tokio::spawn(flush_loop(socket, outbound_rx, counters));
        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([recv_task, tick_task]);

        Ok(Transport { inner })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Drain queued events, invoking the listener for each. Returns the
    /// number of events handled. Not reentrant: do not call `poll` from
    /// inside a listener callback.
    pub fn poll(&self, listener: &mut dyn TransportListener) -> usize {
        let mut rx = self.inner.events_rx.lock().unwrap_or_else(|e| e.into_inner());
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            handled += 1;
            match event {
                TransportEvent::ConnectionRequested(request) => {
                    listener.connection_requested(request)
                }
                TransportEvent::PeerConnected(peer) => listener.peer_connected(peer),
                TransportEvent::PeerDisconnected(peer, reason) => {
                    listener.peer_disconnected(peer, reason)
                }
                TransportEvent::Receive(peer, data, reliability) => {
                    listener.receive(peer, data, reliability)
                }
                TransportEvent::Error(addr, error) => listener.error(addr, &error),
            }
        }
        handled
    }

    /// Enqueue `data` to `peer` under the given reliability class.
    ///
    /// Never blocks. Socket-level failures are counted and recovered by
    /// retransmission where the class allows; only conditions the caller
    /// can act on (unknown peer, oversized payload) are returned.
    pub fn send(
        &self,
        peer: &Peer,
        data: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Relaxed) {
            return Err(TransportError::Stopped);
        }
        let entry = inner
            .peers
            .get(&peer.id)
            .ok_or(TransportError::UnknownPeer(peer.id))?;
        let addr = entry.peer.addr;
        let now = Instant::now();

        match reliability {
            Reliability::Unreliable => {
                check_len(data.len(), MAX_SINGLE_PAYLOAD)?;
                let datagram = Packet::Unreliable {
                    payload: Bytes::copy_from_slice(data),
                }
                .encode();
                entry.state.lock().unwrap_or_else(|e| e.into_inner()).last_send = now;
                inner.queue_out(addr, datagram);
            }
            Reliability::ReliableSequenced => {
                check_len(data.len(), MAX_SINGLE_PAYLOAD)?;
                let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                let seq = state.next_sequenced_seq();
                let datagram = Packet::ReliableSequenced {
                    seq,
                    payload: Bytes::copy_from_slice(data),
                }
                .encode();
                state.track_sequenced(seq, datagram.clone(), now);
                state.last_send = now;
                drop(state);
                inner.queue_out(addr, datagram);
            }
            Reliability::ReliableOrdered => {
                check_len(data.len(), MAX_ORDERED_PAYLOAD)?;
                let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                let mut datagrams = Vec::new();
                if data.len() <= MAX_SINGLE_PAYLOAD {
                    let seq = state.next_ordered_seq();
                    let datagram = Packet::ReliableOrdered {
                        seq,
                        fragment: None,
                        payload: Bytes::copy_from_slice(data),
                    }
                    .encode();
                    state.track_ordered(seq, datagram.clone(), now);
                    datagrams.push(datagram);
                } else {
                    let chunks: Vec<&[u8]> = data.chunks(FRAGMENT_PAYLOAD).collect();
                    let total = chunks.len() as u16;
                    let group = state.next_fragment_group();
                    for (index, chunk) in chunks.into_iter().enumerate() {
                        let seq = state.next_ordered_seq();
                        let datagram = Packet::ReliableOrdered {
                            seq,
                            fragment: Some(FragmentInfo {
                                group,
                                index: index as u16,
                                total,
                            }),
                            payload: Bytes::copy_from_slice(chunk),
                        }
                        .encode();
                        state.track_ordered(seq, datagram.clone(), now);
                        datagrams.push(datagram);
                    }
                }
                state.last_send = now;
                drop(state);
                for datagram in datagrams {
                    inner.queue_out(addr, datagram);
                }
            }
        }
        Ok(())
    }

    /// Admit a pending inbound connection.
    pub fn accept(&self, request: &ConnectionRequest) -> Result<Peer, TransportError> {
        let inner = &self.inner;
        let was_pending = inner.pending_accepts.remove(&request.addr).is_some();
        if let Some(id) = inner.peer_by_addr(&request.addr) {
            if let Some(peer) = inner.peers.get(&id).map(|e| e.peer.clone()) {
                return Ok(peer);
            }
        }
        if !was_pending {
            return Err(TransportError::UnknownRequest(request.addr));
        }
        let id = inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer = Peer {
            id,
            addr: request.addr,
        };
        inner.insert_peer(peer.clone());
        inner.queue_out(request.addr, Packet::ConnectAccept { peer_id: id }.encode());
        inner.push(TransportEvent::PeerConnected(peer.clone()));
        debug!(peer = id, addr = %request.addr, "accepted connection");
        Ok(peer)
    }

    /// Decline a pending inbound connection.
    pub fn reject(&self, request: &ConnectionRequest) {
        self.inner.pending_accepts.remove(&request.addr);
        self.inner.queue_out(
            request.addr,
            Packet::Disconnect {
                code: disconnect_code::REJECTED,
            }
            .encode(),
        );
        debug!(addr = %request.addr, "rejected connection");
    }

    /// Dial a remote endpoint. Completion is reported through the listener
    /// as `peer_connected`, failure as an `error` callback.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Relaxed) {
            return Err(TransportError::Stopped);
        }
        if inner.peer_ids.contains_key(&addr) {
            return Ok(());
        }
        let now = Instant::now();
        let first = !inner.pending_connects.contains_key(&addr);
        inner.pending_connects.insert(
            addr,
            PendingConnect {
                started: now,
                last_attempt: now,
            },
        );
        if first {
            inner.queue_out(addr, inner.connect_request());
        }
        Ok(())
    }

    /// Close every peer and shut the endpoint down. Queued packets are
    /// flushed on a best-effort basis.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in inner.peers.iter() {
            inner.queue_out(
                entry.peer.addr,
                Packet::Disconnect {
                    code: disconnect_code::CLOSED,
                }
                .encode(),
            );
        }
        inner.peers.clear();
        inner.peer_ids.clear();
        inner.pending_accepts.clear();
        inner.pending_connects.clear();
        for task in inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }

    pub fn connected_peers(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }
}

fn check_len(len: usize, max: usize) -> Result<(), TransportError> {
    if len > max {
        Err(TransportError::PayloadTooLarge { len, max })
    } else {
        Ok(())
    }
}

impl Inner {
    fn push(&self, event: TransportEvent) {
        // Receiver lives as long as Inner, so this cannot fail in practice.
        let _ = self.events_tx.send(event);
    }

    fn queue_out(&self, addr: SocketAddr, datagram: Bytes) {
        if self.outbound_tx.send((addr, datagram)).is_err() {
            self.counters
                .send_errors
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn connect_request(&self) -> Bytes {
        Packet::ConnectRequest {
            version: PROTOCOL_VERSION,
            key: self.config.connection_key.clone(),
        }
        .encode()
    }

    fn insert_peer(&self, peer: Peer) {
        self.peer_ids.insert(peer.addr, peer.id);
        self.peers.insert(
            peer.id,
            PeerEntry {
                peer,
                state: Mutex::new(PeerState::new(Instant::now())),
            },
        );
    }

    fn remove_peer(&self, peer: &Peer) {
        self.peers.remove(&peer.id);
        self.peer_ids.remove(&peer.addr);
    }

    fn peer_by_addr(&self, addr: &SocketAddr) -> Option<u64> {
        self.peer_ids.get(addr).map(|id| *id)
    }

    fn handle_datagram(&self, addr: SocketAddr, datagram: Bytes) {
        let packet = match Packet::parse(datagram) {
            Ok(packet) => packet,
            Err(error) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                self.push(TransportEvent::Error(addr, error));
                return;
            }
        };
        trace!(?packet, %addr, "datagram");
        match packet {
            Packet::ConnectRequest { version, key } => self.on_connect_request(addr, version, &key),
            Packet::ConnectAccept { peer_id } => self.on_connect_accept(addr, peer_id),
            Packet::Disconnect { code } => self.on_remote_disconnect(addr, code),
            Packet::Ping => {
                if let Some(id) = self.peer_by_addr(&addr) {
                    if let Some(entry) = self.peers.get(&id) {
                        entry.state.lock().unwrap_or_else(|e| e.into_inner()).last_recv =
                            Instant::now();
                    }
                    self.queue_out(addr, Packet::Pong.encode());
                }
            }
            Packet::Pong => {
                if let Some(id) = self.peer_by_addr(&addr) {
                    if let Some(entry) = self.peers.get(&id) {
                        entry.state.lock().unwrap_or_else(|e| e.into_inner()).last_recv =
                            Instant::now();
                    }
                }
            }
            Packet::Ack { channel, seq } => {
                if let Some(id) = self.peer_by_addr(&addr) {
                    if let Some(entry) = self.peers.get(&id) {
                        entry
                            .state
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .on_ack(channel, seq);
                    }
                }
            }
            Packet::Unreliable { payload } => {
                if let Some(id) = self.peer_by_addr(&addr) {
                    if let Some(entry) = self.peers.get(&id) {
                        entry.state.lock().unwrap_or_else(|e| e.into_inner()).last_recv =
                            Instant::now();
                        let peer = entry.peer.clone();
                        drop(entry);
                        self.push(TransportEvent::Receive(
                            peer,
                            payload,
                            Reliability::Unreliable,
                        ));
                    }
                }
            }
            Packet::ReliableOrdered {
                seq,
                fragment,
                payload,
            } => {
                let Some(id) = self.peer_by_addr(&addr) else {
                    return;
                };
                let Some(entry) = self.peers.get(&id) else {
                    return;
                };
                let peer = entry.peer.clone();
                let (ack, delivered) = {
                    let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.last_recv = Instant::now();
                    state.on_ordered(seq, fragment, payload)
                };
                drop(entry);
                if ack {
                    self.queue_out(
                        addr,
                        Packet::Ack {
                            channel: AckChannel::Ordered,
                            seq,
                        }
                        .encode(),
                    );
                }
                for message in delivered {
                    self.push(TransportEvent::Receive(
                        peer.clone(),
                        message,
                        Reliability::ReliableOrdered,
                    ));
                }
            }
            Packet::ReliableSequenced { seq, payload } => {
                let Some(id) = self.peer_by_addr(&addr) else {
                    return;
                };
                let Some(entry) = self.peers.get(&id) else {
                    return;
                };
                let peer = entry.peer.clone();
                let delivered = {
                    let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.last_recv = Instant::now();
                    state.on_sequenced(seq, payload)
                };
                drop(entry);
                self.queue_out(
                    addr,
                    Packet::Ack {
                        channel: AckChannel::Sequenced,
                        seq,
                    }
                    .encode(),
                );
                if let Some(message) = delivered {
                    self.push(TransportEvent::Receive(
                        peer,
                        message,
                        Reliability::ReliableSequenced,
                    ));
                }
            }
        }
    }

    fn on_connect_request(&self, addr: SocketAddr, version: u8, key: &str) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        // A duplicate request means our accept was lost; answer it again.
        if let Some(id) = self.peer_by_addr(&addr) {
            self.queue_out(addr, Packet::ConnectAccept { peer_id: id }.encode());
            return;
        }
        if version != PROTOCOL_VERSION {
            debug!(%addr, version, "connect request with unsupported version");
            self.queue_out(
                addr,
                Packet::Disconnect {
                    code: disconnect_code::VERSION_MISMATCH,
                }
                .encode(),
            );
            return;
        }
        if key != self.config.connection_key {
            debug!(%addr, "connect request with wrong connection key");
            self.queue_out(
                addr,
                Packet::Disconnect {
                    code: disconnect_code::KEY_MISMATCH,
                }
                .encode(),
            );
            return;
        }
        if self.pending_accepts.insert(addr, Instant::now()).is_none() {
            self.push(TransportEvent::ConnectionRequested(ConnectionRequest {
                addr,
            }));
        }
    }

    fn on_connect_accept(&self, addr: SocketAddr, peer_id: u64) {
        if self.pending_connects.remove(&addr).is_none() {
            return;
        }
        let peer = Peer { id: peer_id, addr };
        self.insert_peer(peer.clone());
        debug!(peer = peer_id, %addr, "connected");
        self.push(TransportEvent::PeerConnected(peer));
    }

    fn on_remote_disconnect(&self, addr: SocketAddr, code: u8) {
        if let Some(id) = self.peer_by_addr(&addr) {
            if let Some((_, entry)) = self.peers.remove(&id) {
                self.peer_ids.remove(&addr);
                self.push(TransportEvent::PeerDisconnected(
                    entry.peer,
                    DisconnectReason::RemoteClose,
                ));
            }
            return;
        }
        if self.pending_connects.remove(&addr).is_some() {
            self.push(TransportEvent::Error(
                addr,
                TransportError::ConnectRejected(code),
            ));
        }
    }
}

async fn recv_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        match inner.socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                inner.counters.count_in(len);
                inner.handle_datagram(addr, Bytes::copy_from_slice(&buf[..len]));
            }
            Err(error) => {
                if inner.stopped.load(Ordering::Relaxed) {
                    break;
                }
                // ICMP-induced errors surface here on some platforms; the
                // socket itself is still usable.
                warn!(%error, "udp receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn tick_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if inner.stopped.load(Ordering::Relaxed) {
            break;
        }
        let now = Instant::now();

        let mut timed_out = Vec::new();
        for entry in inner.peers.iter() {
            let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
            if now.duration_since(state.last_recv) > inner.config.disconnect_timeout {
                timed_out.push(entry.peer.clone());
                continue;
            }
            for datagram in state.due_for_resend(now, inner.config.resend_delay) {
                inner.counters.retransmits.fetch_add(1, Ordering::Relaxed);
                inner.queue_out(entry.peer.addr, datagram);
            }
            if now.duration_since(state.last_send) > inner.config.keepalive {
                state.last_send = now;
                inner.queue_out(entry.peer.addr, Packet::Ping.encode());
            }
        }
        for peer in timed_out {
            inner.remove_peer(&peer);
            debug!(peer = peer.id, addr = %peer.addr, "peer timed out");
            inner.push(TransportEvent::PeerDisconnected(
                peer,
                DisconnectReason::Timeout,
            ));
        }

        let mut expired = Vec::new();
        for mut pending in inner.pending_connects.iter_mut() {
            if now.duration_since(pending.started) > inner.config.connect_timeout {
                expired.push(*pending.key());
            } else if now.duration_since(pending.last_attempt) >= Duration::from_millis(500) {
                pending.last_attempt = now;
                inner.queue_out(*pending.key(), inner.connect_request());
            }
        }
        for addr in expired {
            inner.pending_connects.remove(&addr);
            inner.push(TransportEvent::Error(addr, TransportError::ConnectTimeout));
        }

        inner
            .pending_accepts
            .retain(|_, requested| now.duration_since(*requested) < Duration::from_secs(10));
    }
}

async fn flush_loop(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    counters: Arc<TransportCounters>,
) {
    while let Some((addr, datagram)) = outbound.recv().await {
        match socket.send_to(&datagram, addr).await {
            Ok(sent) => counters.count_out(sent),
            Err(error) => {
                counters.send_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%addr, %error, "udp send failed");
            }
        }
    }
}
