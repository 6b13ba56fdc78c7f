//! Per-peer connection state.
//!
//! [`Peer`] is the cheap public handle the host passes around; [`PeerState`]
//! is the transport-internal bookkeeping guarded by a mutex inside the peer
//! table. The channel state machines here are pure: they take parsed packets
//! and return what to deliver, leaving socket work to the endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::packet::{seq_newer, AckChannel, FragmentInfo};

/// Number of out-of-order reliable packets buffered per peer before newer
/// arrivals are dropped and left to retransmission.
const RECV_WINDOW: u16 = 512;

/// How a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Fire and forget: may be lost, may arrive out of order.
    Unreliable,
    /// Guaranteed and in send order, with transparent fragmentation.
    ReliableOrdered,
    /// Guaranteed arrival of the newest message; stale ones may be dropped.
    ReliableSequenced,
}

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the connection.
    RemoteClose,
    /// No traffic within the configured silence window.
    Timeout,
    /// The host declined the connection request.
    Rejected,
    /// Connect request carried the wrong connection key.
    KeyMismatch,
    /// Connect request carried an incompatible protocol version.
    VersionMismatch,
    /// This side shut the transport down.
    LocalClose,
}

impl DisconnectReason {
    pub const ALL: [DisconnectReason; 6] = [
        DisconnectReason::RemoteClose,
        DisconnectReason::Timeout,
        DisconnectReason::Rejected,
        DisconnectReason::KeyMismatch,
        DisconnectReason::VersionMismatch,
        DisconnectReason::LocalClose,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::RemoteClose => "remote_close",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Rejected => "rejected",
            DisconnectReason::KeyMismatch => "key_mismatch",
            DisconnectReason::VersionMismatch => "version_mismatch",
            DisconnectReason::LocalClose => "local_close",
        }
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|r| *r == self).unwrap_or(0)
    }
}

/// Handle to a live transport connection.
///
/// Owned by the transport; the host only holds copies. Identity is the
/// transport-assigned `id`, which both sides of a connection share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub addr: SocketAddr,
}

/// A reliable packet waiting for its ack.
#[derive(Debug, Clone)]
pub(crate) struct PendingPacket {
    pub datagram: Bytes,
    pub sent_at: Instant,
}

/// An out-of-order reliable-ordered arrival parked until its turn.
#[derive(Debug)]
struct ParkedPacket {
    fragment: Option<FragmentInfo>,
    payload: Bytes,
}

/// In-progress reassembly of one fragmented message.
#[derive(Debug)]
struct Reassembly {
    group: u16,
    next_index: u16,
    total: u16,
    data: BytesMut,
}

#[derive(Debug, Default)]
struct OrderedChannel {
    next_send: u16,
    next_fragment_group: u16,
    pending: HashMap<u16, PendingPacket>,
    expected: u16,
    parked: HashMap<u16, ParkedPacket>,
    reassembly: Option<Reassembly>,
}

#[derive(Debug, Default)]
struct SequencedChannel {
    next_send: u16,
    pending: Option<(u16, PendingPacket)>,
    latest_delivered: Option<u16>,
}

/// Transport-internal per-peer state.
#[derive(Debug)]
pub(crate) struct PeerState {
    pub last_recv: Instant,
    pub last_send: Instant,
    ordered: OrderedChannel,
    sequenced: SequencedChannel,
}

impl PeerState {
    pub fn new(now: Instant) -> Self {
        PeerState {
            last_recv: now,
            last_send: now,
            ordered: OrderedChannel::default(),
            sequenced: SequencedChannel::default(),
        }
    }

    /// Allocate the next reliable-ordered sequence number.
    pub fn next_ordered_seq(&mut self) -> u16 {
        let seq = self.ordered.next_send;
        self.ordered.next_send = seq.wrapping_add(1);
        seq
    }

    /// Allocate a fragment group id for one oversized message.
    pub fn next_fragment_group(&mut self) -> u16 {
        let group = self.ordered.next_fragment_group;
        self.ordered.next_fragment_group = group.wrapping_add(1);
        group
    }

    /// Allocate the next reliable-sequenced sequence number.
    pub fn next_sequenced_seq(&mut self) -> u16 {
        let seq = self.sequenced.next_send;
        self.sequenced.next_send = seq.wrapping_add(1);
        seq
    }

    /// Remember an ordered packet until it is acked.
    pub fn track_ordered(&mut self, seq: u16, datagram: Bytes, now: Instant) {
        self.ordered.pending.insert(
            seq,
            PendingPacket {
                datagram,
                sent_at: now,
            },
        );
    }

    /// Remember a sequenced packet; only the newest matters, so any older
    /// in-flight packet is forgotten rather than retransmitted.
    pub fn track_sequenced(&mut self, seq: u16, datagram: Bytes, now: Instant) {
        self.sequenced.pending = Some((
            seq,
            PendingPacket {
                datagram,
                sent_at: now,
            },
        ));
    }

    pub fn on_ack(&mut self, channel: AckChannel, seq: u16) {
        match channel {
            AckChannel::Ordered => {
                self.ordered.pending.remove(&seq);
            }
            AckChannel::Sequenced => {
                if matches!(self.sequenced.pending, Some((pending, _)) if pending == seq) {
                    self.sequenced.pending = None;
                }
            }
        }
    }

    /// Accept a reliable-ordered arrival. Returns whether to ack and any
    /// completed messages in delivery order. Duplicates and stale packets
    /// are acked without delivery; packets too far ahead of the receive
    /// window are not acked, leaving them to retransmission.
    pub fn on_ordered(
        &mut self,
        seq: u16,
        fragment: Option<FragmentInfo>,
        payload: Bytes,
    ) -> (bool, Vec<Bytes>) {
        let ch = &mut self.ordered;
        if seq != ch.expected {
            if !seq_newer(seq, ch.expected) {
                return (true, Vec::new());
            }
            if seq.wrapping_sub(ch.expected) >= RECV_WINDOW {
                return (false, Vec::new());
            }
            ch.parked.entry(seq).or_insert(ParkedPacket { fragment, payload });
            return (true, Vec::new());
        }

        let mut delivered = Vec::new();
        Self::take_ordered(ch, fragment, payload, &mut delivered);
        while let Some(parked) = ch.parked.remove(&ch.expected) {
            Self::take_ordered(ch, parked.fragment, parked.payload, &mut delivered);
        }
        (true, delivered)
    }

    fn take_ordered(
        ch: &mut OrderedChannel,
        fragment: Option<FragmentInfo>,
        payload: Bytes,
        delivered: &mut Vec<Bytes>,
    ) {
        ch.expected = ch.expected.wrapping_add(1);
        match fragment {
            None => delivered.push(payload),
            Some(info) => {
                let stale = ch
                    .reassembly
                    .as_ref()
                    .is_some_and(|r| r.group != info.group);
                if stale {
                    ch.reassembly = None;
                }
                if ch.reassembly.is_none() {
                    if info.index != 0 {
                        // Head of this group was lost to a window drop;
                        // nothing to attach the tail to.
                        return;
                    }
                    ch.reassembly = Some(Reassembly {
                        group: info.group,
                        next_index: 0,
                        total: info.total,
                        data: BytesMut::new(),
                    });
                }
                let Some(reassembly) = ch.reassembly.as_mut() else {
                    return;
                };
                if info.index != reassembly.next_index || info.total != reassembly.total {
                    ch.reassembly = None;
                    return;
                }
                reassembly.data.extend_from_slice(&payload);
                reassembly.next_index += 1;
                if reassembly.next_index == reassembly.total {
                    if let Some(whole) = ch.reassembly.take() {
                        delivered.push(whole.data.freeze());
                    }
                }
            }
        }
    }

    /// Accept a reliable-sequenced arrival; stale sequences yield nothing.
    pub fn on_sequenced(&mut self, seq: u16, payload: Bytes) -> Option<Bytes> {
        match self.sequenced.latest_delivered {
            Some(latest) if !seq_newer(seq, latest) => None,
            _ => {
                self.sequenced.latest_delivered = Some(seq);
                Some(payload)
            }
        }
    }

    /// Reliable packets due for retransmission at `now`.
    pub fn due_for_resend(
        &mut self,
        now: Instant,
        rto: std::time::Duration,
    ) -> Vec<Bytes> {
        let mut due = Vec::new();
        for pending in self.ordered.pending.values_mut() {
            if now.duration_since(pending.sent_at) >= rto {
                pending.sent_at = now;
                due.push(pending.datagram.clone());
            }
        }
        if let Some((_, pending)) = &mut self.sequenced.pending {
            if now.duration_since(pending.sent_at) >= rto {
                pending.sent_at = now;
                due.push(pending.datagram.clone());
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn state() -> PeerState {
        PeerState::new(Instant::now())
    }

    fn bytes(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    #[test]
    fn ordered_in_order_delivery() {
        let mut st = state();
        assert_eq!(st.on_ordered(0, None, bytes(0)), (true, vec![bytes(0)]));
        assert_eq!(st.on_ordered(1, None, bytes(1)), (true, vec![bytes(1)]));
    }

    #[test]
    fn ordered_reorders_and_dedupes() {
        let mut st = state();
        // Arrives ahead of its turn: parked but acked.
        assert_eq!(st.on_ordered(1, None, bytes(1)), (true, vec![]));
        // Duplicate of the parked packet.
        assert_eq!(st.on_ordered(1, None, bytes(1)), (true, vec![]));
        // The missing head releases both.
        assert_eq!(st.on_ordered(0, None, bytes(0)), (true, vec![bytes(0), bytes(1)]));
        // Stale retransmit after delivery: acked, not redelivered.
        assert_eq!(st.on_ordered(0, None, bytes(0)), (true, vec![]));
    }

    #[test]
    fn ordered_reassembles_fragments() {
        let mut st = state();
        let frag = |index| {
            Some(FragmentInfo {
                group: 0,
                index,
                total: 3,
            })
        };
        assert!(st.on_ordered(0, frag(0), bytes(0xA)).1.is_empty());
        assert!(st.on_ordered(1, frag(1), bytes(0xB)).1.is_empty());
        let (_, delivered) = st.on_ordered(2, frag(2), bytes(0xC));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len(), 12);
        assert_eq!(&delivered[0][..4], &[0xA; 4]);
        assert_eq!(&delivered[0][8..], &[0xC; 4]);
    }

    #[test]
    fn fragments_interleave_with_whole_messages() {
        let mut st = state();
        let frag = |index| {
            Some(FragmentInfo {
                group: 5,
                index,
                total: 2,
            })
        };
        // Tail fragment and a later whole message arrive before the head.
        assert!(st.on_ordered(1, frag(1), bytes(2)).1.is_empty());
        assert!(st.on_ordered(2, None, bytes(3)).1.is_empty());
        let (_, delivered) = st.on_ordered(0, frag(0), bytes(1));
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].len(), 8);
        assert_eq!(delivered[1], bytes(3));
    }

    #[test]
    fn sequenced_keeps_only_newest() {
        let mut st = state();
        assert_eq!(st.on_sequenced(0, bytes(0)), Some(bytes(0)));
        assert_eq!(st.on_sequenced(2, bytes(2)), Some(bytes(2)));
        // Late arrival of an older message is discarded.
        assert_eq!(st.on_sequenced(1, bytes(1)), None);
        // Duplicate of the newest is discarded too.
        assert_eq!(st.on_sequenced(2, bytes(2)), None);
    }

    #[test]
    fn acks_clear_pending() {
        let mut st = state();
        let now = Instant::now();
        st.track_ordered(0, bytes(0), now);
        st.track_ordered(1, bytes(1), now);
        st.track_sequenced(0, bytes(2), now);

        st.on_ack(AckChannel::Ordered, 0);
        st.on_ack(AckChannel::Sequenced, 0);

        let later = now + Duration::from_secs(1);
        let due = st.due_for_resend(later, Duration::from_millis(250));
        assert_eq!(due, vec![bytes(1)]);
    }

    #[test]
    fn sequenced_pending_is_replaced_by_newer() {
        let mut st = state();
        let now = Instant::now();
        st.track_sequenced(0, bytes(0), now);
        st.track_sequenced(1, bytes(1), now);
        // An ack for the replaced packet changes nothing.
        st.on_ack(AckChannel::Sequenced, 0);
        let due = st.due_for_resend(now + Duration::from_secs(1), Duration::from_millis(250));
        assert_eq!(due, vec![bytes(1)]);
    }

    #[test]
    fn resend_respects_rto() {
        let mut st = state();
        let now = Instant::now();
        st.track_ordered(0, bytes(0), now);
        assert!(st
            .due_for_resend(now + Duration::from_millis(10), Duration::from_millis(250))
            .is_empty());
        assert_eq!(
            st.due_for_resend(now + Duration::from_millis(300), Duration::from_millis(250)),
            vec![bytes(0)]
        );
    }

    #[test]
    fn sequence_allocation_wraps() {
        let mut st = state();
        st.ordered.next_send = 0xFFFF;
        assert_eq!(st.next_ordered_seq(), 0xFFFF);
        assert_eq!(st.next_ordered_seq(), 0);
    }
}
