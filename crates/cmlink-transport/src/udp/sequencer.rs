//! Reliable sequencing over UDP.
//!
//! [`Sequencer`] is the socket-free core of the UDP carrier. It tracks both
//! directions of the sequence space, decides what must be (re)transmitted, and
//! reassembles fragmented messages. Every method takes the current time
//! explicitly, so the worker drives it from the wall clock and tests drive it
//! from a synthetic one.
//!
//! Sequence bookkeeping:
//! - `out_seq`: next number to assign to an outbound sequenced packet
//! - `out_seq_sent`: highest number transmitted at least once
//! - `out_seq_acked`: highest number the server has acknowledged
//! - `in_seq`: highest contiguous number received
//! - `in_seq_acked`: the `in_seq` value last echoed to the server
//! - `in_seq_handled`: highest number delivered upward (or consumed by the handshake)

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use super::packet::{ChallengeData, ConnectData, MAX_PAYLOAD, PacketType, UdpPacket};
use crate::error::PacketError;

/// Tuning for the UDP carrier
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Wait before resending unacknowledged packets
    pub resend_delay: Duration,
    /// Packets re-sent per resend round
    pub resend_count: usize,
    /// Maximum unacknowledged packets in flight
    pub ahead_count: u32,
    /// Silence after which the connection is considered dead
    pub timeout: Duration,
    /// Socket wait per worker iteration
    pub poll_interval: Duration,
    /// Socket wait while draining a burst of datagrams
    pub drain_interval: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            resend_delay: Duration::from_secs(3),
            resend_count: 3,
            ahead_count: 5,
            timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(150),
            drain_interval: Duration::from_millis(10),
        }
    }
}

/// UDP session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    /// No session
    Disconnected,
    /// Waiting for the server challenge
    ChallengeReqSent,
    /// Waiting for the server to accept
    ConnectSent,
    /// Session established
    Connected,
    /// Draining the outbound queue before closing
    Disconnecting,
}

/// Outcome of feeding one inbound packet to the sequencer
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// The packet completed the handshake
    pub connected: bool,
    /// Messages completed by this packet, in order
    pub messages: Vec<Vec<u8>>,
    /// The server ended the session
    pub remote_disconnected: bool,
}

/// Sequencing and reassembly state for one UDP session
#[derive(Debug)]
pub struct Sequencer {
    config: UdpConfig,
    state: UdpState,
    local_conn_id: u32,
    remote_conn_id: u32,

    out_seq: u32,
    out_seq_sent: u32,
    out_seq_acked: u32,
    in_seq: u32,
    in_seq_acked: u32,
    in_seq_handled: u32,

    out_packets: VecDeque<UdpPacket>,
    in_packets: BTreeMap<u32, UdpPacket>,
    ack_requested: bool,

    next_resend: Instant,
    timeout_at: Instant,
}

impl Sequencer {
    /// Create a sequencer for a session using `local_conn_id`
    #[must_use]
    pub fn new(local_conn_id: u32, config: UdpConfig, now: Instant) -> Self {
        Self {
            next_resend: now + config.resend_delay,
            timeout_at: now + config.timeout,
            config,
            state: UdpState::Disconnected,
            local_conn_id,
            remote_conn_id: 0,
            out_seq: 1,
            out_seq_sent: 0,
            out_seq_acked: 0,
            in_seq: 0,
            in_seq_acked: 0,
            in_seq_handled: 0,
            out_packets: VecDeque::new(),
            in_packets: BTreeMap::new(),
            ack_requested: false,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> UdpState {
        self.state
    }

    /// Connection ID the server assigned, 0 before `Accept`
    #[must_use]
    pub fn remote_conn_id(&self) -> u32 {
        self.remote_conn_id
    }

    /// Sequenced packets not yet acknowledged
    #[must_use]
    pub fn unacknowledged(&self) -> usize {
        self.out_packets.len()
    }

    /// Out-of-order fragments held for reassembly
    #[must_use]
    pub fn buffered_fragments(&self) -> usize {
        self.in_packets.len()
    }

    /// Start the handshake; returns the `ChallengeReq` to transmit
    pub fn begin(&mut self, now: Instant) -> UdpPacket {
        self.state = UdpState::ChallengeReqSent;
        self.timeout_at = now + self.config.timeout;
        self.next_resend = now + self.config.resend_delay;
        self.transmit(UdpPacket::new(PacketType::ChallengeReq), now)
    }

    /// Split a message into sequenced `Data` fragments and queue them
    ///
    /// Returns the number of fragments. An empty message still occupies one.
    ///
    /// # Errors
    ///
    /// Returns an error if the message size does not fit the header fields.
    pub fn queue_message(&mut self, data: &[u8]) -> Result<u32, PacketError> {
        let msg_size =
            u32::try_from(data.len()).map_err(|_| PacketError::PayloadTooLarge(data.len()))?;

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(MAX_PAYLOAD).collect()
        };
        let count = chunks.len() as u32;
        let msg_start = self.out_seq;

        for chunk in chunks {
            let mut packet = UdpPacket::with_payload(PacketType::Data, chunk.to_vec())?;
            packet.header.msg_size = msg_size;
            self.enqueue(packet, msg_start, count);
        }

        Ok(count)
    }

    /// Queue a sequenced `Disconnect` and start draining
    ///
    /// Returns `false` if the session was not established, in which case
    /// there is nothing to drain.
    pub fn begin_disconnect(&mut self) -> bool {
        if self.state != UdpState::Connected {
            return false;
        }
        self.state = UdpState::Disconnecting;
        let seq = self.out_seq;
        self.enqueue(UdpPacket::new(PacketType::Disconnect), seq, 1);
        true
    }

    /// Whether a graceful disconnect has flushed everything
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.state == UdpState::Disconnecting && self.out_packets.is_empty()
    }

    /// Whether the server has been silent for longer than the timeout
    #[must_use]
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now > self.timeout_at
    }

    /// Process one inbound packet
    pub fn receive(&mut self, packet: UdpPacket, now: Instant) -> Received {
        let mut received = Received::default();
        let header = packet.header.clone();

        if self.remote_conn_id > 0 && header.source_conn_id != self.remote_conn_id {
            debug!(
                "ignoring packet from connection {} (expected {})",
                header.source_conn_id, self.remote_conn_id
            );
            return received;
        }

        self.timeout_at = now + self.config.timeout;

        debug!(
            "udp recv <- {:?} seq {} ack {}; {} bytes; message {} bytes in {} packets",
            header.packet_type,
            header.seq_this,
            header.seq_ack,
            packet.payload().len(),
            header.msg_size,
            header.packets_in_msg
        );

        if header.packet_type == PacketType::Data && header.seq_this <= self.in_seq {
            self.ack_requested = true;
            return received;
        }

        if header.seq_ack >= self.out_seq {
            debug!(
                "ignoring ack {} for unsent packet (next {})",
                header.seq_ack, self.out_seq
            );
        } else if header.seq_ack > self.out_seq_acked {
            self.out_seq_acked = header.seq_ack;
            self.out_seq_sent = self.out_seq_sent.max(self.out_seq_acked);
            let acked = self.out_seq_acked;
            self.out_packets.retain(|p| p.header.seq_this > acked);
            self.next_resend = now + self.config.resend_delay;
        }

        if header.seq_this > 0 && header.seq_this == self.in_seq.wrapping_add(1) {
            self.in_seq = header.seq_this;
            while let Some(next) = self
                .in_seq
                .checked_add(1)
                .filter(|next| self.in_packets.contains_key(next))
            {
                self.in_seq = next;
            }
        }

        match header.packet_type {
            PacketType::Challenge => self.receive_challenge(&packet),
            PacketType::Accept => {
                if self.state == UdpState::ConnectSent {
                    debug!("udp connection accepted by {}", header.source_conn_id);
                    self.state = UdpState::Connected;
                    self.remote_conn_id = header.source_conn_id;
                    self.in_seq_handled = header.seq_this;
                    received.connected = true;
                }
            }
            PacketType::Data => {
                if matches!(self.state, UdpState::Connected | UdpState::Disconnecting) {
                    self.receive_data(packet);
                    while let Some(message) = self.dispatch() {
                        received.messages.push(message);
                    }
                }
            }
            PacketType::Disconnect => {
                debug!("udp disconnect from server");
                self.state = UdpState::Disconnected;
                received.remote_disconnected = true;
            }
            PacketType::Datagram => {}
            other => debug!("unexpected udp packet {:?}", other),
        }

        received
    }

    /// Packets to put on the wire now: new or resent sequenced packets, plus
    /// a bare acknowledgement when nothing else carries one.
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<UdpPacket> {
        let mut out = Vec::new();

        if self.state != UdpState::Disconnected {
            if now > self.next_resend && self.out_seq_sent > self.out_seq_acked {
                // Give up on the queue rather than stall a disconnect on resends
                if self.state == UdpState::Disconnecting {
                    self.out_packets.clear();
                }

                debug!("sequenced packet resend required");
                let resend: Vec<UdpPacket> = self
                    .out_packets
                    .iter()
                    .take(self.config.resend_count)
                    .cloned()
                    .collect();
                for packet in resend {
                    out.push(self.transmit(packet, now));
                }
                self.next_resend = now + self.config.resend_delay;
            } else if self.out_seq_sent
                < self.out_seq_acked.saturating_add(self.config.ahead_count)
            {
                let start = self.out_seq_sent.saturating_sub(self.out_seq_acked) as usize;
                let end = (self.config.ahead_count as usize).min(self.out_packets.len());
                for i in start..end {
                    let packet = self.out_packets[i].clone();
                    out.push(self.transmit(packet, now));
                }
            }
        }

        if self.in_seq != self.in_seq_acked || self.ack_requested {
            out.push(self.transmit(UdpPacket::new(PacketType::Datagram), now));
        }

        out
    }

    fn receive_challenge(&mut self, packet: &UdpPacket) {
        if self.state != UdpState::ChallengeReqSent {
            return;
        }

        let challenge = match ChallengeData::decode(packet.payload()) {
            Ok(challenge) => challenge,
            Err(e) => {
                debug!("malformed challenge: {}", e);
                return;
            }
        };

        let answer = ConnectData::answer(&challenge);
        let connect = match UdpPacket::with_payload(PacketType::Connect, answer.encode()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("cannot build connect packet: {}", e);
                return;
            }
        };

        self.state = UdpState::ConnectSent;
        let seq = self.out_seq;
        self.enqueue(connect, seq, 1);
        self.in_seq_handled = packet.header.seq_this;
    }

    fn receive_data(&mut self, packet: UdpPacket) {
        let seq = packet.header.seq_this;
        if seq <= self.in_seq_handled || self.in_packets.contains_key(&seq) {
            return;
        }
        self.in_packets.insert(seq, packet);
    }

    /// Number of fragments in the next message, if all of them are present
    fn ready_parts(&self) -> Option<u32> {
        let start = self.in_seq_handled.checked_add(1)?;
        let first = self.in_packets.get(&start)?;
        let parts = first.header.packets_in_msg.max(1);
        (1..parts)
            .all(|i| {
                start
                    .checked_add(i)
                    .is_some_and(|seq| self.in_packets.contains_key(&seq))
            })
            .then_some(parts)
    }

    fn dispatch(&mut self) -> Option<Vec<u8>> {
        let parts = self.ready_parts()?;
        let mut message = Vec::new();
        for _ in 0..parts {
            self.in_seq_handled += 1;
            if let Some(fragment) = self.in_packets.remove(&self.in_seq_handled) {
                message.extend_from_slice(fragment.payload());
            }
        }
        debug!("dispatching {} byte message from {} packets", message.len(), parts);
        Some(message)
    }

    fn enqueue(&mut self, mut packet: UdpPacket, msg_start: u32, packets_in_msg: u32) {
        packet.header.seq_this = self.out_seq;
        packet.header.msg_start_seq = msg_start;
        packet.header.packets_in_msg = packets_in_msg;
        self.out_packets.push_back(packet);
        self.out_seq += 1;
    }

    /// Stamp connection IDs and the current ack onto a packet about to be sent
    fn transmit(&mut self, mut packet: UdpPacket, now: Instant) -> UdpPacket {
        packet.header.source_conn_id = self.local_conn_id;
        packet.header.dest_conn_id = self.remote_conn_id;
        packet.header.seq_ack = self.in_seq;
        self.in_seq_acked = self.in_seq;
        self.ack_requested = false;

        // An idle, fully acked queue must not trip the resend check on its next packet
        if self.out_seq_sent == self.out_seq_acked {
            self.next_resend = now + self.config.resend_delay;
        }
        if packet.header.seq_this > 0 {
            self.out_seq_sent = self.out_seq_sent.max(packet.header.seq_this);
        }

        debug!(
            "udp send -> {:?} seq {} ack {}; {} bytes; message {} bytes in {} packets",
            packet.header.packet_type,
            packet.header.seq_this,
            packet.header.seq_ack,
            packet.payload().len(),
            packet.header.msg_size,
            packet.header.packets_in_msg
        );
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::packet::CHALLENGE_MASK;

    const SERVER_ID: u32 = 0x0000_7777;

    fn server(packet_type: PacketType, seq: u32, ack: u32, payload: Vec<u8>) -> UdpPacket {
        let mut packet = UdpPacket::with_payload(packet_type, payload).unwrap();
        packet.header.source_conn_id = SERVER_ID;
        packet.header.dest_conn_id = 512;
        packet.header.seq_this = seq;
        packet.header.seq_ack = ack;
        packet.header.packets_in_msg = 1;
        packet.header.msg_start_seq = seq;
        packet
    }

    fn fragment(seq: u32, start: u32, parts: u32, ack: u32, payload: &[u8]) -> UdpPacket {
        let mut packet = server(PacketType::Data, seq, ack, payload.to_vec());
        packet.header.msg_start_seq = start;
        packet.header.packets_in_msg = parts;
        packet
    }

    /// Sequencer past the handshake; the server has used seq 1 (challenge) and 2 (accept).
    fn connected(now: Instant) -> Sequencer {
        let mut seq = Sequencer::new(512, UdpConfig::default(), now);
        let req = seq.begin(now);
        assert_eq!(req.packet_type(), PacketType::ChallengeReq);
        assert_eq!(req.header.seq_this, 0);

        let challenge = ChallengeData {
            challenge_value: 0xDEAD_BEEF,
            server_load: 0,
        };
        seq.receive(server(PacketType::Challenge, 1, 0, challenge.encode()), now);
        assert_eq!(seq.state(), UdpState::ConnectSent);

        let out = seq.poll_transmit(now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].packet_type(), PacketType::Connect);
        assert_eq!(out[0].header.seq_this, 1);
        assert_eq!(out[0].header.seq_ack, 1);
        let answer = ConnectData::decode(out[0].payload()).unwrap();
        assert_eq!(answer.challenge_value, 0xDEAD_BEEF ^ CHALLENGE_MASK);

        let received = seq.receive(server(PacketType::Accept, 2, 1, vec![]), now);
        assert!(received.connected);
        assert_eq!(seq.state(), UdpState::Connected);
        assert_eq!(seq.remote_conn_id(), SERVER_ID);
        assert_eq!(seq.unacknowledged(), 0);
        seq
    }

    #[test]
    fn test_handshake_and_ack() {
        let now = Instant::now();
        let mut seq = connected(now);

        let out = seq.poll_transmit(now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].packet_type(), PacketType::Datagram);
        assert_eq!(out[0].header.seq_ack, 2);
        assert_eq!(out[0].header.dest_conn_id, SERVER_ID);

        assert!(seq.poll_transmit(now).is_empty());
    }

    #[test]
    fn test_accept_ignored_before_challenge() {
        let now = Instant::now();
        let mut seq = Sequencer::new(512, UdpConfig::default(), now);
        seq.begin(now);
        let received = seq.receive(server(PacketType::Accept, 1, 0, vec![]), now);
        assert!(!received.connected);
        assert_eq!(seq.state(), UdpState::ChallengeReqSent);
    }

    #[test]
    fn test_fragmentation_counts() {
        let now = Instant::now();
        let mut seq = connected(now);

        assert_eq!(seq.queue_message(&[]).unwrap(), 1);
        assert_eq!(seq.queue_message(&[0; MAX_PAYLOAD]).unwrap(), 1);
        assert_eq!(seq.queue_message(&[0; MAX_PAYLOAD + 1]).unwrap(), 2);
        assert_eq!(seq.unacknowledged(), 4);
    }

    #[test]
    fn test_fragment_headers() {
        let now = Instant::now();
        let mut seq = connected(now);
        seq.poll_transmit(now);

        let message: Vec<u8> = (0..(MAX_PAYLOAD * 2 + 10)).map(|i| i as u8).collect();
        seq.queue_message(&message).unwrap();

        let out = seq.poll_transmit(now);
        assert_eq!(out.len(), 3);
        for (i, packet) in out.iter().enumerate() {
            assert_eq!(packet.header.seq_this, 2 + i as u32);
            assert_eq!(packet.header.msg_start_seq, 2);
            assert_eq!(packet.header.packets_in_msg, 3);
            assert_eq!(packet.header.msg_size, message.len() as u32);
        }
        assert_eq!(out[2].payload().len(), 10);
    }

    #[test]
    fn test_ahead_window() {
        let now = Instant::now();
        let mut seq = connected(now);
        seq.poll_transmit(now);

        for _ in 0..8 {
            seq.queue_message(b"x").unwrap();
        }
        assert_eq!(seq.poll_transmit(now).len(), 5);
        assert!(seq.poll_transmit(now).is_empty());

        // Server acks two of them; two more may go out
        seq.receive(server(PacketType::Datagram, 0, 3, vec![]), now);
        let out = seq.poll_transmit(now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].header.seq_this, 7);
        assert_eq!(seq.unacknowledged(), 6);
    }

    #[test]
    fn test_resend_after_delay() {
        let now = Instant::now();
        let mut seq = connected(now);
        seq.poll_transmit(now);

        for _ in 0..4 {
            seq.queue_message(b"lost").unwrap();
        }
        assert_eq!(seq.poll_transmit(now).len(), 4);
        assert!(seq.poll_transmit(now + Duration::from_secs(1)).is_empty());

        let later = now + Duration::from_secs(4);
        let resent = seq.poll_transmit(later);
        assert_eq!(resent.len(), 3);
        assert_eq!(resent[0].header.seq_this, 2);

        // Next round only after another full delay
        assert!(seq.poll_transmit(later + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_in_order_delivery() {
        let now = Instant::now();
        let mut seq = connected(now);

        let received = seq.receive(server(PacketType::Data, 3, 1, b"one".to_vec()), now);
        assert_eq!(received.messages, vec![b"one".to_vec()]);
        let received = seq.receive(server(PacketType::Data, 4, 1, b"two".to_vec()), now);
        assert_eq!(received.messages, vec![b"two".to_vec()]);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let now = Instant::now();
        let mut seq = connected(now);

        // Message of three fragments (3..=5) followed by a single (6), arriving shuffled
        assert!(seq.receive(fragment(5, 3, 3, 1, b"C"), now).messages.is_empty());
        assert!(seq.receive(fragment(6, 6, 1, 1, b"D"), now).messages.is_empty());
        assert!(seq.receive(fragment(3, 3, 3, 1, b"A"), now).messages.is_empty());
        assert_eq!(seq.buffered_fragments(), 3);

        let received = seq.receive(fragment(4, 3, 3, 1, b"B"), now);
        assert_eq!(received.messages, vec![b"ABC".to_vec(), b"D".to_vec()]);
        assert_eq!(seq.buffered_fragments(), 0);

        let out = seq.poll_transmit(now);
        assert_eq!(out.last().unwrap().header.seq_ack, 6);
    }

    #[test]
    fn test_duplicate_is_reacked_and_dropped() {
        let now = Instant::now();
        let mut seq = connected(now);

        seq.receive(server(PacketType::Data, 3, 1, b"once".to_vec()), now);
        seq.poll_transmit(now);

        let received = seq.receive(server(PacketType::Data, 3, 1, b"once".to_vec()), now);
        assert!(received.messages.is_empty());

        let out = seq.poll_transmit(now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].packet_type(), PacketType::Datagram);
        assert_eq!(out[0].header.seq_ack, 3);
    }

    #[test]
    fn test_foreign_connection_ignored() {
        let now = Instant::now();
        let mut seq = connected(now);

        let mut packet = server(PacketType::Data, 3, 1, b"spoof".to_vec());
        packet.header.source_conn_id = SERVER_ID + 1;
        assert_eq!(seq.receive(packet, now), Received::default());
        assert!(seq.is_timed_out(now + Duration::from_secs(21)));
    }

    #[test]
    fn test_timeout_extended_by_traffic() {
        let now = Instant::now();
        let mut seq = connected(now);
        let later = now + Duration::from_secs(15);
        seq.receive(server(PacketType::Datagram, 0, 1, vec![]), later);
        assert!(!seq.is_timed_out(now + Duration::from_secs(30)));
        assert!(seq.is_timed_out(later + Duration::from_secs(21)));
    }

    #[test]
    fn test_graceful_disconnect_drains() {
        let now = Instant::now();
        let mut seq = connected(now);
        seq.poll_transmit(now);

        seq.queue_message(b"last words").unwrap();
        assert!(seq.begin_disconnect());
        assert_eq!(seq.state(), UdpState::Disconnecting);
        assert!(!seq.is_drained());

        let out = seq.poll_transmit(now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].packet_type(), PacketType::Disconnect);

        seq.receive(server(PacketType::Datagram, 0, out[1].header.seq_this, vec![]), now);
        assert!(seq.is_drained());
    }

    #[test]
    fn test_disconnect_abandons_queue_on_resend() {
        let now = Instant::now();
        let mut seq = connected(now);
        seq.poll_transmit(now);
        assert!(seq.begin_disconnect());
        seq.poll_transmit(now);

        seq.poll_transmit(now + Duration::from_secs(4));
        assert!(seq.is_drained());
    }

    #[test]
    fn test_begin_disconnect_requires_session() {
        let now = Instant::now();
        let mut seq = Sequencer::new(512, UdpConfig::default(), now);
        seq.begin(now);
        assert!(!seq.begin_disconnect());
    }

    #[test]
    fn test_remote_disconnect() {
        let now = Instant::now();
        let mut seq = connected(now);
        let received = seq.receive(server(PacketType::Disconnect, 3, 1, vec![]), now);
        assert!(received.remote_disconnected);
        assert_eq!(seq.state(), UdpState::Disconnected);

        // Only the acknowledgement goes out
        let out = seq.poll_transmit(now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header.seq_ack, 3);
    }

    #[test]
    fn test_ack_beyond_sent_is_ignored() {
        let now = Instant::now();
        let mut seq = connected(now);
        seq.poll_transmit(now);

        seq.queue_message(b"pending").unwrap();
        assert_eq!(seq.poll_transmit(now).len(), 1);

        seq.receive(server(PacketType::Datagram, 0, u32::MAX, vec![]), now);
        assert_eq!(seq.unacknowledged(), 1);

        // The window still moves on genuine acks
        for _ in 0..6 {
            seq.queue_message(b"x").unwrap();
        }
        assert_eq!(seq.poll_transmit(now).len(), 4);
        seq.receive(server(PacketType::Datagram, 0, 2, vec![]), now);
        assert_eq!(seq.unacknowledged(), 6);
        assert_eq!(seq.poll_transmit(now).len(), 1);
    }

    #[test]
    fn test_extreme_sequence_numbers_do_not_overflow() {
        let now = Instant::now();
        let mut seq = Sequencer::new(512, UdpConfig::default(), now);
        seq.begin(now);
        let challenge = ChallengeData {
            challenge_value: 1,
            server_load: 0,
        };
        seq.receive(server(PacketType::Challenge, 1, 0, challenge.encode()), now);
        seq.poll_transmit(now);

        let received = seq.receive(server(PacketType::Accept, u32::MAX, 1, vec![]), now);
        assert!(received.connected);

        let received = seq.receive(server(PacketType::Data, u32::MAX, 1, b"late".to_vec()), now);
        assert!(received.messages.is_empty());
        let received = seq.receive(server(PacketType::Data, 2, 1, b"next".to_vec()), now);
        assert!(received.messages.is_empty());
        assert!(!seq.poll_transmit(now).is_empty());
    }
}
