//! The reliable-transport endpoint
//!
//! An [`Endpoint`] is one side's connection state toward a single peer. It is
//! sans-IO: datagrams go in through [`Endpoint::on_datagram`], datagrams to
//! put on the wire come out of [`Endpoint::poll_transmit`], and everything
//! the next layer must react to comes out of [`Endpoint::poll_event`].
//! Time only advances through [`Endpoint::tick`], which also flushes the
//! send queue.
//!
//! The same type serves both directions of a relay. An accepting endpoint
//! answers the open-connection handshake of a remote client; a connecting
//! endpoint drives that handshake toward a remote server.

use crate::ack::AckPacket;
use crate::bundler::{bundle_packets, max_payload_len, Outgoing};
use crate::codec::BinaryReader;
use crate::error::ProtocolError;
use crate::frame::{Bundle, Entry};
use crate::packets::{
    disconnection_notification, flags, ConnectedId, ConnectedPing, ConnectedPong,
    ConnectionRefusal, ConnectionRequest, ConnectionRequestAccepted, NewIncomingConnection,
    OpenConnectionReplyOne, OpenConnectionReplyTwo, OpenConnectionRequestOne,
    OpenConnectionRequestTwo, Reliability, UnconnectedId,
};
use crate::reassembly::SplitQueue;
use crate::retention::RetentionMap;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

/// Tuning knobs shared by every endpoint of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Queued packets bundled per tick
    pub max_packets_per_tick: usize,
    /// Bundles kept for retransmission before the oldest is evicted
    pub retention_capacity: usize,
    /// Ticks a bundle stays retransmittable without being acknowledged
    pub retention_ttl_ticks: u64,
    /// Ticks an incomplete fragmentation group is kept
    pub reassembly_ttl_ticks: u64,
    /// Ticks between resends of an unanswered handshake stage
    pub handshake_retry_ticks: u64,
    /// Resends before a connecting endpoint gives up
    pub handshake_attempts: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_packets_per_tick: 5,
            retention_capacity: 1024,
            retention_ttl_ticks: 500,
            reassembly_ttl_ticks: 500,
            handshake_retry_ticks: 25,
            handshake_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Answers the handshake of a remote client
    Accepting,
    /// Initiates the handshake toward a remote server
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingReplyOne,
    AwaitingReplyTwo,
    AwaitingAcceptance,
    AwaitingRequestTwo,
    AwaitingConnectionRequest,
    AwaitingNewIncoming,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The handshake completed
    Connected,
    /// An application payload for the next layer
    Payload(Bytes),
    /// The peer sent a disconnection notification
    Disconnected,
    /// The remote server refused or never answered the handshake
    HandshakeFailed,
}

/// Something to send through an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Application packet, bundled on the next tick
    Queued(Outgoing),
    /// Already-framed datagram, put on the wire as-is
    Raw(Bytes),
}

pub struct Endpoint {
    address: SocketAddr,
    local_guid: i64,
    mtu_size: u16,
    protocol: u8,
    role: Role,
    state: ConnectionState,
    config: EndpointConfig,

    sequence_number: u32,
    last_split_id: u16,
    send_queue: VecDeque<Outgoing>,
    held: VecDeque<Outgoing>,
    sent_packets: RetentionMap,
    split_queue: SplitQueue,

    transmits: VecDeque<Bytes>,
    events: VecDeque<EndpointEvent>,

    tick: u64,
    last_receive_tick: u64,
    handshake_tick: u64,
    handshake_attempts: u32,
    epoch: Instant,
}

impl Endpoint {
    fn new(
        address: SocketAddr,
        mtu_size: u16,
        protocol: u8,
        local_guid: i64,
        role: Role,
        state: ConnectionState,
        config: EndpointConfig,
    ) -> Self {
        let retention_capacity = config.retention_capacity;
        Self {
            address,
            local_guid,
            mtu_size,
            protocol,
            role,
            state,
            config,
            sequence_number: 0,
            last_split_id: 0,
            send_queue: VecDeque::new(),
            held: VecDeque::new(),
            sent_packets: RetentionMap::new(retention_capacity),
            split_queue: SplitQueue::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            tick: 0,
            last_receive_tick: 0,
            handshake_tick: 0,
            handshake_attempts: 0,
            epoch: Instant::now(),
        }
    }

    /// Creates the endpoint for a client that sent an open-connection request
    ///
    /// The request datagram is expected to be fed through
    /// [`Endpoint::on_datagram`] right after, which answers it.
    pub fn accept(
        address: SocketAddr,
        mtu_size: u16,
        protocol: u8,
        local_guid: i64,
        config: EndpointConfig,
    ) -> Self {
        Self::new(
            address,
            mtu_size,
            protocol,
            local_guid,
            Role::Accepting,
            ConnectionState::AwaitingRequestTwo,
            config,
        )
    }

    /// Creates an endpoint toward a server and sends the first handshake request
    pub fn connect(
        address: SocketAddr,
        mtu_size: u16,
        protocol: u8,
        local_guid: i64,
        config: EndpointConfig,
    ) -> Self {
        let mut endpoint = Self::new(
            address,
            mtu_size,
            protocol,
            local_guid,
            Role::Connecting,
            ConnectionState::AwaitingReplyOne,
            config,
        );
        endpoint.send_handshake_stage();
        endpoint
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn mtu_size(&self) -> u16 {
        self.mtu_size
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Sequence number the next bundle will carry
    pub fn next_sequence(&self) -> u32 {
        self.sequence_number
    }

    /// Split id the next fragmented packet will carry
    pub fn next_split_id(&self) -> u16 {
        self.last_split_id
    }

    pub fn retained_len(&self) -> usize {
        self.sent_packets.len()
    }

    pub fn is_retained(&self, sequence: u32) -> bool {
        self.sent_packets.contains(sequence)
    }

    pub fn pending_splits(&self) -> usize {
        self.split_queue.len()
    }

    pub fn queued_len(&self) -> usize {
        self.send_queue.len() + self.held.len()
    }

    /// Ticks elapsed since the last datagram from the peer
    pub fn idle_ticks(&self) -> u64 {
        self.tick - self.last_receive_tick
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<EndpointEvent> {
        self.events.pop_front()
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Processes one datagram received from the peer
    pub fn on_datagram(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        let flag_byte = BinaryReader::new(data.clone())
            .peek_u8()
            .map_err(|_| ProtocolError::EmptyDatagram)?;
        self.last_receive_tick = self.tick;

        if flag_byte & flags::ACK != 0 {
            self.handle_ack(data)
        } else if flag_byte & flags::NAK != 0 {
            self.handle_nak(data)
        } else if flag_byte & flags::VALID != 0 {
            self.handle_bundle(data)
        } else {
            self.handle_unconnected(flag_byte, data)
        }
    }

    fn handle_ack(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        let ack = AckPacket::decode(data)?;
        for sequence in ack.sequences {
            self.sent_packets.remove(sequence);
        }
        Ok(())
    }

    fn handle_nak(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        let nak = AckPacket::decode(data)?;
        for sequence in nak.sequences {
            match self.sent_packets.get(sequence) {
                Some(bytes) => self.transmits.push_back(bytes.clone()),
                None => debug!(
                    "{}: NAK for sequence {} which is no longer retained",
                    self.address, sequence
                ),
            }
        }
        Ok(())
    }

    fn handle_bundle(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        let bundle = Bundle::decode(data)?;
        self.transmits
            .push_back(AckPacket::ack(vec![bundle.sequence_number]).encode()?);

        for entry in bundle.entries {
            self.handle_entry(entry)?;
        }
        Ok(())
    }

    fn handle_entry(&mut self, entry: Entry) -> Result<(), ProtocolError> {
        match entry.split {
            None => {
                self.deliver(entry.payload);
                Ok(())
            }
            Some(split) => {
                if let Some(payload) = self.split_queue.insert(split, entry.payload, self.tick)? {
                    self.handle_entry(Entry::new(entry.reliability, payload))?;
                }
                Ok(())
            }
        }
    }

    fn deliver(&mut self, payload: Bytes) {
        let Some(id) = payload.first().copied() else {
            return;
        };
        match ConnectedId::from_u8(id) {
            Some(control) => self.handle_control(control, payload),
            None => self.events.push_back(EndpointEvent::Payload(payload)),
        }
    }

    fn handle_control(&mut self, id: ConnectedId, payload: Bytes) {
        let result = match (id, self.role) {
            (ConnectedId::ConnectedPing, _) => ConnectedPing::decode(payload).map(|ping| {
                let pong = ConnectedPong {
                    ping_time: ping.time,
                    pong_time: self.now_ms(),
                };
                self.queue_control(Reliability::Unreliable, pong.encode());
            }),
            (ConnectedId::ConnectedPong, _) => Ok(()),
            (ConnectedId::ConnectionRequest, Role::Accepting) => {
                ConnectionRequest::decode(payload).map(|request| {
                    let accepted = ConnectionRequestAccepted {
                        client_address: self.address,
                        request_time: request.time,
                        time: self.now_ms(),
                    };
                    self.queue_control(Reliability::Reliable, accepted.encode());
                    if self.state != ConnectionState::Connected {
                        self.state = ConnectionState::AwaitingNewIncoming;
                    }
                })
            }
            (ConnectedId::NewIncomingConnection, Role::Accepting) => {
                NewIncomingConnection::decode(payload).map(|_| self.mark_connected())
            }
            (ConnectedId::ConnectionRequestAccepted, Role::Connecting) => {
                ConnectionRequestAccepted::decode(payload).map(|accepted| {
                    let incoming = NewIncomingConnection {
                        server_address: self.address,
                        request_time: accepted.time,
                        time: self.now_ms(),
                    };
                    self.queue_control(Reliability::ReliableOrdered, incoming.encode());
                    self.mark_connected();
                })
            }
            (ConnectedId::DisconnectionNotification, _) => {
                info!("{}: peer disconnected", self.address);
                self.state = ConnectionState::Closed;
                self.events.push_back(EndpointEvent::Disconnected);
                Ok(())
            }
            (other, role) => {
                warn!(
                    "{}: dropping {:?} not expected by {:?} endpoint",
                    self.address, other, role
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("{}: malformed {:?}: {}", self.address, id, e);
        }
    }

    fn mark_connected(&mut self) {
        if self.state == ConnectionState::Connected {
            return;
        }
        self.state = ConnectionState::Connected;
        self.send_queue.extend(self.held.drain(..));
        self.events.push_back(EndpointEvent::Connected);
        debug!("{}: connected with mtu {}", self.address, self.mtu_size);
    }

    fn handle_unconnected(&mut self, id: u8, data: Bytes) -> Result<(), ProtocolError> {
        match (UnconnectedId::from_u8(id), self.role) {
            (Some(UnconnectedId::OpenConnectionRequestOne), Role::Accepting) => {
                let reply = OpenConnectionReplyOne {
                    server_guid: self.local_guid,
                    mtu_size: self.mtu_size,
                };
                self.transmits.push_back(reply.encode());
            }
            (Some(UnconnectedId::OpenConnectionRequestTwo), Role::Accepting) => {
                OpenConnectionRequestTwo::decode(data)?;
                let reply = OpenConnectionReplyTwo {
                    server_guid: self.local_guid,
                    client_address: self.address,
                    mtu_size: self.mtu_size,
                };
                self.transmits.push_back(reply.encode());
                if self.state == ConnectionState::AwaitingRequestTwo {
                    self.state = ConnectionState::AwaitingConnectionRequest;
                }
            }
            (Some(UnconnectedId::OpenConnectionReplyOne), Role::Connecting) => {
                let reply = OpenConnectionReplyOne::decode(data)?;
                if self.state != ConnectionState::AwaitingReplyOne {
                    return Ok(());
                }
                if reply.mtu_size != self.mtu_size {
                    debug!(
                        "{}: server offered mtu {}, keeping {}",
                        self.address, reply.mtu_size, self.mtu_size
                    );
                }
                self.advance_handshake(ConnectionState::AwaitingReplyTwo);
            }
            (Some(UnconnectedId::OpenConnectionReplyTwo), Role::Connecting) => {
                OpenConnectionReplyTwo::decode(data)?;
                if self.state != ConnectionState::AwaitingReplyTwo {
                    return Ok(());
                }
                self.advance_handshake(ConnectionState::AwaitingAcceptance);
            }
            (
                Some(UnconnectedId::NoFreeIncomingConnections)
                | Some(UnconnectedId::IncompatibleProtocolVersion),
                Role::Connecting,
            ) => {
                warn!("{}: server refused connection (0x{:02x})", self.address, id);
                self.fail_handshake();
            }
            _ => debug!(
                "{}: dropping unconnected packet 0x{:02x}",
                self.address, id
            ),
        }
        Ok(())
    }

    fn advance_handshake(&mut self, next: ConnectionState) {
        self.state = next;
        self.handshake_attempts = 0;
        self.send_handshake_stage();
    }

    fn send_handshake_stage(&mut self) {
        self.handshake_tick = self.tick;
        match self.state {
            ConnectionState::AwaitingReplyOne => {
                let request = OpenConnectionRequestOne {
                    protocol: self.protocol,
                    mtu_size: self.mtu_size,
                };
                self.transmits.push_back(request.encode());
            }
            ConnectionState::AwaitingReplyTwo => {
                let request = OpenConnectionRequestTwo {
                    server_address: self.address,
                    mtu_size: self.mtu_size,
                    client_guid: self.local_guid,
                };
                self.transmits.push_back(request.encode());
            }
            ConnectionState::AwaitingAcceptance => {
                let request = ConnectionRequest {
                    client_guid: self.local_guid,
                    time: self.now_ms(),
                };
                self.queue_control(Reliability::Reliable, request.encode());
            }
            _ => {}
        }
    }

    fn fail_handshake(&mut self) {
        self.state = ConnectionState::Closed;
        self.events.push_back(EndpointEvent::HandshakeFailed);
    }

    fn retry_handshake(&mut self) {
        let pending = matches!(
            self.state,
            ConnectionState::AwaitingReplyOne
                | ConnectionState::AwaitingReplyTwo
                | ConnectionState::AwaitingAcceptance
        );
        if self.role != Role::Connecting || !pending {
            return;
        }
        if self.tick - self.handshake_tick < self.config.handshake_retry_ticks {
            return;
        }
        self.handshake_attempts += 1;
        if self.handshake_attempts > self.config.handshake_attempts {
            warn!(
                "{}: no handshake answer after {} attempts",
                self.address, self.config.handshake_attempts
            );
            self.fail_handshake();
            return;
        }
        debug!(
            "{}: resending {:?} stage (attempt {})",
            self.address, self.state, self.handshake_attempts
        );
        self.send_handshake_stage();
    }

    /// Submits a packet for transmission
    ///
    /// Raw datagrams go straight to the wire. Queued packets are bundled on
    /// the next tick; on a connecting endpoint they are held until the
    /// handshake completes.
    pub fn send(&mut self, outbound: Outbound) -> Result<(), ProtocolError> {
        match outbound {
            Outbound::Raw(datagram) => {
                self.transmits.push_back(datagram);
                Ok(())
            }
            Outbound::Queued(packet) => {
                self.check_sendable(&packet)?;
                if self.role == Role::Connecting && !self.is_connected() {
                    self.held.push_back(packet);
                } else {
                    self.send_queue.push_back(packet);
                }
                Ok(())
            }
        }
    }

    fn check_sendable(&self, packet: &Outgoing) -> Result<(), ProtocolError> {
        if packet.payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        let mtu = self.mtu_size as usize;
        if packet.payload.len() > max_payload_len(mtu) {
            return Err(ProtocolError::PayloadTooLarge {
                size: packet.payload.len(),
                mtu,
            });
        }
        Ok(())
    }

    /// Queues an application payload with the default reliability
    pub fn send_payload(&mut self, payload: Bytes) -> Result<(), ProtocolError> {
        self.send(Outbound::Queued(Outgoing::new(payload)))
    }

    fn queue_control(&mut self, reliability: Reliability, payload: Bytes) {
        self.send_queue
            .push_back(Outgoing::with_reliability(reliability, payload));
    }

    /// Advances time by one tick: expiry sweeps, handshake retries and a flush
    pub fn tick(&mut self) {
        self.tick += 1;

        let expired = self
            .sent_packets
            .sweep(self.tick, self.config.retention_ttl_ticks);
        if expired > 0 {
            debug!("{}: {} unacknowledged bundles expired", self.address, expired);
        }
        let stale = self
            .split_queue
            .sweep(self.tick, self.config.reassembly_ttl_ticks);
        if stale > 0 {
            warn!("{}: dropped {} incomplete split groups", self.address, stale);
        }

        self.retry_handshake();
        self.flush(self.config.max_packets_per_tick);
    }

    /// Bundles up to `limit` queued packets and moves the result to the wire
    pub fn flush(&mut self, limit: usize) {
        if self.send_queue.is_empty() {
            return;
        }
        let count = limit.min(self.send_queue.len());
        let drained: Vec<Outgoing> = self.send_queue.drain(..count).collect();
        let mut batch = Vec::with_capacity(drained.len());
        for packet in drained {
            match self.check_sendable(&packet) {
                Ok(()) => batch.push(packet),
                Err(e) => warn!("{}: dropping unsendable packet: {}", self.address, e),
            }
        }
        if batch.is_empty() {
            return;
        }

        // Only the whole batch can fail from here on; it goes back to the front of the queue.
        let bundled = match bundle_packets(
            batch.iter().cloned(),
            self.sequence_number,
            self.last_split_id,
            self.mtu_size as usize,
        ) {
            Ok(bundled) => bundled,
            Err(e) => {
                warn!("{}: cannot bundle {} packets, requeued: {}", self.address, batch.len(), e);
                for packet in batch.into_iter().rev() {
                    self.send_queue.push_front(packet);
                }
                return;
            }
        };

        for bundle in bundled.bundles {
            let bytes = bundle.encode();
            self.sent_packets
                .insert(bundle.sequence_number, bytes.clone(), self.tick);
            self.transmits.push_back(bytes);
        }
        self.sequence_number = bundled.next_sequence;
        self.last_split_id = bundled.next_split_id;
    }

    /// Queues a disconnection notification and flushes everything pending
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.held.clear();
        self.queue_control(Reliability::ReliableOrdered, disconnection_notification());
        self.flush(usize::MAX);
        self.state = ConnectionState::Closed;
    }

    /// Refusal datagram for a client this process cannot take
    pub fn refusal(reason: UnconnectedId, server_guid: i64, protocol: Option<u8>) -> Bytes {
        ConnectionRefusal {
            reason,
            server_guid,
            protocol,
        }
        .encode()
    }
}
