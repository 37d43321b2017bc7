//! Relay and backend hand-off for one player
//!
//! A [`Session`] owns the client-facing endpoint and the currently active
//! server-facing endpoint of one peer and forwards application payloads
//! between them. Backend traffic is inspected for relay control packets:
//! a transfer request swaps the server-facing endpoint for a new one while
//! the client-facing endpoint keeps its sequence space, split ids and
//! retention map untouched.
//!
//! Like [`protocol::Endpoint`] this type performs no I/O. Datagrams for the
//! wire are polled per side, and work the session cannot do by itself
//! (backend resolution, teardown) is surfaced as a [`SessionAction`].

use crate::control::{ContextChange, ControlPacket, ResumeLogin, SegmentReassembler, Transfer};
use bytes::Bytes;
use log::{debug, info, warn};
use protocol::{Endpoint, EndpointConfig, EndpointEvent, ProtocolError};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Client payloads kept while no backend is attached
pub const MAX_HELD_PAYLOADS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    BackendDisconnected,
    BackendUnreachable,
    HandoffFailed,
    IdleTimeout,
    ProtocolFault,
}

/// Work the owner of a session must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Resolve `service_class`, then call [`Session::complete_handoff`] or [`Session::fail_handoff`]
    Resolve {
        generation: u64,
        service_class: String,
    },
    /// A new server-facing endpoint replaced the previous one
    BackendChanged { generation: u64, address: SocketAddr },
    /// The session is over and must be deregistered
    Close(CloseReason),
}

struct PendingHandoff {
    generation: u64,
    transfer: Transfer,
}

pub struct Session {
    client: Endpoint,
    backend: Option<Endpoint>,
    generation: u64,
    service_class: String,
    local_guid: i64,
    config: EndpointConfig,

    pending: Option<PendingHandoff>,
    held: VecDeque<Bytes>,
    segments: SegmentReassembler,
    actions: VecDeque<SessionAction>,
    closed: bool,
}

impl Session {
    /// Pairs `client` with a new server-facing endpoint toward `backend_address`
    ///
    /// The backend connection reuses the MTU and protocol version the client
    /// negotiated.
    pub fn new(
        client: Endpoint,
        backend_address: SocketAddr,
        service_class: &str,
        local_guid: i64,
        config: EndpointConfig,
    ) -> Self {
        let backend = Endpoint::connect(
            backend_address,
            client.mtu_size(),
            client.protocol(),
            local_guid,
            config.clone(),
        );
        Self {
            client,
            backend: Some(backend),
            generation: 0,
            service_class: service_class.to_string(),
            local_guid,
            config,
            pending: None,
            held: VecDeque::new(),
            segments: SegmentReassembler::new(),
            actions: VecDeque::new(),
            closed: false,
        }
    }

    pub fn client_address(&self) -> SocketAddr {
        self.client.address()
    }

    pub fn client(&self) -> &Endpoint {
        &self.client
    }

    pub fn backend(&self) -> Option<&Endpoint> {
        self.backend.as_ref()
    }

    pub fn backend_address(&self) -> Option<SocketAddr> {
        self.backend.as_ref().map(Endpoint::address)
    }

    /// Identity of the current server-facing endpoint; bumped on every hand-off
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn service_class(&self) -> &str {
        &self.service_class
    }

    pub fn is_handing_off(&self) -> bool {
        self.pending.is_some()
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn idle_ticks(&self) -> u64 {
        self.client.idle_ticks()
    }

    pub fn poll_client_transmit(&mut self) -> Option<Bytes> {
        self.client.poll_transmit()
    }

    pub fn poll_backend_transmit(&mut self) -> Option<Bytes> {
        self.backend.as_mut().and_then(Endpoint::poll_transmit)
    }

    pub fn poll_action(&mut self) -> Option<SessionAction> {
        self.actions.pop_front()
    }

    pub fn on_client_datagram(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        self.client.on_datagram(data)?;
        self.drain_client_events();
        Ok(())
    }

    /// Feeds a datagram that arrived on the upstream socket of `generation`
    ///
    /// Datagrams from a backend that was already replaced are dropped.
    pub fn on_backend_datagram(&mut self, generation: u64, data: Bytes) -> Result<(), ProtocolError> {
        if generation != self.generation {
            debug!(
                "{}: dropping datagram from replaced backend generation {}",
                self.client_address(),
                generation
            );
            return Ok(());
        }
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        backend.on_datagram(data)?;
        self.drain_backend_events();
        Ok(())
    }

    pub fn tick(&mut self) {
        self.client.tick();
        if let Some(backend) = self.backend.as_mut() {
            backend.tick();
        }
        self.drain_client_events();
        self.drain_backend_events();
    }

    fn drain_client_events(&mut self) {
        while let Some(event) = self.client.poll_event() {
            match event {
                EndpointEvent::Connected => {
                    info!("{}: client connected", self.client_address());
                }
                EndpointEvent::Payload(payload) => self.forward_to_backend(payload),
                EndpointEvent::Disconnected => self.close(CloseReason::ClientDisconnected),
                EndpointEvent::HandshakeFailed => self.close(CloseReason::ProtocolFault),
            }
        }
    }

    fn drain_backend_events(&mut self) {
        loop {
            let Some(event) = self.backend.as_mut().and_then(Endpoint::poll_event) else {
                break;
            };
            match event {
                EndpointEvent::Connected => {
                    debug!(
                        "{}: backend {:?} connected",
                        self.client_address(),
                        self.backend_address()
                    );
                }
                EndpointEvent::Payload(payload) => self.handle_backend_payload(payload),
                EndpointEvent::Disconnected => self.close(CloseReason::BackendDisconnected),
                EndpointEvent::HandshakeFailed => self.close(CloseReason::BackendUnreachable),
            }
        }
    }

    fn forward_to_backend(&mut self, payload: Bytes) {
        if self.pending.is_none() {
            if let Some(backend) = self.backend.as_mut() {
                if let Err(e) = backend.send_payload(payload) {
                    warn!("{}: dropping client payload: {}", self.client.address(), e);
                }
                return;
            }
        }
        if self.held.len() >= MAX_HELD_PAYLOADS {
            warn!(
                "{}: hand-off backlog full, dropping oldest payload",
                self.client_address()
            );
            self.held.pop_front();
        }
        self.held.push_back(payload);
    }

    fn forward_to_client(&mut self, payload: Bytes) {
        if let Err(e) = self.client.send_payload(payload) {
            warn!("{}: dropping backend payload: {}", self.client.address(), e);
        }
    }

    fn handle_backend_payload(&mut self, payload: Bytes) {
        match ControlPacket::decode(payload.clone()) {
            Ok(Some(ControlPacket::Transfer(transfer))) => self.begin_handoff(transfer),
            Ok(Some(ControlPacket::Segment(segment))) => match self.segments.insert(segment) {
                Ok(Some(message)) => self.handle_segmented(message),
                Ok(None) => {}
                Err(e) => warn!("{}: bad control segment: {}", self.client_address(), e),
            },
            Ok(_) => self.forward_to_client(payload),
            Err(e) => warn!("{}: malformed control packet: {}", self.client_address(), e),
        }
    }

    fn handle_segmented(&mut self, message: Bytes) {
        match ControlPacket::decode(message) {
            Ok(Some(ControlPacket::Transfer(transfer))) => self.begin_handoff(transfer),
            Ok(Some(other)) => warn!(
                "{}: ignoring segmented control packet {:?}",
                self.client_address(),
                other
            ),
            Ok(None) => warn!(
                "{}: segmented message is not a control packet",
                self.client_address()
            ),
            Err(e) => warn!("{}: malformed segmented message: {}", self.client_address(), e),
        }
    }

    fn begin_handoff(&mut self, transfer: Transfer) {
        info!(
            "{}: transfer to service class {:?} requested",
            self.client_address(),
            transfer.service_class
        );
        self.forward_to_client(ContextChange::transition().encode());

        self.backend = None;
        self.generation += 1;
        self.service_class = transfer.service_class.clone();
        self.actions.push_back(SessionAction::Resolve {
            generation: self.generation,
            service_class: transfer.service_class.clone(),
        });
        self.pending = Some(PendingHandoff {
            generation: self.generation,
            transfer,
        });
    }

    /// Attaches the backend resolved for the hand-off of `generation`
    ///
    /// Resolutions for a superseded hand-off are ignored.
    pub fn complete_handoff(&mut self, generation: u64, address: SocketAddr) {
        let Some(pending) = self.take_pending(generation) else {
            debug!(
                "{}: ignoring stale resolution for generation {}",
                self.client_address(),
                generation
            );
            return;
        };

        let mut backend = Endpoint::connect(
            address,
            self.client.mtu_size(),
            self.client.protocol(),
            self.local_guid,
            self.config.clone(),
        );
        let transfer = pending.transfer;
        let resume = ResumeLogin {
            client_address: self.client.address(),
            mtu_size: self.client.mtu_size(),
            client_id: transfer.client_id,
            sequence_number: transfer.sequence_number,
            login_data: transfer.login_data,
        };
        if let Err(e) = backend.send_payload(resume.encode()) {
            warn!("{}: cannot replay login: {}", self.client_address(), e);
            self.close(CloseReason::HandoffFailed);
            return;
        }
        for payload in self.held.drain(..) {
            if let Err(e) = backend.send_payload(payload) {
                warn!("{}: dropping held payload: {}", self.client.address(), e);
            }
        }

        info!("{}: handed off to {}", self.client_address(), address);
        self.backend = Some(backend);
        self.actions.push_back(SessionAction::BackendChanged {
            generation: self.generation,
            address,
        });
    }

    fn take_pending(&mut self, generation: u64) -> Option<PendingHandoff> {
        let current = self
            .pending
            .as_ref()
            .map_or(false, |pending| pending.generation == generation);
        if current {
            self.pending.take()
        } else {
            None
        }
    }

    pub fn fail_handoff(&mut self, generation: u64) {
        if self.take_pending(generation).is_some() {
            self.close(CloseReason::HandoffFailed);
        }
    }

    /// Marks the session closed and tells the client; the next drain of
    /// client transmits carries the notification
    pub fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        if reason != CloseReason::ClientDisconnected {
            self.client.disconnect();
        }
        if let Some(backend) = self.backend.as_mut() {
            if reason != CloseReason::BackendDisconnected {
                backend.disconnect();
            }
        }
        self.actions.push_back(SessionAction::Close(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
