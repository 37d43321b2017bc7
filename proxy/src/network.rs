//! Proxy network layer: sockets, tasks and the event loop driving all sessions

use crate::config::ProxyConfig;
use crate::discovery::{resolve_within, Discovery};
use crate::dispatcher::{Dispatch, Dispatcher, Motd};
use crate::error::{DiscoveryError, ProxyError};
use crate::registry::{Admission, PeerRegistry};
use crate::session::{CloseReason, Session, SessionAction};
use bytes::Bytes;
use log::{debug, error, info, warn};
use protocol::{Endpoint, UnconnectedId};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Why a backend lookup was started
#[derive(Debug)]
pub enum Lookup {
    /// First backend of a new peer; `request` is replayed once the session exists
    Open {
        mtu_size: u16,
        protocol: u8,
        request: Bytes,
    },
    /// Replacement backend for the hand-off of `generation`
    Handoff { generation: u64 },
}

/// Messages sent from network tasks to the main loop
#[derive(Debug)]
pub enum ProxyEvent {
    ClientDatagram {
        addr: SocketAddr,
        data: Bytes,
    },
    BackendDatagram {
        client: SocketAddr,
        generation: u64,
        data: Bytes,
    },
    Resolved {
        client: SocketAddr,
        lookup: Lookup,
        result: Result<SocketAddr, DiscoveryError>,
    },
}

/// A datagram queued for the sender task
#[derive(Debug)]
pub struct Datagram {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    data: Bytes,
}

/// Socket toward the current backend of one session
struct Upstream {
    socket: Arc<UdpSocket>,
    generation: u64,
    task: JoinHandle<()>,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The relay proxy: public listener, peer registry and backend sockets
pub struct ProxyServer {
    socket: Arc<UdpSocket>,
    config: ProxyConfig,
    discovery: Arc<dyn Discovery>,
    dispatcher: Dispatcher,
    registry: PeerRegistry,
    upstreams: HashMap<SocketAddr, Upstream>,

    // Communication channels
    event_tx: mpsc::UnboundedSender<ProxyEvent>,
    event_rx: mpsc::UnboundedReceiver<ProxyEvent>,
    send_tx: mpsc::UnboundedSender<Datagram>,
    send_rx: mpsc::UnboundedReceiver<Datagram>,
}

impl ProxyServer {
    pub async fn bind(config: ProxyConfig, discovery: Arc<dyn Discovery>) -> Result<Self, ProxyError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_address).await?);
        let local = socket.local_addr()?;
        info!("Proxy listening on {}", local);

        let motd = Motd {
            line: config.motd.clone(),
            sub_line: config.sub_motd.clone(),
            game_protocol: config.game_protocol,
            game_version: config.game_version.clone(),
            port: local.port(),
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        Ok(ProxyServer {
            socket,
            dispatcher: Dispatcher::new(config.server_guid, motd),
            registry: PeerRegistry::new(config.max_players),
            upstreams: HashMap::new(),
            config,
            discovery,
            event_tx,
            event_rx,
            send_tx,
            send_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns task that continuously listens on the public socket
    fn spawn_listener_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = Bytes::copy_from_slice(&buffer[..len]);
                        if event_tx.send(ProxyEvent::ClientDatagram { addr, data }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving on listener: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing datagram queue
    fn spawn_sender(&mut self) {
        let mut send_rx = std::mem::replace(&mut self.send_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(datagram) = send_rx.recv().await {
                if let Err(e) = datagram.socket.send_to(&datagram.data, datagram.addr).await {
                    error!("Failed to send datagram to {}: {}", datagram.addr, e);
                }
            }
        });
    }

    /// Binds a fresh socket toward `backend` and spawns its receiver
    async fn open_upstream(
        &self,
        client: SocketAddr,
        generation: u64,
        backend: SocketAddr,
    ) -> Result<Upstream, ProxyError> {
        let bind_addr = if backend.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let receiver = Arc::clone(&socket);
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match receiver.recv_from(&mut buffer).await {
                    Ok((len, from)) if from == backend => {
                        let data = Bytes::copy_from_slice(&buffer[..len]);
                        let event = ProxyEvent::BackendDatagram {
                            client,
                            generation,
                            data,
                        };
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok((_, from)) => debug!("{}: ignoring upstream datagram from {}", client, from),
                    Err(e) => {
                        debug!("{}: upstream receive error: {}", client, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        Ok(Upstream {
            socket,
            generation,
            task,
        })
    }

    fn send(&self, socket: &Arc<UdpSocket>, addr: SocketAddr, data: Bytes) {
        let datagram = Datagram {
            socket: Arc::clone(socket),
            addr,
            data,
        };
        if let Err(e) = self.send_tx.send(datagram) {
            error!("Failed to queue datagram: {}", e);
        }
    }

    fn spawn_lookup(&self, client: SocketAddr, service_class: String, lookup: Lookup) {
        let discovery = Arc::clone(&self.discovery);
        let event_tx = self.event_tx.clone();
        let limit = self.config.discovery_timeout;

        tokio::spawn(async move {
            let result = resolve_within(discovery, &service_class, limit).await;
            let event = ProxyEvent::Resolved {
                client,
                lookup,
                result,
            };
            if let Err(e) = event_tx.send(event) {
                error!("{}: dropping lookup result, proxy stopped: {}", client, e);
            }
        });
    }

    async fn handle_event(&mut self, event: ProxyEvent) {
        match event {
            ProxyEvent::ClientDatagram { addr, data } => self.handle_client_datagram(addr, data).await,
            ProxyEvent::BackendDatagram {
                client,
                generation,
                data,
            } => {
                if let Some(session) = self.registry.get_mut(&client) {
                    if let Err(e) = session.on_backend_datagram(generation, data) {
                        warn!("{}: protocol fault from backend: {}", client, e);
                        session.close(CloseReason::ProtocolFault);
                    }
                    self.service_session(client).await;
                }
            }
            ProxyEvent::Resolved {
                client,
                lookup,
                result,
            } => self.handle_resolved(client, lookup, result).await,
        }
    }

    async fn handle_client_datagram(&mut self, addr: SocketAddr, data: Bytes) {
        if let Some(session) = self.registry.get_mut(&addr) {
            if let Err(e) = session.on_client_datagram(data) {
                warn!("{}: protocol fault: {}", addr, e);
                session.close(CloseReason::ProtocolFault);
            }
            self.service_session(addr).await;
            return;
        }

        let dispatch = self.dispatcher.classify(
            &data,
            self.registry.len(),
            self.registry.max_peers(),
            self.registry.is_full(),
        );
        match dispatch {
            Dispatch::Reply(reply) => self.send(&self.socket, addr, reply),
            Dispatch::Open {
                mtu_size,
                protocol,
                request,
            } => match self.registry.begin_lookup(addr) {
                Admission::Accepted => {
                    debug!("{}: resolving backend (mtu {})", addr, mtu_size);
                    let lookup = Lookup::Open {
                        mtu_size,
                        protocol,
                        request,
                    };
                    self.spawn_lookup(addr, self.config.default_service.clone(), lookup);
                }
                Admission::Duplicate => debug!("{}: lookup already in flight", addr),
                Admission::Full => {
                    let refusal = Endpoint::refusal(
                        UnconnectedId::NoFreeIncomingConnections,
                        self.dispatcher.server_guid(),
                        None,
                    );
                    self.send(&self.socket, addr, refusal);
                }
            },
            Dispatch::Drop => {}
        }
    }

    async fn handle_resolved(
        &mut self,
        client: SocketAddr,
        lookup: Lookup,
        result: Result<SocketAddr, DiscoveryError>,
    ) {
        match lookup {
            Lookup::Open {
                mtu_size,
                protocol,
                request,
            } => match result {
                Ok(backend) => {
                    if let Err(e) = self.open_session(client, backend, mtu_size, protocol, request).await {
                        warn!("{}: could not open session: {}", client, e);
                        self.registry.abandon_lookup(&client);
                    }
                }
                Err(e) => {
                    warn!("{}: backend lookup failed: {}", client, e);
                    self.registry.abandon_lookup(&client);
                }
            },
            Lookup::Handoff { generation } => {
                let Some(session) = self.registry.get_mut(&client) else {
                    return;
                };
                match result {
                    Ok(backend) => session.complete_handoff(generation, backend),
                    Err(e) => {
                        warn!("{}: hand-off lookup failed: {}", client, e);
                        session.fail_handoff(generation);
                    }
                }
                self.service_session(client).await;
            }
        }
    }

    async fn open_session(
        &mut self,
        client: SocketAddr,
        backend: SocketAddr,
        mtu_size: u16,
        protocol: u8,
        request: Bytes,
    ) -> Result<(), ProxyError> {
        let endpoint = Endpoint::accept(
            client,
            mtu_size,
            protocol,
            self.config.server_guid,
            self.config.endpoint.clone(),
        );
        let mut session = Session::new(
            endpoint,
            backend,
            &self.config.default_service,
            self.config.server_guid,
            self.config.endpoint.clone(),
        );
        let upstream = self.open_upstream(client, session.generation(), backend).await?;
        session.on_client_datagram(request)?;

        if self.registry.register(session).is_err() {
            return Ok(());
        }
        info!("{}: relaying to {} (mtu {})", client, backend, mtu_size);
        self.upstreams.insert(client, upstream);
        self.service_session(client).await;
        Ok(())
    }

    /// Carries out pending session actions and flushes its datagrams
    async fn service_session(&mut self, addr: SocketAddr) {
        loop {
            let Some(action) = self.registry.get_mut(&addr).and_then(Session::poll_action) else {
                break;
            };
            match action {
                SessionAction::Resolve {
                    generation,
                    service_class,
                } => {
                    self.upstreams.remove(&addr);
                    info!("{}: resolving {:?} for hand-off", addr, service_class);
                    self.spawn_lookup(addr, service_class, Lookup::Handoff { generation });
                }
                SessionAction::BackendChanged {
                    generation,
                    address,
                } => match self.open_upstream(addr, generation, address).await {
                    Ok(upstream) => {
                        self.upstreams.insert(addr, upstream);
                    }
                    Err(e) => {
                        error!("{}: cannot reach new backend {}: {}", addr, address, e);
                        if let Some(session) = self.registry.get_mut(&addr) {
                            session.close(CloseReason::HandoffFailed);
                        }
                    }
                },
                SessionAction::Close(reason) => {
                    self.flush_session(addr);
                    info!("{}: session closed ({:?})", addr, reason);
                    self.registry.remove(&addr);
                    self.upstreams.remove(&addr);
                    return;
                }
            }
        }
        self.flush_session(addr);
    }

    /// Queues every datagram the session has ready on both sides
    fn flush_session(&mut self, addr: SocketAddr) {
        let Some(session) = self.registry.get_mut(&addr) else {
            return;
        };
        let datagrams = collect_transmits(session, &self.socket, self.upstreams.get(&addr));
        for datagram in datagrams {
            if let Err(e) = self.send_tx.send(datagram) {
                error!("Failed to queue datagram: {}", e);
            }
        }
    }

    async fn on_tick(&mut self) {
        for (_, session) in self.registry.sessions_mut() {
            session.tick();
        }

        for mut session in self.registry.take_idle(self.config.idle_timeout_ticks()) {
            let addr = session.client_address();
            info!("{}: idle timeout", addr);
            session.close(CloseReason::IdleTimeout);
            let upstream = self.upstreams.remove(&addr);
            for datagram in collect_transmits(&mut session, &self.socket, upstream.as_ref()) {
                if let Err(e) = self.send_tx.send(datagram) {
                    error!("Failed to queue datagram: {}", e);
                }
            }
        }

        for addr in self.registry.addresses() {
            self.service_session(addr).await;
        }
    }

    /// Main proxy loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), ProxyError> {
        self.spawn_listener_receiver();
        self.spawn_sender();

        let mut tick_interval = interval(self.config.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Proxy started, routing new players to {:?}", self.config.default_service);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("Proxy shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.on_tick().await;
                },
            }
        }

        Ok(())
    }
}

/// Drains both sides of `session` into datagrams for the sender task
///
/// Backend datagrams are only sent through the upstream of the session's
/// current generation.
fn collect_transmits(
    session: &mut Session,
    listener: &Arc<UdpSocket>,
    upstream: Option<&Upstream>,
) -> Vec<Datagram> {
    let mut out = Vec::new();
    let client = session.client_address();
    while let Some(data) = session.poll_client_transmit() {
        out.push(Datagram {
            socket: Arc::clone(listener),
            addr: client,
            data,
        });
    }

    let target = upstream
        .filter(|upstream| upstream.generation == session.generation())
        .zip(session.backend_address());
    let Some((upstream, backend)) = target else {
        return out;
    };
    while let Some(data) = session.poll_backend_transmit() {
        out.push(Datagram {
            socket: Arc::clone(&upstream.socket),
            addr: backend,
            data,
        });
    }
    out
}
