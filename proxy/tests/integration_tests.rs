//! End-to-end tests running a real proxy against fake clients and backends
//! over localhost UDP.

use bytes::Bytes;
use protocol::packets::{OpenConnectionRequestOne, UnconnectedPing, UnconnectedPong};
use protocol::{Endpoint, EndpointConfig, EndpointEvent, UnconnectedId};
use proxy::control::{ContextChange, ResumeLogin, Segment, Transfer, CONTEXT_CHANGE, RESUME_LOGIN};
use proxy::{ProxyConfig, ProxyServer, StaticDiscovery};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const MTU: u16 = 1400;
const STEP: Duration = Duration::from_millis(5);

async fn bind_local() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

/// Reads every datagram already waiting on `socket`
fn drain_socket(socket: &UdpSocket) -> Vec<(Bytes, SocketAddr)> {
    let mut buf = [0u8; 2048];
    let mut out = Vec::new();
    while let Ok((len, from)) = socket.try_recv_from(&mut buf) {
        out.push((Bytes::copy_from_slice(&buf[..len]), from));
    }
    out
}

fn payloads(events: &[EndpointEvent]) -> Vec<Bytes> {
    events
        .iter()
        .filter_map(|e| match e {
            EndpointEvent::Payload(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

/// A game client speaking to the proxy through a real socket
struct FakeClient {
    socket: UdpSocket,
    endpoint: Endpoint,
    events: Vec<EndpointEvent>,
}

impl FakeClient {
    async fn connect(proxy: SocketAddr) -> Self {
        Self {
            socket: bind_local().await,
            endpoint: Endpoint::connect(proxy, MTU, 11, rand::random(), EndpointConfig::default()),
            events: Vec::new(),
        }
    }

    async fn step(&mut self) {
        self.endpoint.tick();
        while let Some(datagram) = self.endpoint.poll_transmit() {
            self.socket.send_to(&datagram, self.endpoint.address()).await.unwrap();
        }
        for (datagram, _) in drain_socket(&self.socket) {
            self.endpoint.on_datagram(datagram).unwrap();
        }
        while let Some(event) = self.endpoint.poll_event() {
            self.events.push(event);
        }
    }
}

/// A backend game server accepting the proxy's server-facing endpoint
struct FakeBackend {
    socket: UdpSocket,
    endpoint: Option<Endpoint>,
    events: Vec<EndpointEvent>,
}

impl FakeBackend {
    async fn new() -> Self {
        Self {
            socket: bind_local().await,
            endpoint: None,
            events: Vec::new(),
        }
    }

    fn address(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn is_connected(&self) -> bool {
        self.endpoint.as_ref().map_or(false, Endpoint::is_connected)
    }

    async fn step(&mut self) {
        for (datagram, from) in drain_socket(&self.socket) {
            if self.endpoint.is_none() {
                let Ok(request) = OpenConnectionRequestOne::decode(datagram.clone()) else {
                    continue;
                };
                self.endpoint = Some(Endpoint::accept(
                    from,
                    request.mtu_size,
                    request.protocol,
                    rand::random(),
                    EndpointConfig::default(),
                ));
            }
            if let Some(endpoint) = self.endpoint.as_mut() {
                endpoint.on_datagram(datagram).unwrap();
            }
        }

        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        endpoint.tick();
        while let Some(datagram) = endpoint.poll_transmit() {
            self.socket.send_to(&datagram, endpoint.address()).await.unwrap();
        }
        while let Some(event) = endpoint.poll_event() {
            self.events.push(event);
        }
    }

    fn send(&mut self, payload: Bytes) {
        self.endpoint.as_mut().unwrap().send_payload(payload).unwrap();
    }
}

struct TestProxy {
    address: SocketAddr,
    handle: JoinHandle<()>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_proxy(backends: &[(&str, SocketAddr)], max_players: usize) -> TestProxy {
    let config = ProxyConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        max_players,
        default_service: "lobby".to_string(),
        ..ProxyConfig::default()
    };
    let mut discovery = StaticDiscovery::default();
    for (class, addr) in backends {
        discovery = discovery.with_backend(class, *addr);
    }

    let mut server = ProxyServer::bind(config, Arc::new(discovery)).await.unwrap();
    let address = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    TestProxy { address, handle }
}

/// Sends a ping from a fresh socket and returns the decoded pong
async fn ping(proxy: SocketAddr, time: i64) -> UnconnectedPong {
    let socket = bind_local().await;
    let ping = UnconnectedPing {
        time,
        client_guid: 7,
    };
    socket.send_to(&ping.encode(), proxy).await.unwrap();

    let mut buf = [0u8; 2048];
    let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no pong received")
        .unwrap();
    assert_eq!(from, proxy);
    UnconnectedPong::decode(Bytes::copy_from_slice(&buf[..len])).unwrap()
}

fn online_players(pong: &UnconnectedPong) -> usize {
    pong.motd.split(';').nth(4).unwrap().parse().unwrap()
}

/// Steps the client and all backends until `done` holds or the step budget runs out
async fn drive(
    client: &mut FakeClient,
    backends: &mut [&mut FakeBackend],
    max_steps: usize,
    done: impl Fn(&FakeClient, &[&mut FakeBackend]) -> bool,
) -> bool {
    for _ in 0..max_steps {
        client.step().await;
        for backend in backends.iter_mut() {
            backend.step().await;
        }
        if done(client, backends) {
            return true;
        }
        sleep(STEP).await;
    }
    false
}

async fn connected_client(proxy: SocketAddr, backend: &mut FakeBackend) -> FakeClient {
    let mut client = FakeClient::connect(proxy).await;
    let connected = drive(&mut client, &mut [backend], 400, |c, b| {
        c.endpoint.is_connected() && b[0].is_connected()
    })
    .await;
    assert!(connected, "client and backend should both be connected");
    client
}

mod pre_connection_tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_answered_without_session() {
        let backend = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", backend.address())], 10).await;

        let pong = ping(proxy.address, 4242).await;
        assert_eq!(pong.time, 4242);
        assert!(pong.motd.starts_with("MCPE;"));
        assert_eq!(online_players(&pong), 0);

        // A second ping still finds nobody registered.
        let pong = ping(proxy.address, 4243).await;
        assert_eq!(online_players(&pong), 0);
    }

    #[tokio::test]
    async fn test_unknown_packet_ignored() {
        let backend = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", backend.address())], 10).await;

        let socket = bind_local().await;
        socket.send_to(&[0x7a, 1, 2, 3], proxy.address).await.unwrap();
        let mut buf = [0u8; 64];
        let reply = timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "unknown packets must not be answered");
    }

    #[tokio::test]
    async fn test_full_proxy_refuses_connection() {
        let mut backend = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", backend.address())], 1).await;
        let _first = connected_client(proxy.address, &mut backend).await;

        let socket = bind_local().await;
        let request = OpenConnectionRequestOne {
            protocol: 11,
            mtu_size: MTU,
        };
        socket.send_to(&request.encode(), proxy.address).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("refusal expected")
            .unwrap();
        assert!(len > 0);
        assert_eq!(buf[0], UnconnectedId::NoFreeIncomingConnections.as_u8());
    }

    #[tokio::test]
    async fn test_unresolvable_service_registers_nobody() {
        let proxy = start_proxy(&[], 10).await;

        let mut client = FakeClient::connect(proxy.address).await;
        for _ in 0..20 {
            client.step().await;
            sleep(STEP).await;
        }
        assert!(!client.endpoint.is_connected());
        assert_eq!(online_players(&ping(proxy.address, 1).await), 0);
    }
}

mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_registers_one_peer() {
        let mut backend = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", backend.address())], 10).await;

        let _client = connected_client(proxy.address, &mut backend).await;
        assert_eq!(online_players(&ping(proxy.address, 1).await), 1);
    }

    #[tokio::test]
    async fn test_payloads_relayed_both_ways() {
        let mut backend = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", backend.address())], 10).await;
        let mut client = connected_client(proxy.address, &mut backend).await;

        client.endpoint.send_payload(Bytes::from_static(&[0xfe, 1, 2, 3])).unwrap();
        backend.send(Bytes::from_static(&[0xfe, 9, 8]));

        let delivered = drive(&mut client, &mut [&mut backend], 200, |c, b| {
            !payloads(&c.events).is_empty() && !payloads(&b[0].events).is_empty()
        })
        .await;
        assert!(delivered);
        assert_eq!(payloads(&backend.events), vec![Bytes::from_static(&[0xfe, 1, 2, 3])]);
        assert_eq!(payloads(&client.events), vec![Bytes::from_static(&[0xfe, 9, 8])]);
    }

    #[tokio::test]
    async fn test_oversized_payload_reassembled() {
        let mut backend = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", backend.address())], 10).await;
        let mut client = connected_client(proxy.address, &mut backend).await;

        let mut large = vec![0xfe];
        large.extend((0..5000u32).map(|i| (i % 251) as u8));
        let large = Bytes::from(large);
        client.endpoint.send_payload(large.clone()).unwrap();

        let delivered = drive(&mut client, &mut [&mut backend], 400, |_, b| {
            !payloads(&b[0].events).is_empty()
        })
        .await;
        assert!(delivered);
        assert_eq!(payloads(&backend.events), vec![large]);
    }

    #[tokio::test]
    async fn test_client_disconnect_deregisters() {
        let mut backend = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", backend.address())], 10).await;
        let mut client = connected_client(proxy.address, &mut backend).await;

        client.endpoint.disconnect();
        let gone = drive(&mut client, &mut [&mut backend], 200, |_, b| {
            b[0].events.iter().any(|e| matches!(e, EndpointEvent::Disconnected))
        })
        .await;
        assert!(gone, "backend should be told the client left");
        assert_eq!(online_players(&ping(proxy.address, 1).await), 0);
    }
}

mod handoff_tests {
    use super::*;

    fn transfer(service_class: &str) -> Transfer {
        Transfer {
            service_class: service_class.to_string(),
            client_id: 1234,
            sequence_number: 56,
            login_data: Bytes::from(vec![0x42; 64]),
        }
    }

    #[tokio::test]
    async fn test_transfer_moves_session_to_new_backend() {
        let mut lobby = FakeBackend::new().await;
        let mut survival = FakeBackend::new().await;
        let proxy = start_proxy(
            &[("lobby", lobby.address()), ("survival", survival.address())],
            10,
        )
        .await;
        let mut client = connected_client(proxy.address, &mut lobby).await;

        lobby.send(transfer("survival").encode());
        let switched = drive(&mut client, &mut [&mut lobby, &mut survival], 400, |c, b| {
            !payloads(&c.events).is_empty() && !payloads(&b[1].events).is_empty()
        })
        .await;
        assert!(switched, "survival backend should receive the resumed login");

        let notices = payloads(&client.events);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0][0], CONTEXT_CHANGE);
        assert_eq!(ContextChange::decode(notices[0].clone()).unwrap().dimension, 1);

        let resumed = payloads(&survival.events);
        assert_eq!(resumed[0][0], RESUME_LOGIN);
        let resume = ResumeLogin::decode(resumed[0].clone()).unwrap();
        assert_eq!(resume.client_id, 1234);
        assert_eq!(resume.sequence_number, 56);
        assert_eq!(resume.mtu_size, MTU);
        assert_eq!(resume.client_address, client.socket.local_addr().unwrap());

        // The client keeps its connection: same endpoint, contiguous sequence numbers.
        client.events.clear();
        survival.events.clear();
        client.endpoint.send_payload(Bytes::from_static(&[0xfe, 0x10])).unwrap();
        survival.send(Bytes::from_static(&[0xfe, 0x20]));
        let relayed = drive(&mut client, &mut [&mut lobby, &mut survival], 200, |c, b| {
            !payloads(&c.events).is_empty() && !payloads(&b[1].events).is_empty()
        })
        .await;
        assert!(relayed);
        assert!(client.endpoint.is_connected());
        assert_eq!(payloads(&client.events), vec![Bytes::from_static(&[0xfe, 0x20])]);
        assert_eq!(payloads(&survival.events), vec![Bytes::from_static(&[0xfe, 0x10])]);
        assert!(client
            .events
            .iter()
            .all(|e| !matches!(e, EndpointEvent::Disconnected)));
        assert!(payloads(&lobby.events).is_empty());
        assert_eq!(online_players(&ping(proxy.address, 1).await), 1);
    }

    #[tokio::test]
    async fn test_segmented_transfer() {
        let mut lobby = FakeBackend::new().await;
        let mut survival = FakeBackend::new().await;
        let proxy = start_proxy(
            &[("lobby", lobby.address()), ("survival", survival.address())],
            10,
        )
        .await;
        let mut client = connected_client(proxy.address, &mut lobby).await;

        for segment in Segment::split(0, &transfer("survival").encode(), 40) {
            lobby.send(segment.encode());
        }
        let switched = drive(&mut client, &mut [&mut lobby, &mut survival], 400, |_, b| {
            !payloads(&b[1].events).is_empty()
        })
        .await;
        assert!(switched);
        assert_eq!(payloads(&survival.events)[0][0], RESUME_LOGIN);
    }

    #[tokio::test]
    async fn test_transfer_to_unknown_class_closes_session() {
        let mut lobby = FakeBackend::new().await;
        let proxy = start_proxy(&[("lobby", lobby.address())], 10).await;
        let mut client = connected_client(proxy.address, &mut lobby).await;

        lobby.send(transfer("minigames").encode());
        let closed = drive(&mut client, &mut [&mut lobby], 600, |c, _| {
            c.events.iter().any(|e| matches!(e, EndpointEvent::Disconnected))
        })
        .await;
        assert!(closed, "client should be disconnected when no backend serves the class");
        assert_eq!(online_players(&ping(proxy.address, 1).await), 0);
    }
}
