//! Pre-connection handling of the public listening socket
//!
//! Datagrams from registered peers never reach this module. For everyone
//! else the first byte is an unconnected packet id and decides between an
//! immediate answer, the start of a new session, or a silent drop.

use bytes::Bytes;
use log::{debug, warn};
use protocol::packets::{OpenConnectionRequestOne, UnconnectedPing, UnconnectedPong};
use protocol::{Endpoint, UnconnectedId};

/// What to do with a datagram from an unregistered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Send this datagram back; no state is allocated
    Reply(Bytes),
    /// Resolve a backend, create the session, then replay `request` into it
    Open {
        mtu_size: u16,
        protocol: u8,
        request: Bytes,
    },
    Drop,
}

/// Server-list status advertised in pongs
#[derive(Debug, Clone)]
pub struct Motd {
    pub line: String,
    pub sub_line: String,
    pub game_protocol: u32,
    pub game_version: String,
    pub port: u16,
}

impl Motd {
    pub fn render(&self, server_guid: i64, online: usize, max: usize) -> String {
        format!(
            "MCPE;{};{};{};{};{};{};{};Survival;1;{};{};",
            self.line,
            self.game_protocol,
            self.game_version,
            online,
            max,
            server_guid,
            self.sub_line,
            self.port,
            self.port
        )
    }
}

pub struct Dispatcher {
    server_guid: i64,
    motd: Motd,
}

impl Dispatcher {
    pub fn new(server_guid: i64, motd: Motd) -> Self {
        Self { server_guid, motd }
    }

    pub fn server_guid(&self) -> i64 {
        self.server_guid
    }

    /// Classifies a datagram from a peer with no session
    ///
    /// `online` and `max` feed the status line; `full` makes connection
    /// requests answer with a refusal.
    pub fn classify(&self, data: &Bytes, online: usize, max: usize, full: bool) -> Dispatch {
        let Some(&id) = data.first() else {
            return Dispatch::Drop;
        };

        match UnconnectedId::from_u8(id) {
            Some(UnconnectedId::Ping) | Some(UnconnectedId::PingOpenConnections) => {
                match UnconnectedPing::decode(data.clone()) {
                    Ok(ping) => Dispatch::Reply(self.pong(ping.time, online, max)),
                    Err(e) => {
                        debug!("Malformed ping: {}", e);
                        Dispatch::Drop
                    }
                }
            }
            Some(UnconnectedId::OpenConnectionRequestOne) => {
                match OpenConnectionRequestOne::decode(data.clone()) {
                    Ok(_) if full => Dispatch::Reply(Endpoint::refusal(
                        UnconnectedId::NoFreeIncomingConnections,
                        self.server_guid,
                        None,
                    )),
                    Ok(request) => Dispatch::Open {
                        mtu_size: request.mtu_size,
                        protocol: request.protocol,
                        request: data.clone(),
                    },
                    Err(e) => {
                        warn!("Malformed connection request: {}", e);
                        Dispatch::Drop
                    }
                }
            }
            _ => {
                debug!("Dropping unconnected packet 0x{:02x}", id);
                Dispatch::Drop
            }
        }
    }

    /// Builds the pong answering a ping sent at `ping_time`
    pub fn pong(&self, ping_time: i64, online: usize, max: usize) -> Bytes {
        UnconnectedPong {
            time: ping_time,
            server_guid: self.server_guid,
            motd: self.motd.render(self.server_guid, online, max),
        }
        .encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            42,
            Motd {
                line: "Relay".to_string(),
                sub_line: "lobby".to_string(),
                game_protocol: 594,
                game_version: "1.20.10".to_string(),
                port: 19132,
            },
        )
    }

    #[test]
    fn test_ping_gets_pong() {
        let ping = UnconnectedPing {
            time: 1234,
            client_guid: 9,
        }
        .encode();
        let Dispatch::Reply(reply) = dispatcher().classify(&ping, 3, 10, false) else {
            panic!("ping must be answered");
        };

        let pong = UnconnectedPong::decode(reply).unwrap();
        assert_eq!(pong.time, 1234);
        assert_eq!(pong.server_guid, 42);
        assert_eq!(
            pong.motd,
            "MCPE;Relay;594;1.20.10;3;10;42;lobby;Survival;1;19132;19132;"
        );
    }

    #[test]
    fn test_connection_request_opens_session() {
        let request = OpenConnectionRequestOne {
            protocol: 11,
            mtu_size: 1400,
        }
        .encode();
        assert_eq!(
            dispatcher().classify(&request, 0, 10, false),
            Dispatch::Open {
                mtu_size: 1400,
                protocol: 11,
                request: request.clone(),
            }
        );
    }

    #[test]
    fn test_full_proxy_refuses() {
        let request = OpenConnectionRequestOne {
            protocol: 11,
            mtu_size: 1400,
        }
        .encode();
        let Dispatch::Reply(reply) = dispatcher().classify(&request, 10, 10, true) else {
            panic!("refusal expected");
        };
        assert_eq!(reply[0], UnconnectedId::NoFreeIncomingConnections.as_u8());
    }

    #[test]
    fn test_unknown_and_malformed_dropped() {
        let d = dispatcher();
        assert_eq!(d.classify(&Bytes::new(), 0, 10, false), Dispatch::Drop);
        assert_eq!(d.classify(&Bytes::from_static(&[0x7a, 1]), 0, 10, false), Dispatch::Drop);
        assert_eq!(d.classify(&Bytes::from_static(&[0x01, 0, 0]), 0, 10, false), Dispatch::Drop);
        assert_eq!(d.classify(&Bytes::from_static(&[0x05, 0]), 0, 10, false), Dispatch::Drop);
    }
}
