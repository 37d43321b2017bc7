//! # RakNet Relay Proxy
//!
//! This library implements a UDP relay that sits between game clients and a
//! pool of backend game servers. Clients believe they are talking to one
//! server; behind the proxy their session can be moved from backend to
//! backend without the client ever reconnecting.
//!
//! ## Core Responsibilities
//!
//! ### Pre-connection Handling
//! Unconnected pings are answered with a status line carrying the live player
//! count, and open-connection requests start a backend lookup. Nothing is
//! allocated for a peer until a backend is known.
//!
//! ### Relaying
//! Each registered peer owns a client-facing endpoint and a server-facing
//! endpoint. Application payloads are forwarded between them; transport
//! bookkeeping (sequence numbers, ACKs, fragmentation) stays independent on
//! the two sides.
//!
//! ### Hand-off
//! A backend may ask for a peer to be transferred to another service class.
//! The proxy masks the switch with a dimension change on the client, resolves
//! the new backend, resumes the login there and keeps the client-facing
//! sequence space untouched.
//!
//! ## Module Organization
//!
//! ### Dispatcher (`dispatcher`)
//! Classifies datagrams from unregistered peers into a reply, a new session,
//! or a drop.
//!
//! ### Peer Registry (`registry`)
//! Tracks registered sessions and in-flight lookups per client address and
//! enforces the player cap.
//!
//! ### Session (`session`) and Control Packets (`control`)
//! The per-peer relay state machine and the relay control messages exchanged
//! with backends.
//!
//! ### Discovery (`discovery`)
//! The [`Discovery`] trait mapping a service class to a backend address.
//!
//! ### Network (`network`)
//! [`ProxyServer`]: sockets, receiver and sender tasks, and the tick loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use proxy::{ProxyConfig, ProxyServer, StaticDiscovery};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig {
//!         bind_address: "0.0.0.0:19132".parse()?,
//!         ..ProxyConfig::default()
//!     };
//!     let discovery = StaticDiscovery::default().with_backend("lobby", "10.0.0.5:19133".parse()?);
//!
//!     // Runs until the process is stopped:
//!     // - answers pings and admits new peers
//!     // - relays payloads between clients and their backends
//!     // - performs hand-offs requested by backends
//!     // - drops peers that go idle
//!     let mut server = ProxyServer::bind(config, Arc::new(discovery)).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod network;
pub mod registry;
pub mod session;

pub use config::{Args, ProxyConfig};
pub use control::{ContextChange, ControlPacket, ResumeLogin, Segment, SegmentReassembler, Transfer};
pub use discovery::{resolve_within, Discovery, StaticDiscovery};
pub use dispatcher::{Dispatch, Dispatcher, Motd};
pub use error::{DiscoveryError, ProxyError};
pub use network::ProxyServer;
pub use registry::{Admission, PeerRegistry};
pub use session::{CloseReason, Session, SessionAction};
