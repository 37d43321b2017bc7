//! # RakNet Transport Library
//!
//! This library implements the reliable-transport layer that the relay proxy
//! speaks on both of its sides: toward real game clients and toward backend
//! game servers. It knows nothing about sockets or async runtimes; every type
//! here consumes and produces plain byte buffers.
//!
//! ## Layers
//!
//! ### Wire Codec (`codec`)
//! A cursor-based [`BinaryReader`] over [`bytes::Bytes`] and the
//! [`BinaryWriteExt`] extension trait for any [`bytes::BufMut`]:
//! - Fixed-width integers in both byte orders
//! - Zig-zag and unsigned variable-length integers
//! - 24-bit little-endian "triad" counters
//! - Length-prefixed strings and byte strings
//! - The offline-message magic and inverted-octet socket addresses
//!
//! ### Packets (`packets`, `ack`, `frame`)
//! Typed definitions of the unconnected handshake packets, the connected
//! control packets, ACK/NAK records, and the bundle/entry framing of
//! connected datagrams.
//!
//! ### Reliability (`bundler`, `reassembly`, `retention`)
//! Greedy bundling of queued packets under the MTU, fragmentation of
//! oversized packets, count-based reassembly that tolerates any arrival
//! order, and the retention map that answers NAKs with identical bytes.
//!
//! ### Endpoint (`endpoint`)
//! [`Endpoint`] ties the layers together into one peer's connection state,
//! including both sides of the three-step open-connection handshake.
//!
//! ## Usage Example
//!
//! ```rust
//! use bytes::Bytes;
//! use protocol::{Endpoint, EndpointConfig, EndpointEvent};
//!
//! let server = "127.0.0.1:19132".parse().unwrap();
//! let mut endpoint = Endpoint::connect(server, 1400, 11, 42, EndpointConfig::default());
//!
//! // The first open-connection request is ready for the socket immediately.
//! let first = endpoint.poll_transmit().unwrap();
//! assert_eq!(first[0], 0x05);
//!
//! // Application payloads wait until the handshake completes.
//! endpoint.send_payload(Bytes::from_static(&[0xfe, 0x01])).unwrap();
//! endpoint.tick();
//! assert!(endpoint.poll_transmit().is_none());
//! assert!(!matches!(endpoint.poll_event(), Some(EndpointEvent::Connected)));
//! ```

pub mod ack;
pub mod bundler;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod packets;
pub mod reassembly;
pub mod retention;

pub use ack::{AckKind, AckPacket};
pub use bundler::{bundle_packets, fragment_chunk_size, max_payload_len, BundleBatch, Outgoing};
pub use codec::{BinaryReader, BinaryWriteExt};
pub use endpoint::{ConnectionState, Endpoint, EndpointConfig, EndpointEvent, Outbound, Role};
pub use error::{CodecError, ProtocolError};
pub use frame::{Bundle, Entry, SplitInfo};
pub use packets::{ConnectedId, Reliability, UnconnectedId};
