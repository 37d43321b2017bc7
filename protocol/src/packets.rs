//! Transport-level packet definitions
//!
//! Two closed sets of packet ids exist: unconnected (offline) packets whose
//! first byte is the id itself, and connected control packets that travel as
//! the payload of an encapsulated entry. Anything outside these sets is an
//! application payload and is handed to the next layer untouched.

use crate::codec::{BinaryReader, BinaryWriteExt};
use crate::error::{CodecError, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Number of system addresses carried in connection acceptance packets
pub const SYSTEM_ADDRESS_COUNT: usize = 20;

/// Bytes of IP and UDP header counted into the negotiated MTU
pub const UDP_HEADER_OVERHEAD: usize = 28;

pub const MIN_MTU_SIZE: u16 = 576;
pub const MAX_MTU_SIZE: u16 = 1492;

/// Datagram flag bits for connected traffic
pub mod flags {
    pub const VALID: u8 = 0x80;
    pub const ACK: u8 = 0x40;
    pub const NAK: u8 = 0x20;
}

/// Ids of packets sent before a connection exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnconnectedId {
    Ping,
    PingOpenConnections,
    Pong,
    OpenConnectionRequestOne,
    OpenConnectionReplyOne,
    OpenConnectionRequestTwo,
    OpenConnectionReplyTwo,
    NoFreeIncomingConnections,
    IncompatibleProtocolVersion,
}

impl UnconnectedId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::PingOpenConnections),
            0x1c => Some(Self::Pong),
            0x05 => Some(Self::OpenConnectionRequestOne),
            0x06 => Some(Self::OpenConnectionReplyOne),
            0x07 => Some(Self::OpenConnectionRequestTwo),
            0x08 => Some(Self::OpenConnectionReplyTwo),
            0x14 => Some(Self::NoFreeIncomingConnections),
            0x19 => Some(Self::IncompatibleProtocolVersion),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ping => 0x01,
            Self::PingOpenConnections => 0x02,
            Self::Pong => 0x1c,
            Self::OpenConnectionRequestOne => 0x05,
            Self::OpenConnectionReplyOne => 0x06,
            Self::OpenConnectionRequestTwo => 0x07,
            Self::OpenConnectionReplyTwo => 0x08,
            Self::NoFreeIncomingConnections => 0x14,
            Self::IncompatibleProtocolVersion => 0x19,
        }
    }
}

/// Ids of control packets carried inside bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectedId {
    ConnectedPing,
    ConnectedPong,
    ConnectionRequest,
    ConnectionRequestAccepted,
    NewIncomingConnection,
    DisconnectionNotification,
}

impl ConnectedId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::ConnectedPing),
            0x03 => Some(Self::ConnectedPong),
            0x09 => Some(Self::ConnectionRequest),
            0x10 => Some(Self::ConnectionRequestAccepted),
            0x13 => Some(Self::NewIncomingConnection),
            0x15 => Some(Self::DisconnectionNotification),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::ConnectedPing => 0x00,
            Self::ConnectedPong => 0x03,
            Self::ConnectionRequest => 0x09,
            Self::ConnectionRequestAccepted => 0x10,
            Self::NewIncomingConnection => 0x13,
            Self::DisconnectionNotification => 0x15,
        }
    }
}

/// Delivery class of an encapsulated entry, stored in the top three bits of its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    Unreliable,
    UnreliableSequenced,
    Reliable,
    #[default]
    ReliableOrdered,
    ReliableSequenced,
    UnreliableWithAck,
    ReliableWithAck,
    ReliableOrderedWithAck,
}

impl Reliability {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Self::Unreliable,
            1 => Self::UnreliableSequenced,
            2 => Self::Reliable,
            3 => Self::ReliableOrdered,
            4 => Self::ReliableSequenced,
            5 => Self::UnreliableWithAck,
            6 => Self::ReliableWithAck,
            _ => Self::ReliableOrderedWithAck,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

fn unconnected_header(id: UnconnectedId, capacity: usize) -> BytesMut {
    let mut out = BytesMut::with_capacity(capacity);
    out.put_u8(id.as_u8());
    out
}

fn expect_id(r: &mut BinaryReader, id: u8) -> Result<(), ProtocolError> {
    let found = r.read_u8()?;
    if found != id {
        return Err(ProtocolError::UnexpectedPacket(found));
    }
    Ok(())
}

fn placeholder_addresses() -> [SocketAddr; SYSTEM_ADDRESS_COUNT] {
    [SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0); SYSTEM_ADDRESS_COUNT]
}

fn skip_addresses(r: &mut BinaryReader) -> Result<(), CodecError> {
    // Some implementations send fewer than twenty addresses; stop at the trailing timestamps.
    for _ in 0..SYSTEM_ADDRESS_COUNT {
        if r.remaining() <= 16 {
            break;
        }
        r.read_address()?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub time: i64,
    pub client_guid: i64,
}

impl UnconnectedPing {
    pub fn encode(&self) -> Bytes {
        let mut out = unconnected_header(UnconnectedId::Ping, 33);
        out.put_i64(self.time);
        out.put_magic();
        out.put_i64(self.client_guid);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        r.read_u8()?;
        let time = r.read_i64_be()?;
        r.read_magic()?;
        // Older clients omit the guid.
        let client_guid = if r.remaining() >= 8 { r.read_i64_be()? } else { 0 };
        Ok(Self { time, client_guid })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub time: i64,
    pub server_guid: i64,
    pub motd: String,
}

impl UnconnectedPong {
    pub fn encode(&self) -> Bytes {
        let mut out = unconnected_header(UnconnectedId::Pong, 35 + self.motd.len());
        out.put_i64(self.time);
        out.put_i64(self.server_guid);
        out.put_magic();
        out.put_short_string(&self.motd);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, UnconnectedId::Pong.as_u8())?;
        let time = r.read_i64_be()?;
        let server_guid = r.read_i64_be()?;
        r.read_magic()?;
        let motd = r.read_short_string()?;
        Ok(Self {
            time,
            server_guid,
            motd,
        })
    }
}

/// First open-connection request; its padded length announces the client's MTU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequestOne {
    pub protocol: u8,
    pub mtu_size: u16,
}

impl OpenConnectionRequestOne {
    pub fn encode(&self) -> Bytes {
        let datagram_len = (self.mtu_size as usize).saturating_sub(UDP_HEADER_OVERHEAD);
        let mut out = unconnected_header(UnconnectedId::OpenConnectionRequestOne, datagram_len);
        out.put_magic();
        out.put_u8(self.protocol);
        let padding = datagram_len.saturating_sub(out.len());
        out.put_bytes(0, padding);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let datagram_len = data.len();
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, UnconnectedId::OpenConnectionRequestOne.as_u8())?;
        r.read_magic()?;
        let protocol = r.read_u8()?;
        let mtu = (datagram_len + UDP_HEADER_OVERHEAD).clamp(MIN_MTU_SIZE as usize, MAX_MTU_SIZE as usize);
        Ok(Self {
            protocol,
            mtu_size: mtu as u16,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReplyOne {
    pub server_guid: i64,
    pub mtu_size: u16,
}

impl OpenConnectionReplyOne {
    pub fn encode(&self) -> Bytes {
        let mut out = unconnected_header(UnconnectedId::OpenConnectionReplyOne, 28);
        out.put_magic();
        out.put_i64(self.server_guid);
        out.put_bool(false);
        out.put_u16(self.mtu_size);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, UnconnectedId::OpenConnectionReplyOne.as_u8())?;
        r.read_magic()?;
        let server_guid = r.read_i64_be()?;
        r.read_bool()?;
        let mtu_size = r.read_u16_be()?;
        Ok(Self {
            server_guid,
            mtu_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequestTwo {
    pub server_address: SocketAddr,
    pub mtu_size: u16,
    pub client_guid: i64,
}

impl OpenConnectionRequestTwo {
    pub fn encode(&self) -> Bytes {
        let mut out = unconnected_header(UnconnectedId::OpenConnectionRequestTwo, 34);
        out.put_magic();
        out.put_address(&self.server_address);
        out.put_u16(self.mtu_size);
        out.put_i64(self.client_guid);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, UnconnectedId::OpenConnectionRequestTwo.as_u8())?;
        r.read_magic()?;
        let server_address = r.read_address()?;
        let mtu_size = r.read_u16_be()?;
        let client_guid = r.read_i64_be()?;
        Ok(Self {
            server_address,
            mtu_size,
            client_guid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReplyTwo {
    pub server_guid: i64,
    pub client_address: SocketAddr,
    pub mtu_size: u16,
}

impl OpenConnectionReplyTwo {
    pub fn encode(&self) -> Bytes {
        let mut out = unconnected_header(UnconnectedId::OpenConnectionReplyTwo, 35);
        out.put_magic();
        out.put_i64(self.server_guid);
        out.put_address(&self.client_address);
        out.put_u16(self.mtu_size);
        out.put_bool(false);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, UnconnectedId::OpenConnectionReplyTwo.as_u8())?;
        r.read_magic()?;
        let server_guid = r.read_i64_be()?;
        let client_address = r.read_address()?;
        let mtu_size = r.read_u16_be()?;
        Ok(Self {
            server_guid,
            client_address,
            mtu_size,
        })
    }
}

/// Refusal sent when the listener is at capacity or the protocol is unsupported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRefusal {
    pub reason: UnconnectedId,
    pub server_guid: i64,
    pub protocol: Option<u8>,
}

impl ConnectionRefusal {
    pub fn encode(&self) -> Bytes {
        let mut out = unconnected_header(self.reason, 26);
        if let Some(protocol) = self.protocol {
            out.put_u8(protocol);
        }
        out.put_magic();
        out.put_i64(self.server_guid);
        out.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_guid: i64,
    pub time: i64,
}

impl ConnectionRequest {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(18);
        out.put_u8(ConnectedId::ConnectionRequest.as_u8());
        out.put_i64(self.client_guid);
        out.put_i64(self.time);
        out.put_bool(false);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, ConnectedId::ConnectionRequest.as_u8())?;
        let client_guid = r.read_i64_be()?;
        let time = r.read_i64_be()?;
        Ok(Self { client_guid, time })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub request_time: i64,
    pub time: i64,
}

impl ConnectionRequestAccepted {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(160);
        out.put_u8(ConnectedId::ConnectionRequestAccepted.as_u8());
        out.put_address(&self.client_address);
        out.put_u16(0);
        for addr in placeholder_addresses().iter() {
            out.put_address(addr);
        }
        out.put_i64(self.request_time);
        out.put_i64(self.time);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, ConnectedId::ConnectionRequestAccepted.as_u8())?;
        let client_address = r.read_address()?;
        r.read_u16_be()?;
        skip_addresses(&mut r)?;
        let request_time = r.read_i64_be()?;
        let time = r.read_i64_be()?;
        Ok(Self {
            client_address,
            request_time,
            time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncomingConnection {
    pub server_address: SocketAddr,
    pub request_time: i64,
    pub time: i64,
}

impl NewIncomingConnection {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(160);
        out.put_u8(ConnectedId::NewIncomingConnection.as_u8());
        out.put_address(&self.server_address);
        for addr in placeholder_addresses().iter() {
            out.put_address(addr);
        }
        out.put_i64(self.request_time);
        out.put_i64(self.time);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, ConnectedId::NewIncomingConnection.as_u8())?;
        let server_address = r.read_address()?;
        skip_addresses(&mut r)?;
        let request_time = r.read_i64_be()?;
        let time = r.read_i64_be()?;
        Ok(Self {
            server_address,
            request_time,
            time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPing {
    pub time: i64,
}

impl ConnectedPing {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(9);
        out.put_u8(ConnectedId::ConnectedPing.as_u8());
        out.put_i64(self.time);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, ConnectedId::ConnectedPing.as_u8())?;
        Ok(Self {
            time: r.read_i64_be()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPong {
    pub ping_time: i64,
    pub pong_time: i64,
}

impl ConnectedPong {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(17);
        out.put_u8(ConnectedId::ConnectedPong.as_u8());
        out.put_i64(self.ping_time);
        out.put_i64(self.pong_time);
        out.freeze()
    }
}

pub fn disconnection_notification() -> Bytes {
    Bytes::from_static(&[0x15])
}
