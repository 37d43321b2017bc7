//! Relay control packets
//!
//! These ride inside ordinary application payloads, after transport
//! reassembly. Backends use them to drive hand-offs; the proxy uses them to
//! re-admit a migrated session and to mask the reconnection on the client.

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;
use protocol::codec::{BinaryReader, BinaryWriteExt};
use protocol::reassembly::ReassemblyRecord;
use protocol::ProtocolError;
use std::collections::HashMap;
use std::net::SocketAddr;

pub const SEGMENT: u8 = 0xf0;
pub const TRANSFER: u8 = 0xf1;
pub const RESUME_LOGIN: u8 = 0xf2;
pub const CONTEXT_CHANGE: u8 = 0xf3;

/// Dimension the client is moved to while a hand-off is in progress
pub const TRANSITION_DIMENSION: i32 = 1;

/// A relay control packet, dispatched by its first byte
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPacket {
    Segment(Segment),
    Transfer(Transfer),
    ResumeLogin(ResumeLogin),
    ContextChange(ContextChange),
}

impl ControlPacket {
    /// Decodes `payload`, or returns `None` when it is not a control packet
    pub fn decode(payload: Bytes) -> Result<Option<Self>, ProtocolError> {
        let packet = match payload.first().copied() {
            Some(SEGMENT) => Self::Segment(Segment::decode(payload)?),
            Some(TRANSFER) => Self::Transfer(Transfer::decode(payload)?),
            Some(RESUME_LOGIN) => Self::ResumeLogin(ResumeLogin::decode(payload)?),
            Some(CONTEXT_CHANGE) => Self::ContextChange(ContextChange::decode(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Segment(p) => p.encode(),
            Self::Transfer(p) => p.encode(),
            Self::ResumeLogin(p) => p.encode(),
            Self::ContextChange(p) => p.encode(),
        }
    }
}

fn expect_id(r: &mut BinaryReader, id: u8) -> Result<(), ProtocolError> {
    let found = r.read_u8()?;
    if found != id {
        return Err(ProtocolError::UnexpectedPacket(found));
    }
    Ok(())
}

/// One piece of a control message too large for a single payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub group: u8,
    pub count: u16,
    pub index: u16,
    pub data: Bytes,
}

impl Segment {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(6 + self.data.len());
        out.put_u8(SEGMENT);
        out.put_u8(self.group);
        out.put_u16(self.count);
        out.put_u16(self.index);
        out.put_slice(&self.data);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, SEGMENT)?;
        Ok(Self {
            group: r.read_u8()?,
            count: r.read_u16_be()?,
            index: r.read_u16_be()?,
            data: r.read_remaining(),
        })
    }

    /// Cuts `message` into segments of at most `max` bytes each
    pub fn split(group: u8, message: &Bytes, max: usize) -> Vec<Segment> {
        let chunks = protocol::codec::split_chunks(message, max);
        let count = chunks.len() as u16;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, data)| Segment {
                group,
                count,
                index: index as u16,
                data,
            })
            .collect()
    }
}

/// Request from a backend to move the session to another service class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub service_class: String,
    pub client_id: u64,
    pub sequence_number: u32,
    pub login_data: Bytes,
}

impl Transfer {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(TRANSFER);
        out.put_string(&self.service_class);
        out.put_var_u64(self.client_id);
        out.put_var_u32(self.sequence_number);
        out.put_byte_string(&self.login_data);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, TRANSFER)?;
        Ok(Self {
            service_class: r.read_string()?,
            client_id: r.read_var_u64()?,
            sequence_number: r.read_var_u32()?,
            login_data: r.read_byte_string()?,
        })
    }
}

/// Sent to the new backend so it re-admits a migrated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeLogin {
    pub client_address: SocketAddr,
    pub mtu_size: u16,
    pub client_id: u64,
    pub sequence_number: u32,
    pub login_data: Bytes,
}

impl ResumeLogin {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(RESUME_LOGIN);
        out.put_address(&self.client_address);
        out.put_u16_le(self.mtu_size);
        out.put_var_u64(self.client_id);
        out.put_var_u32(self.sequence_number);
        out.put_byte_string(&self.login_data);
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, RESUME_LOGIN)?;
        Ok(Self {
            client_address: r.read_address()?,
            mtu_size: r.read_u16_le()?,
            client_id: r.read_var_u64()?,
            sequence_number: r.read_var_u32()?,
            login_data: r.read_byte_string()?,
        })
    }
}

/// Tells the client to switch dimension, which covers the reconnection with a loading screen
#[derive(Debug, Clone, PartialEq)]
pub struct ContextChange {
    pub dimension: i32,
    pub position: [f32; 3],
}

impl ContextChange {
    pub fn transition() -> Self {
        Self {
            dimension: TRANSITION_DIMENSION,
            position: [0.0; 3],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(18);
        out.put_u8(CONTEXT_CHANGE);
        out.put_var_i32(self.dimension);
        for axis in self.position {
            out.put_f32_le(axis);
        }
        out.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        expect_id(&mut r, CONTEXT_CHANGE)?;
        let dimension = r.read_var_i32()?;
        let position = [r.read_f32_le()?, r.read_f32_le()?, r.read_f32_le()?];
        Ok(Self {
            dimension,
            position,
        })
    }
}

/// Reassembles segmented control messages, one record per group id
#[derive(Debug, Default)]
pub struct SegmentReassembler {
    groups: HashMap<u8, ReassemblyRecord>,
}

impl SegmentReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Stores a segment, returning the whole message once its group is complete
    ///
    /// A segment announcing a different count than its group restarts that group.
    pub fn insert(&mut self, segment: Segment) -> Result<Option<Bytes>, ProtocolError> {
        let stale = self
            .groups
            .get(&segment.group)
            .map_or(false, |record| record.split_count() != segment.count);
        if stale {
            warn!(
                "Segment group {} restarted with count {}",
                segment.group, segment.count
            );
            self.groups.remove(&segment.group);
        }

        let record = match self.groups.entry(segment.group) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(ReassemblyRecord::new(segment.count, 0)?)
            }
        };
        record.insert(segment.index, segment.data)?;

        if !record.is_complete() {
            return Ok(None);
        }
        let message = record.assemble();
        self.groups.remove(&segment.group);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn transfer() -> Transfer {
        Transfer {
            service_class: "survival".to_string(),
            client_id: 0x1234_5678_9abc,
            sequence_number: 77,
            login_data: Bytes::from(vec![7u8; 300]),
        }
    }

    #[test]
    fn test_transfer_decodes() {
        let encoded = transfer().encode();
        assert_eq!(encoded[0], TRANSFER);
        assert_eq!(
            ControlPacket::decode(encoded).unwrap(),
            Some(ControlPacket::Transfer(transfer()))
        );
    }

    #[test]
    fn test_resume_login_layout() {
        let resume = ResumeLogin {
            client_address: "192.168.1.20:50123".parse().unwrap(),
            mtu_size: 1400,
            client_id: 5,
            sequence_number: 9,
            login_data: Bytes::from_static(b"login"),
        };
        let encoded = resume.encode();
        assert_eq!(encoded[0], RESUME_LOGIN);
        assert_eq!(encoded[1], 4);
        assert_eq!(encoded[2], !192u8);
        assert_eq!(&encoded[8..10], &1400u16.to_le_bytes());
        assert_eq!(ResumeLogin::decode(encoded).unwrap(), resume);
    }

    #[test]
    fn test_context_change_floats() {
        let change = ContextChange {
            dimension: -1,
            position: [1.5, -64.0, 1e6],
        };
        let decoded = ContextChange::decode(change.encode()).unwrap();
        assert_eq!(decoded.dimension, -1);
        for (a, b) in decoded.position.iter().zip(change.position.iter()) {
            assert_approx_eq!(*a, *b);
        }
    }

    #[test]
    fn test_application_payload_is_not_control() {
        assert_eq!(
            ControlPacket::decode(Bytes::from_static(&[0xfe, 1, 2])).unwrap(),
            None
        );
    }

    #[test]
    fn test_truncated_transfer_is_error() {
        let encoded = transfer().encode();
        assert!(ControlPacket::decode(encoded.slice(..10)).is_err());
    }

    #[test]
    fn test_segments_reassemble_in_any_order() {
        let message = transfer().encode();
        let mut segments = Segment::split(3, &message, 64);
        assert_eq!(segments.len(), (message.len() + 63) / 64);
        segments.reverse();

        let mut reassembler = SegmentReassembler::new();
        let last = segments.pop().unwrap();
        for segment in segments {
            let decoded = Segment::decode(segment.encode()).unwrap();
            assert_eq!(reassembler.insert(decoded).unwrap(), None);
        }
        assert_eq!(reassembler.insert(last).unwrap(), Some(message));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_segment_count_change_restarts_group() {
        let mut reassembler = SegmentReassembler::new();
        let first = Segment {
            group: 1,
            count: 3,
            index: 0,
            data: Bytes::from_static(b"old"),
        };
        reassembler.insert(first).unwrap();

        let restarted = |index, data| Segment {
            group: 1,
            count: 2,
            index,
            data: Bytes::from_static(data),
        };
        assert_eq!(reassembler.insert(restarted(1, b"cd")).unwrap(), None);
        assert_eq!(
            reassembler.insert(restarted(0, b"ab")).unwrap(),
            Some(Bytes::from_static(b"abcd"))
        );
    }

    #[test]
    fn test_segment_index_out_of_range() {
        let mut reassembler = SegmentReassembler::new();
        let segment = Segment {
            group: 0,
            count: 2,
            index: 5,
            data: Bytes::from_static(b"x"),
        };
        assert!(reassembler.insert(segment).is_err());
    }
}
