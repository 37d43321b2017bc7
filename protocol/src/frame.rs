//! Bundle and encapsulated-entry framing
//!
//! A bundle is one connected datagram: `[flags][sequence:triad][entries...]`.
//! Each entry is `[reliability << 5 | split flag][split descriptor?][len:varint][payload]`
//! where the split descriptor is three big-endian u16s: id, count, index.

use crate::codec::{var_u32_len, BinaryReader, BinaryWriteExt};
use crate::error::ProtocolError;
use crate::packets::{flags, Reliability};
use bytes::{BufMut, Bytes, BytesMut};

/// Flag byte and sequence triad preceding the entries of a bundle
pub const BUNDLE_HEADER_LEN: usize = 4;

/// Size of the split descriptor when present
pub const SPLIT_DESCRIPTOR_LEN: usize = 6;

const SPLIT_FLAG: u8 = 0x10;

/// Fragmentation group membership of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub split_id: u16,
    pub split_count: u16,
    pub split_index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub reliability: Reliability,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(reliability: Reliability, payload: Bytes) -> Self {
        Self {
            reliability,
            split: None,
            payload,
        }
    }

    /// Application packet type id, the first byte of the payload
    pub fn packet_id(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.payload.len(), self.split.is_some())
    }

    pub fn encoded_len_for(payload_len: usize, split: bool) -> usize {
        let descriptor = if split { SPLIT_DESCRIPTOR_LEN } else { 0 };
        1 + descriptor + var_u32_len(payload_len as u32) + payload_len
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        let mut header = self.reliability.bits() << 5;
        if self.split.is_some() {
            header |= SPLIT_FLAG;
        }
        out.put_u8(header);
        if let Some(split) = self.split {
            out.put_u16(split.split_id);
            out.put_u16(split.split_count);
            out.put_u16(split.split_index);
        }
        out.put_byte_string(&self.payload);
    }

    pub fn decode(r: &mut BinaryReader) -> Result<Self, ProtocolError> {
        let header = r.read_u8()?;
        let reliability = Reliability::from_bits(header >> 5);
        let split = if header & SPLIT_FLAG != 0 {
            Some(SplitInfo {
                split_id: r.read_u16_be()?,
                split_count: r.read_u16_be()?,
                split_index: r.read_u16_be()?,
            })
        } else {
            None
        };
        let payload = r.read_byte_string()?;
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        Ok(Self {
            reliability,
            split,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub sequence_number: u32,
    pub entries: Vec<Entry>,
}

impl Bundle {
    pub fn encoded_len(&self) -> usize {
        BUNDLE_HEADER_LEN + self.entries.iter().map(Entry::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_u8(flags::VALID);
        out.put_triad(self.sequence_number);
        for entry in &self.entries {
            entry.encode_into(&mut out);
        }
        out.freeze()
    }

    /// Decodes a connected datagram, reading entries until the buffer is exhausted
    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        r.read_u8()?;
        let sequence_number = r.read_triad()?;
        let mut entries = Vec::new();
        while !r.is_exhausted() {
            entries.push(Entry::decode(&mut r)?);
        }
        Ok(Self {
            sequence_number,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_layout() {
        let bundle = Bundle {
            sequence_number: 3,
            entries: vec![Entry::new(Reliability::ReliableOrdered, Bytes::from_static(&[0xfe, 1]))],
        };
        let encoded = bundle.encode();
        assert_eq!(&encoded[..], &[0x80, 3, 0, 0, 0x60, 2, 0xfe, 1]);
        assert_eq!(encoded.len(), bundle.encoded_len());
        assert_eq!(Bundle::decode(encoded).unwrap(), bundle);
    }

    #[test]
    fn test_split_entry_layout() {
        let entry = Entry {
            reliability: Reliability::Reliable,
            split: Some(SplitInfo {
                split_id: 0x0102,
                split_count: 3,
                split_index: 2,
            }),
            payload: Bytes::from_static(b"abc"),
        };
        let mut out = BytesMut::new();
        entry.encode_into(&mut out);
        assert_eq!(&out[..7], &[0x50, 0x01, 0x02, 0x00, 0x03, 0x00, 0x02]);
        assert_eq!(out.len(), entry.encoded_len());

        let mut r = BinaryReader::new(out.freeze());
        assert_eq!(Entry::decode(&mut r).unwrap(), entry);
    }

    #[test]
    fn test_multiple_entries_until_exhausted() {
        let bundle = Bundle {
            sequence_number: 0x00ff_fffe,
            entries: (1..=4u8)
                .map(|i| Entry::new(Reliability::Unreliable, Bytes::from(vec![i; i as usize])))
                .collect(),
        };
        let decoded = Bundle::decode(bundle.encode()).unwrap();
        assert_eq!(decoded.entries.len(), 4);
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn test_truncated_entry_is_error() {
        let mut encoded = BytesMut::from(
            &Bundle {
                sequence_number: 1,
                entries: vec![Entry::new(Reliability::Reliable, Bytes::from_static(b"hello"))],
            }
            .encode()[..],
        );
        encoded.truncate(encoded.len() - 2);
        assert!(Bundle::decode(encoded.freeze()).is_err());
    }

    #[test]
    fn test_empty_payload_rejected() {
        let raw = Bytes::from_static(&[0x80, 0, 0, 0, 0x60, 0x00]);
        assert_eq!(Bundle::decode(raw), Err(ProtocolError::EmptyPayload));
    }
}
