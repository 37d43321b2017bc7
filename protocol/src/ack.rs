//! ACK and NAK datagrams
//!
//! Both share one layout: a flag byte, a big-endian record count, then
//! records that are either a single triad or an inclusive `start..=end`
//! range. Runs of consecutive sequence numbers are compressed into ranges on
//! encode.

use crate::codec::{next_triad, BinaryReader, BinaryWriteExt, TRIAD_MAX};
use crate::error::ProtocolError;
use crate::packets::flags;
use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on sequence numbers expanded from one datagram
pub const MAX_ACK_SEQUENCES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nak,
}

impl AckKind {
    fn flag_byte(self) -> u8 {
        match self {
            AckKind::Ack => flags::VALID | flags::ACK,
            AckKind::Nak => flags::VALID | flags::NAK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub kind: AckKind,
    pub sequences: Vec<u32>,
}

impl AckPacket {
    pub fn ack(sequences: Vec<u32>) -> Self {
        Self {
            kind: AckKind::Ack,
            sequences,
        }
    }

    pub fn nak(sequences: Vec<u32>) -> Self {
        Self {
            kind: AckKind::Nak,
            sequences,
        }
    }

    /// Encodes the packet; the record count must fit its 16-bit field
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let records = compress(&self.sequences);
        let count = u16::try_from(records.len())
            .map_err(|_| ProtocolError::TooManyAckRecords(records.len()))?;
        let mut out = BytesMut::with_capacity(3 + records.len() * 7);
        out.put_u8(self.kind.flag_byte());
        out.put_u16(count);
        for (start, end) in records {
            if start == end {
                out.put_bool(true);
                out.put_triad(start);
            } else {
                out.put_bool(false);
                out.put_triad(start);
                out.put_triad(end);
            }
        }
        Ok(out.freeze())
    }

    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        let flag = r.read_u8()?;
        let kind = if flag & flags::ACK != 0 {
            AckKind::Ack
        } else if flag & flags::NAK != 0 {
            AckKind::Nak
        } else {
            return Err(ProtocolError::UnexpectedPacket(flag));
        };

        let count = r.read_u16_be()?;
        let mut sequences = Vec::new();
        for _ in 0..count {
            let single = r.read_bool()?;
            let start = r.read_triad()?;
            let end = if single { start } else { r.read_triad()? };

            let mut current = start;
            loop {
                if sequences.len() >= MAX_ACK_SEQUENCES {
                    break;
                }
                sequences.push(current);
                if current == end {
                    break;
                }
                current = next_triad(current);
            }
        }
        Ok(Self { kind, sequences })
    }
}

/// Groups sequence numbers into inclusive ranges of consecutive values
fn compress(sequences: &[u32]) -> Vec<(u32, u32)> {
    let mut sorted: Vec<u32> = sequences.iter().map(|s| s & TRIAD_MAX).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut records: Vec<(u32, u32)> = Vec::new();
    for seq in sorted {
        match records.last_mut() {
            Some((_, end)) if *end + 1 == seq => *end = seq,
            _ => records.push((seq, seq)),
        }
    }
    records
}
