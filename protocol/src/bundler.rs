//! Bundling and fragmentation of outbound application packets
//!
//! Consecutive packets are packed greedily into one bundle while the encoded
//! datagram stays within the MTU. The negotiated MTU counts the IP and UDP
//! headers, so a bundle gets `mtu - UDP_HEADER_OVERHEAD` bytes. A packet that cannot fit in a datagram on
//! its own is cut into fragments sharing a fresh split id, each fragment
//! travelling alone in its own bundle. Every bundle consumes one sequence
//! number.

use crate::codec::{next_triad, split_chunks, var_u32_len};
use crate::error::ProtocolError;
use crate::frame::{Bundle, Entry, SplitInfo, BUNDLE_HEADER_LEN, SPLIT_DESCRIPTOR_LEN};
use crate::packets::{Reliability, UDP_HEADER_OVERHEAD};
use bytes::Bytes;

/// An application packet waiting in an endpoint's send queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub reliability: Reliability,
    pub payload: Bytes,
}

impl Outgoing {
    pub fn new(payload: Bytes) -> Self {
        Self {
            reliability: Reliability::ReliableOrdered,
            payload,
        }
    }

    pub fn with_reliability(reliability: Reliability, payload: Bytes) -> Self {
        Self {
            reliability,
            payload,
        }
    }
}

/// Result of bundling one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleBatch {
    pub bundles: Vec<Bundle>,
    pub next_sequence: u32,
    pub next_split_id: u16,
}

/// Bytes available to one encoded bundle under a negotiated `mtu`
pub fn datagram_budget(mtu: usize) -> usize {
    mtu.saturating_sub(UDP_HEADER_OVERHEAD)
}

/// Largest fragment payload such that a single-fragment bundle fits in `mtu`
pub fn fragment_chunk_size(mtu: usize) -> usize {
    let budget = datagram_budget(mtu);
    let overhead = BUNDLE_HEADER_LEN + 1 + SPLIT_DESCRIPTOR_LEN + var_u32_len(budget as u32);
    budget.saturating_sub(overhead)
}

/// Largest payload that can be sent at all under `mtu`
pub fn max_payload_len(mtu: usize) -> usize {
    fragment_chunk_size(mtu) * u16::MAX as usize
}

fn fits_unsplit(payload_len: usize, mtu: usize) -> bool {
    BUNDLE_HEADER_LEN + Entry::encoded_len_for(payload_len, false) <= datagram_budget(mtu)
}

fn close_bundle(entries: &mut Vec<Entry>, len: &mut usize, sequence: &mut u32, out: &mut Vec<Bundle>) {
    if entries.is_empty() {
        return;
    }
    out.push(Bundle {
        sequence_number: *sequence,
        entries: std::mem::take(entries),
    });
    *sequence = next_triad(*sequence);
    *len = BUNDLE_HEADER_LEN;
}

/// Packs `packets` into bundles, starting at `sequence` and `split_id`
///
/// Both counters wrap at their wire width: 24 bits for sequence numbers,
/// 16 bits for split ids.
pub fn bundle_packets(
    packets: impl IntoIterator<Item = Outgoing>,
    sequence: u32,
    split_id: u16,
    mtu: usize,
) -> Result<BundleBatch, ProtocolError> {
    let chunk_size = fragment_chunk_size(mtu);
    let budget = datagram_budget(mtu);
    if chunk_size == 0 {
        return Err(ProtocolError::PayloadTooLarge { size: 0, mtu });
    }

    let mut bundles = Vec::new();
    let mut next_sequence = sequence;
    let mut next_split_id = split_id;

    let mut current: Vec<Entry> = Vec::new();
    let mut current_len = BUNDLE_HEADER_LEN;

    for packet in packets {
        if packet.payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }

        if !fits_unsplit(packet.payload.len(), mtu) {
            close_bundle(&mut current, &mut current_len, &mut next_sequence, &mut bundles);

            let chunks = split_chunks(&packet.payload, chunk_size);
            if chunks.len() > u16::MAX as usize {
                return Err(ProtocolError::PayloadTooLarge {
                    size: packet.payload.len(),
                    mtu,
                });
            }

            let split_count = chunks.len() as u16;
            for (index, chunk) in chunks.into_iter().enumerate() {
                let entry = Entry {
                    reliability: packet.reliability,
                    split: Some(SplitInfo {
                        split_id: next_split_id,
                        split_count,
                        split_index: index as u16,
                    }),
                    payload: chunk,
                };
                bundles.push(Bundle {
                    sequence_number: next_sequence,
                    entries: vec![entry],
                });
                next_sequence = next_triad(next_sequence);
            }
            next_split_id = next_split_id.wrapping_add(1);
            continue;
        }

        let entry = Entry::new(packet.reliability, packet.payload);
        let entry_len = entry.encoded_len();
        if current_len + entry_len > budget {
            close_bundle(&mut current, &mut current_len, &mut next_sequence, &mut bundles);
        }
        current_len += entry_len;
        current.push(entry);
    }
    close_bundle(&mut current, &mut current_len, &mut next_sequence, &mut bundles);

    Ok(BundleBatch {
        bundles,
        next_sequence,
        next_split_id,
    })
}
