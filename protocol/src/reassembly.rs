//! Reassembly of fragmented entries
//!
//! A record completes when every slot is filled, whatever order the fragments
//! arrived in. Completion is never inferred from seeing the last index.

use crate::codec::concat;
use crate::error::ProtocolError;
use crate::frame::SplitInfo;
use bytes::Bytes;
use std::collections::HashMap;

/// Largest split count accepted from a peer
pub const MAX_SPLIT_COUNT: u16 = 8192;

/// Largest number of fragmentation groups a peer may have in flight
pub const MAX_PENDING_GROUPS: usize = 64;

/// Slots for one fragmentation group
#[derive(Debug, Clone)]
pub struct ReassemblyRecord {
    slots: Vec<Option<Bytes>>,
    filled: usize,
    started_tick: u64,
}

impl ReassemblyRecord {
    pub fn new(split_count: u16, started_tick: u64) -> Result<Self, ProtocolError> {
        if split_count == 0 || split_count > MAX_SPLIT_COUNT {
            return Err(ProtocolError::InvalidSplitCount(split_count));
        }
        Ok(Self {
            slots: vec![None; split_count as usize],
            filled: 0,
            started_tick,
        })
    }

    pub fn split_count(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Stores a fragment; duplicates of an already-filled slot are ignored
    pub fn insert(&mut self, index: u16, payload: Bytes) -> Result<(), ProtocolError> {
        let count = self.slots.len() as u16;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(ProtocolError::SplitIndexOutOfRange {
                index,
                count,
            })?;
        if slot.is_none() {
            *slot = Some(payload);
            self.filled += 1;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Concatenates the slots in index order
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        Some(concat(self.slots.iter().flatten()))
    }
}

/// In-progress reassembly records of one endpoint, keyed by split id
#[derive(Debug, Default)]
pub struct SplitQueue {
    records: HashMap<u16, ReassemblyRecord>,
}

impl SplitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Feeds one fragment, returning the reconstructed payload once its group completes
    ///
    /// Index 0 opens a group. A non-zero index for a group that was never
    /// opened is a protocol fault.
    pub fn insert(
        &mut self,
        split: SplitInfo,
        payload: Bytes,
        now_tick: u64,
    ) -> Result<Option<Bytes>, ProtocolError> {
        if split.split_index >= split.split_count {
            return Err(ProtocolError::SplitIndexOutOfRange {
                index: split.split_index,
                count: split.split_count,
            });
        }

        if split.split_index == 0 {
            let reusable = self
                .records
                .get(&split.split_id)
                .map_or(false, |record| record.split_count() == split.split_count);
            if !reusable {
                if !self.records.contains_key(&split.split_id)
                    && self.records.len() >= MAX_PENDING_GROUPS
                {
                    return Err(ProtocolError::TooManyFragmentGroups(MAX_PENDING_GROUPS));
                }
                let record = ReassemblyRecord::new(split.split_count, now_tick)?;
                self.records.insert(split.split_id, record);
            }
        }

        let record = self
            .records
            .get_mut(&split.split_id)
            .ok_or(ProtocolError::UnknownSplitId(split.split_id))?;

        if record.split_count() != split.split_count {
            return Err(ProtocolError::SplitCountMismatch {
                split_id: split.split_id,
                announced: split.split_count,
                expected: record.split_count(),
            });
        }

        record.insert(split.split_index, payload)?;
        if !record.is_complete() {
            return Ok(None);
        }

        let assembled = record.assemble();
        self.records.remove(&split.split_id);
        Ok(assembled)
    }

    /// Drops groups older than `ttl_ticks`, returning how many were dropped
    pub fn sweep(&mut self, now_tick: u64, ttl_ticks: u64) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| now_tick.saturating_sub(record.started_tick) < ttl_ticks);
        before - self.records.len()
    }
}
