//! Retained bundles awaiting acknowledgment
//!
//! Encoded bundles are kept by sequence number so a NAK can be answered with
//! the identical bytes. Entries leave on ACK, on age (TTL sweep) or when the
//! map grows past its capacity, oldest first.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
struct Retained {
    bytes: Bytes,
    sent_tick: u64,
}

#[derive(Debug)]
pub struct RetentionMap {
    entries: HashMap<u32, Retained>,
    // Insertion order; stale pairs left behind by ACKs are skipped lazily.
    order: VecDeque<(u32, u64)>,
    capacity: usize,
}

impl RetentionMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn get(&self, sequence: u32) -> Option<&Bytes> {
        self.entries.get(&sequence).map(|r| &r.bytes)
    }

    pub fn insert(&mut self, sequence: u32, bytes: Bytes, sent_tick: u64) {
        self.entries.insert(sequence, Retained { bytes, sent_tick });
        self.order.push_back((sequence, sent_tick));
        while self.entries.len() > self.capacity {
            if !self.evict_front() {
                break;
            }
        }
    }

    pub fn remove(&mut self, sequence: u32) -> bool {
        self.entries.remove(&sequence).is_some()
    }

    /// Drops bundles sent `ttl_ticks` or more ago, returning how many were dropped
    pub fn sweep(&mut self, now_tick: u64, ttl_ticks: u64) -> usize {
        let mut dropped = 0;
        while let Some(&(sequence, sent_tick)) = self.order.front() {
            if now_tick.saturating_sub(sent_tick) < ttl_ticks {
                break;
            }
            self.order.pop_front();
            if self.is_current(sequence, sent_tick) {
                self.entries.remove(&sequence);
                dropped += 1;
            }
        }
        dropped
    }

    fn is_current(&self, sequence: u32, sent_tick: u64) -> bool {
        self.entries
            .get(&sequence)
            .map_or(false, |r| r.sent_tick == sent_tick)
    }

    fn evict_front(&mut self) -> bool {
        while let Some((sequence, sent_tick)) = self.order.pop_front() {
            if self.is_current(sequence, sent_tick) {
                self.entries.remove(&sequence);
                return true;
            }
        }
        false
    }
}
