//! Peer registry for the relay proxy
//!
//! This module tracks every client the proxy is relaying for, including:
//! - Peers whose backend lookup is still in flight
//! - Registered sessions keyed by the client's socket address
//! - Capacity enforcement across both of the above
//! - Idle detection and cleanup of abandoned peers
//!
//! A peer address maps to at most one session at any time. Lookups that
//! fail leave nothing behind.

use crate::session::Session;
use log::info;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// Outcome of asking the registry to admit a new peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A backend lookup may start for this peer
    Accepted,
    /// The peer is already registered or has a lookup in flight
    Duplicate,
    /// The proxy is at capacity
    Full,
}

/// Manages all relayed peers and their sessions
pub struct PeerRegistry {
    /// Registered sessions indexed by client address
    peers: HashMap<SocketAddr, Session>,
    /// Peers with a backend lookup in flight
    pending: HashSet<SocketAddr>,
    /// Maximum number of concurrent peers, pending ones included
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            pending: HashSet::new(),
            max_peers,
        }
    }

    /// Reserves a slot for `addr` while its backend is being resolved
    ///
    /// Pending peers count against capacity so that a burst of connection
    /// requests cannot overshoot `max_peers` once their lookups finish.
    pub fn begin_lookup(&mut self, addr: SocketAddr) -> Admission {
        if self.peers.contains_key(&addr) || self.pending.contains(&addr) {
            return Admission::Duplicate;
        }
        if self.is_full() {
            return Admission::Full;
        }
        self.pending.insert(addr);
        Admission::Accepted
    }

    /// Releases the slot of a peer whose lookup failed
    pub fn abandon_lookup(&mut self, addr: &SocketAddr) -> bool {
        self.pending.remove(addr)
    }

    /// Registers a session for a peer that went through [`PeerRegistry::begin_lookup`]
    ///
    /// Returns the session back if no lookup was pending for its address.
    pub fn register(&mut self, session: Session) -> Result<(), Session> {
        let addr = session.client_address();
        if !self.pending.remove(&addr) {
            return Err(session);
        }
        info!("Peer {} registered ({} online)", addr, self.peers.len() + 1);
        self.peers.insert(addr, session);
        Ok(())
    }

    /// Removes a peer's session, returning it for teardown
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Session> {
        let session = self.peers.remove(addr)?;
        info!("Peer {} deregistered ({} online)", addr, self.peers.len());
        Some(session)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Session> {
        self.peers.get_mut(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn is_pending(&self, addr: &SocketAddr) -> bool {
        self.pending.contains(addr)
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = (&SocketAddr, &mut Session)> {
        self.peers.iter_mut()
    }

    /// Checks for and removes peers idle for more than `max_idle_ticks`
    ///
    /// The removed sessions are returned so the caller can notify the
    /// client and release the upstream sockets.
    pub fn take_idle(&mut self, max_idle_ticks: u64) -> Vec<Session> {
        let idle: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, session)| session.idle_ticks() > max_idle_ticks)
            .map(|(addr, _)| *addr)
            .collect();

        idle.iter().filter_map(|addr| self.remove(addr)).collect()
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() + self.pending.len() >= self.max_peers
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }
}
