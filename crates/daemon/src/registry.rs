//! In-memory peer registry
//!
//! Authoritative map of node id to its latest registration. Entries older
//! than the configured TTL are treated as absent and purged on the next
//! access.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use wgmesh_common::{Error, PeerDescriptor, Result};

/// A stored registration
#[derive(Debug, Clone)]
pub struct RegisteredPeer {
    pub descriptor: PeerDescriptor,
    pub registered_at: DateTime<Utc>,
}

/// Registry of nodes, keyed by id. Last registration wins.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, RegisteredPeer>>,
    ttl: Option<chrono::Duration>,
}

impl PeerRegistry {
    /// Create a registry; `None` keeps registrations forever
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            ttl: ttl.and_then(|d| chrono::Duration::from_std(d).ok()),
        }
    }

    /// Registration lifetime, `None` when registrations never expire
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl.and_then(|d| d.to_std().ok())
    }

    fn is_live(&self, peer: &RegisteredPeer, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => now - peer.registered_at < ttl,
            None => true,
        }
    }

    fn purge_expired(&self, peers: &mut HashMap<String, RegisteredPeer>) {
        if self.ttl.is_none() {
            return;
        }
        let now = Utc::now();
        peers.retain(|id, peer| {
            let live = self.is_live(peer, now);
            if !live {
                debug!(peer = %id, "registration expired");
            }
            live
        });
    }

    /// Insert or replace a registration, returning the one it replaced
    pub fn register(&self, descriptor: PeerDescriptor) -> Option<PeerDescriptor> {
        let mut peers = self.peers.lock();
        self.purge_expired(&mut peers);
        peers
            .insert(
                descriptor.id.clone(),
                RegisteredPeer {
                    descriptor,
                    registered_at: Utc::now(),
                },
            )
            .map(|prev| prev.descriptor)
    }

    /// Look up a live registration
    pub fn get(&self, id: &str) -> Result<PeerDescriptor> {
        let mut peers = self.peers.lock();
        self.purge_expired(&mut peers);
        peers
            .get(id)
            .map(|p| p.descriptor.clone())
            .ok_or_else(|| Error::not_found("peer", id))
    }

    /// Look up two registrations under one lock acquisition
    pub fn get_pair(&self, a: &str, b: &str) -> (Option<PeerDescriptor>, Option<PeerDescriptor>) {
        let mut peers = self.peers.lock();
        self.purge_expired(&mut peers);
        (
            peers.get(a).map(|p| p.descriptor.clone()),
            peers.get(b).map(|p| p.descriptor.clone()),
        )
    }

    /// All live registrations, ordered by id
    pub fn snapshot(&self) -> Vec<RegisteredPeer> {
        let mut peers = self.peers.lock();
        self.purge_expired(&mut peers);
        let mut all: Vec<RegisteredPeer> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        all
    }

    /// Drop a registration
    pub fn remove(&self, id: &str) -> Result<PeerDescriptor> {
        let mut peers = self.peers.lock();
        self.purge_expired(&mut peers);
        peers
            .remove(id)
            .map(|p| p.descriptor)
            .ok_or_else(|| Error::not_found("peer", id))
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        let mut peers = self.peers.lock();
        self.purge_expired(&mut peers);
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
