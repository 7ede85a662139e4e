//! Desired versus live peer diffing

use super::{DesiredPeerSet, PeerConfig};
use crate::keys::Key;
use crate::types::cidrs_overlap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A desired peer that could not be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerFailure {
    /// The key as supplied, which may itself be the malformed part
    pub public_key: String,
    pub reason: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<Key>,
    pub updated: Vec<Key>,
    pub removed: Vec<Key>,
    pub unchanged: usize,
    pub failures: Vec<PeerFailure>,
}

impl ReconcileReport {
    /// True when the pass changed nothing on the interface
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Driver calls needed to converge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub add: Vec<PeerConfig>,
    /// Updated in place with a single `set_peer`
    pub update: Vec<PeerConfig>,
    /// Live endpoint must be cleared, which needs a remove then add
    pub replace: Vec<PeerConfig>,
    pub remove: Vec<Key>,
    pub unchanged: Vec<Key>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.update.is_empty()
            && self.replace.is_empty()
            && self.remove.is_empty()
    }
}

/// Desired peers after parsing
#[derive(Debug, Default)]
pub struct PreparedPeers {
    pub peers: Vec<PeerConfig>,
    /// Keys whose entry failed but must not be removed from the interface
    pub held: HashSet<Key>,
    pub failures: Vec<PeerFailure>,
}

/// Parse a desired set, isolating bad entries.
///
/// Entries are taken in order. A later entry that repeats a key or claims
/// allowed IPs of an earlier accepted peer fails on its own.
pub async fn prepare(desired: &DesiredPeerSet) -> PreparedPeers {
    let mut prepared = PreparedPeers::default();
    let mut seen: HashSet<Key> = HashSet::new();

    for entry in desired.iter() {
        let fail = |reason: String| PeerFailure {
            public_key: entry.public_key.clone(),
            reason,
        };

        let key = match Key::from_base64(&entry.public_key) {
            Ok(key) => key,
            Err(e) => {
                prepared.failures.push(fail(e.to_string()));
                continue;
            }
        };

        if !seen.insert(key) {
            prepared
                .failures
                .push(fail("duplicate public key in desired set".to_string()));
            continue;
        }

        let config = match entry.to_config().await {
            Ok(config) => config,
            Err(e) => {
                prepared.held.insert(key);
                prepared.failures.push(fail(e.to_string()));
                continue;
            }
        };

        let clash = prepared.peers.iter().find_map(|accepted| {
            config.allowed_ips.iter().find_map(|net| {
                accepted
                    .allowed_ips
                    .iter()
                    .find(|other| cidrs_overlap(net, other))
                    .map(|other| (net, other, accepted.public_key))
            })
        });
        if let Some((net, other, owner)) = clash {
            prepared.held.insert(key);
            prepared.failures.push(fail(format!(
                "allowed IP {} overlaps {} of peer {}",
                net,
                other,
                owner.short()
            )));
            continue;
        }

        prepared.peers.push(config);
    }

    prepared
}

/// Compute the driver calls that take `actual` to `desired`.
///
/// Live peers that are neither desired nor held are removed.
pub fn plan(desired: &[PeerConfig], held: &HashSet<Key>, actual: &[PeerConfig]) -> ReconcilePlan {
    let live: BTreeMap<Key, &PeerConfig> = actual.iter().map(|p| (p.public_key, p)).collect();
    let wanted: HashSet<Key> = desired.iter().map(|p| p.public_key).collect();
    let mut plan = ReconcilePlan::default();

    for peer in desired {
        match live.get(&peer.public_key) {
            None => plan.add.push(peer.clone()),
            Some(current) if peer.satisfied_by(current) => plan.unchanged.push(peer.public_key),
            Some(current) if peer.endpoint.is_none() && current.endpoint.is_some() => {
                plan.replace.push(peer.clone())
            }
            Some(_) => plan.update.push(peer.clone()),
        }
    }

    plan.remove = live
        .keys()
        .filter(|key| !wanted.contains(key) && !held.contains(key))
        .copied()
        .collect();

    plan
}
