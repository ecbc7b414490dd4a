//! K-bucket routing table.

use crate::fingerprint::{Fingerprint, KEY_BITS};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::debug;

/// Bucket capacity.
pub const K: usize = 20;

/// One bucket per bit of the key space.
pub const BUCKET_COUNT: usize = KEY_BITS;

/// A DHT node and where to reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub fingerprint: Fingerprint,
    pub address: SocketAddr,
}

impl Peer {
    pub fn new(fingerprint: Fingerprint, address: SocketAddr) -> Self {
        Self {
            fingerprint,
            address,
        }
    }
}

/// Liveness probe used before evicting the least recently seen peer.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn is_alive(&self, peer: &Peer) -> bool;
}

/// Result of offering a peer to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was already known and is now the most recently seen.
    Updated,
    /// The peer was appended to a bucket with room.
    Inserted,
    /// The bucket is full; `least_recent` has to be probed first.
    Full { least_recent: Peer },
    /// A dead peer was evicted to make room.
    Replaced { evicted: Peer },
    /// The bucket's least recently seen peer answered; the newcomer was dropped.
    Rejected,
    /// The local node itself.
    Ignored,
}

pub struct RoutingTable {
    local: Fingerprint,
    buckets: Vec<RwLock<VecDeque<Peer>>>,
}

impl RoutingTable {
    pub fn new(local: Fingerprint) -> Self {
        Self {
            local,
            buckets: (0..BUCKET_COUNT)
                .map(|_| RwLock::new(VecDeque::with_capacity(K)))
                .collect(),
        }
    }

    pub fn local(&self) -> Fingerprint {
        self.local
    }

    /// Shared prefix length with the local fingerprint; `None` for self.
    pub fn bucket_index(&self, fingerprint: &Fingerprint) -> Option<usize> {
        let index = self.local.prefix_len(fingerprint);
        (index < BUCKET_COUNT).then_some(index)
    }

    /// Inserts or refreshes `peer` without any network traffic.
    pub fn try_insert(&self, peer: Peer) -> InsertOutcome {
        let Some(index) = self.bucket_index(&peer.fingerprint) else {
            return InsertOutcome::Ignored;
        };
        let mut bucket = self.buckets[index].write();

        if let Some(pos) = bucket
            .iter()
            .position(|p| p.fingerprint == peer.fingerprint)
        {
            bucket.remove(pos);
            bucket.push_back(peer);
            return InsertOutcome::Updated;
        }
        if bucket.len() < K {
            bucket.push_back(peer);
            return InsertOutcome::Inserted;
        }
        match bucket.front() {
            Some(least_recent) => InsertOutcome::Full {
                least_recent: *least_recent,
            },
            None => InsertOutcome::Rejected,
        }
    }

    /// Inserts or refreshes `peer`. When its bucket is full the least recently
    /// seen entry is pinged: if it answers it is kept and `peer` is dropped,
    /// otherwise it is evicted and `peer` takes its place.
    pub async fn update<P>(&self, peer: Peer, pinger: &P) -> InsertOutcome
    where
        P: Pinger + ?Sized,
    {
        let least_recent = match self.try_insert(peer) {
            InsertOutcome::Full { least_recent } => least_recent,
            outcome => return outcome,
        };

        // No lock is held while probing.
        let alive = pinger.is_alive(&least_recent).await;

        let Some(index) = self.bucket_index(&peer.fingerprint) else {
            return InsertOutcome::Ignored;
        };
        let mut bucket = self.buckets[index].write();
        let head = bucket
            .iter()
            .position(|p| p.fingerprint == least_recent.fingerprint);

        if alive {
            if let Some(pos) = head {
                if let Some(entry) = bucket.remove(pos) {
                    bucket.push_back(entry);
                }
            }
            debug!(
                "Kept {} in bucket {}, dropped {}",
                least_recent.fingerprint, index, peer.fingerprint
            );
            return InsertOutcome::Rejected;
        }

        if let Some(pos) = head {
            bucket.remove(pos);
        }
        if bucket.iter().any(|p| p.fingerprint == peer.fingerprint) {
            return InsertOutcome::Updated;
        }
        if bucket.len() >= K {
            return InsertOutcome::Rejected;
        }
        bucket.push_back(peer);
        debug!(
            "Evicted {} from bucket {} for {}",
            least_recent.fingerprint, index, peer.fingerprint
        );
        InsertOutcome::Replaced {
            evicted: least_recent,
        }
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        let Some(index) = self.bucket_index(fingerprint) else {
            return false;
        };
        let mut bucket = self.buckets[index].write();
        match bucket.iter().position(|p| p.fingerprint == *fingerprint) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Peer> {
        let index = self.bucket_index(fingerprint)?;
        let bucket = self.buckets[index].read();
        bucket.iter().find(|p| p.fingerprint == *fingerprint).copied()
    }

    /// Peers of one bucket, least recently seen first.
    pub fn bucket(&self, index: usize) -> Vec<Peer> {
        self.buckets
            .get(index)
            .map(|b| b.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Up to `count` known peers closest to `target`, closest first.
    pub fn closest(&self, target: &Fingerprint, count: usize) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.read().iter().copied().collect::<Vec<_>>())
            .collect();
        peers.sort_by_key(|p| p.fingerprint.distance(target));
        peers.truncate(count);
        peers
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
