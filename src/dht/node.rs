use super::lookup::{PeerRequestSet, ALPHA};
use super::routing::{InsertOutcome, Peer, RoutingTable, K};
use super::rpc::{DhtRpc, FindValueResponse};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Confirm a STORE by pinging the claimed address before recording it.
    pub verify_store: bool,
    /// How long a stored address stays valid.
    pub value_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            verify_store: true,
            value_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredValue {
    address: SocketAddr,
    stored_at: Instant,
}

enum LookupResult {
    Found(SocketAddr),
    Closest(Vec<Peer>),
}

/// A DHT node: routing table, stored addresses and the lookup driver.
pub struct Dht {
    local: Fingerprint,
    table: RoutingTable,
    values: RwLock<HashMap<Fingerprint, StoredValue>>,
    rpc: Arc<dyn DhtRpc>,
    config: DhtConfig,
}

impl Dht {
    pub fn new(local: Fingerprint, rpc: Arc<dyn DhtRpc>, config: DhtConfig) -> Self {
        Self {
            local,
            table: RoutingTable::new(local),
            values: RwLock::new(HashMap::new()),
            rpc,
            config,
        }
    }

    pub fn local(&self) -> Fingerprint {
        self.local
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    /// Offers `peer` to the routing table, probing a full bucket's oldest
    /// entry through the RPC layer.
    pub async fn record_contact(&self, peer: Peer) -> InsertOutcome {
        self.table.update(peer, self.rpc.as_ref()).await
    }

    /// Joins the network through `seeds`, then looks up the local fingerprint
    /// to fill the table. Returns the number of known peers afterwards.
    pub async fn bootstrap(&self, seeds: &[Peer], cancel: &CancellationToken) -> Result<usize> {
        for seed in seeds {
            match self.rpc.ping(seed).await {
                Ok(fingerprint) if fingerprint == seed.fingerprint => {
                    self.record_contact(*seed).await;
                }
                Ok(fingerprint) => warn!(
                    "Bootstrap peer {} answered as {}, expected {}",
                    seed.address, fingerprint, seed.fingerprint
                ),
                Err(e) => warn!("Bootstrap peer {} unreachable: {}", seed.address, e),
            }
        }
        if self.table.is_empty() {
            return Ok(0);
        }

        self.find_node(&self.local, cancel).await?;
        let known = self.table.len();
        info!("DHT bootstrapped with {} peers", known);
        Ok(known)
    }

    /// Tells the peers closest to us where we can be reached. Returns how
    /// many accepted.
    pub async fn announce(&self, address: SocketAddr, cancel: &CancellationToken) -> Result<usize> {
        let closest = self.find_node(&self.local, cancel).await?;
        let mut stored = 0;
        for peer in closest {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.rpc.store(&peer, address).await {
                Ok(()) => stored += 1,
                Err(e) => debug!("STORE to {} failed: {}", peer.fingerprint, e),
            }
        }
        info!("Announced {} to {} peers", address, stored);
        Ok(stored)
    }

    /// The address of `target`: a direct routing table entry, a stored value
    /// here, or an iterative FIND_VALUE.
    pub async fn resolve(&self, target: &Fingerprint, cancel: &CancellationToken) -> Result<SocketAddr> {
        if let Some(peer) = self.table.get(target) {
            return Ok(peer.address);
        }
        if let Some(address) = self.live_value(target) {
            return Ok(address);
        }
        match self.lookup(target, true, cancel).await? {
            LookupResult::Found(address) => Ok(address),
            LookupResult::Closest(peers) => peers
                .into_iter()
                .find(|p| p.fingerprint == *target)
                .map(|p| p.address)
                .ok_or(Error::AddressNotFound(*target)),
        }
    }

    /// Iterative FIND_NODE: the K closest peers to `target` that answered.
    pub async fn find_node(&self, target: &Fingerprint, cancel: &CancellationToken) -> Result<Vec<Peer>> {
        match self.lookup(target, false, cancel).await? {
            LookupResult::Closest(peers) => Ok(peers),
            LookupResult::Found(_) => Ok(Vec::new()),
        }
    }

    /// Iterative FIND_VALUE.
    pub async fn find_value(
        &self,
        target: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<Option<SocketAddr>> {
        if let Some(address) = self.live_value(target) {
            return Ok(Some(address));
        }
        match self.lookup(target, true, cancel).await? {
            LookupResult::Found(address) => Ok(Some(address)),
            LookupResult::Closest(_) => Ok(None),
        }
    }

    async fn lookup(
        &self,
        target: &Fingerprint,
        want_value: bool,
        cancel: &CancellationToken,
    ) -> Result<LookupResult> {
        let set = PeerRequestSet::new(*target);
        set.exclude(self.local);
        set.add(self.table.closest(target, K));

        let mut in_flight = FuturesUnordered::new();
        loop {
            while in_flight.len() < ALPHA {
                match set.next_pending(K) {
                    Some(peer) => in_flight.push(query(self.rpc.as_ref(), peer, *target, want_value)),
                    None => break,
                }
            }
            if in_flight.is_empty() || set.is_finished(K) {
                break;
            }

            let (peer, result) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = in_flight.next() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            match result {
                Ok(FindValueResponse::Value { address }) => {
                    set.mark_responded(&peer.fingerprint);
                    self.record_contact(peer).await;
                    debug!("Found value for {} at {}", target, peer.fingerprint);
                    return Ok(LookupResult::Found(address));
                }
                Ok(FindValueResponse::Closer { peers }) => {
                    set.mark_responded(&peer.fingerprint);
                    let learned = set.add(peers);
                    debug!("{} returned {} new peers", peer.fingerprint, learned);
                    self.record_contact(peer).await;
                }
                Err(e) => {
                    debug!("Lookup query to {} failed: {}", peer.fingerprint, e);
                    set.mark_failed(&peer.fingerprint);
                    self.table.remove(&peer.fingerprint);
                }
            }
        }

        Ok(LookupResult::Closest(set.closest_responded(K)))
    }

    fn live_value(&self, fingerprint: &Fingerprint) -> Option<SocketAddr> {
        let value = *self.values.read().get(fingerprint)?;
        if value.stored_at.elapsed() <= self.config.value_ttl {
            return Some(value.address);
        }
        self.values.write().remove(fingerprint);
        None
    }

    fn sender_peer(sender: Option<Fingerprint>, remote: SocketAddr, listen_port: Option<u16>) -> Option<Peer> {
        let fingerprint = sender?;
        let port = listen_port?;
        Some(Peer::new(fingerprint, SocketAddr::new(remote.ip(), port)))
    }

    async fn note_sender(&self, sender: Option<Fingerprint>, remote: SocketAddr, listen_port: Option<u16>) {
        if let Some(peer) = Self::sender_peer(sender, remote, listen_port) {
            self.record_contact(peer).await;
        }
    }

    pub async fn handle_ping(
        &self,
        sender: Option<Fingerprint>,
        remote: SocketAddr,
        listen_port: Option<u16>,
    ) -> Fingerprint {
        self.note_sender(sender, remote, listen_port).await;
        self.local
    }

    /// Records `address` for the TLS-authenticated `sender`.
    pub async fn handle_store(&self, sender: Option<Fingerprint>, address: SocketAddr) -> Result<()> {
        let sender = sender.ok_or(Error::NotPermitted(None))?;
        if sender == self.local {
            return Err(Error::NotPermitted(Some(sender)));
        }

        let peer = Peer::new(sender, address);
        if self.config.verify_store {
            match self.rpc.ping(&peer).await {
                Ok(fingerprint) if fingerprint == sender => {}
                Ok(other) => {
                    warn!("STORE from {}: {} answers as {}", sender, address, other);
                    return Err(Error::NotPermitted(Some(sender)));
                }
                Err(e) => {
                    warn!("STORE from {}: {} unreachable: {}", sender, address, e);
                    return Err(Error::NotPermitted(Some(sender)));
                }
            }
        }

        self.values.write().insert(
            sender,
            StoredValue {
                address,
                stored_at: Instant::now(),
            },
        );
        self.record_contact(peer).await;
        debug!("Stored address {} for {}", address, sender);
        Ok(())
    }

    pub async fn handle_find_node(
        &self,
        sender: Option<Fingerprint>,
        remote: SocketAddr,
        listen_port: Option<u16>,
        target: &Fingerprint,
    ) -> Vec<Peer> {
        self.note_sender(sender, remote, listen_port).await;
        self.closest_excluding(target, sender)
    }

    pub async fn handle_find_value(
        &self,
        sender: Option<Fingerprint>,
        remote: SocketAddr,
        listen_port: Option<u16>,
        target: &Fingerprint,
    ) -> FindValueResponse {
        self.note_sender(sender, remote, listen_port).await;
        match self.live_value(target) {
            Some(address) => FindValueResponse::Value { address },
            None => FindValueResponse::Closer {
                peers: self.closest_excluding(target, sender),
            },
        }
    }

    fn closest_excluding(&self, target: &Fingerprint, sender: Option<Fingerprint>) -> Vec<Peer> {
        let mut peers = self.table.closest(target, K + 1);
        peers.retain(|p| Some(p.fingerprint) != sender);
        peers.truncate(K);
        peers
    }
}

async fn query(
    rpc: &dyn DhtRpc,
    peer: Peer,
    target: Fingerprint,
    want_value: bool,
) -> (Peer, Result<FindValueResponse>) {
    let result = if want_value {
        rpc.find_value(&peer, &target).await
    } else {
        rpc.find_node(&peer, &target)
            .await
            .map(|peers| FindValueResponse::Closer { peers })
    };
    (peer, result)
}
