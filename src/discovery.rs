//! # Address discovery
//!
//! Before syncing with a friend we need an address for their fingerprint.
//! Several [`Resolver`]s can answer that question:
//!
//! - [`StaticResolver`]: addresses from the configuration file
//! - [`LanResolver`]: signed UDP broadcast announcements on the local network
//! - [`DhtResolver`]: an iterative lookup in the Kademlia DHT
//!
//! [`resolve_address`] races all of them; the first answer wins and the rest
//! are abandoned.

use crate::account::Account;
use crate::crypto::{self, SIGNING_ALGORITHM};
use crate::dht::Dht;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Verifier, VerifyingKey};
use futures::future::select_ok;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Service label carried in LAN announcements.
pub const SERVICE_NAME: &str = "_peerbox._tcp.local";

/// Default UDP port for LAN announcements.
pub const DEFAULT_ANNOUNCE_PORT: u16 = 41338;

const ANNOUNCE_CONTEXT: &[u8] = b"peerbox lan announcement\0";
const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;

    /// Finds an address for `fingerprint`. Returns promptly once `cancel`
    /// fires.
    async fn resolve(&self, fingerprint: &Fingerprint, cancel: &CancellationToken) -> Result<SocketAddr>;
}

/// Races `resolvers` and returns the first address found.
pub async fn resolve_address(
    resolvers: &[Arc<dyn Resolver>],
    fingerprint: &Fingerprint,
    cancel: &CancellationToken,
) -> Result<SocketAddr> {
    if resolvers.is_empty() {
        return Err(Error::AddressNotFound(*fingerprint));
    }

    let race_token = cancel.child_token();
    let attempts = resolvers
        .iter()
        .map(|resolver| resolver.resolve(fingerprint, &race_token));

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = select_ok(attempts) => match result {
            Ok((address, _losers)) => Ok(address),
            Err(e) => {
                debug!("All resolvers failed for {}: {}", fingerprint, e);
                Err(Error::AddressNotFound(*fingerprint))
            }
        },
    };
    race_token.cancel();

    if let Ok(address) = &outcome {
        debug!("Resolved {} to {}", fingerprint, address);
    }
    outcome
}

/// Addresses configured by hand.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    peers: HashMap<Fingerprint, SocketAddr>,
}

impl StaticResolver {
    pub fn new(peers: HashMap<Fingerprint, SocketAddr>) -> Self {
        Self { peers }
    }

    pub fn insert(&mut self, fingerprint: Fingerprint, address: SocketAddr) {
        self.peers.insert(fingerprint, address);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    fn name(&self) -> &str {
        "static"
    }

    async fn resolve(&self, fingerprint: &Fingerprint, _cancel: &CancellationToken) -> Result<SocketAddr> {
        self.peers
            .get(fingerprint)
            .copied()
            .ok_or(Error::AddressNotFound(*fingerprint))
    }
}

/// Resolution through the DHT.
pub struct DhtResolver {
    dht: Arc<Dht>,
}

impl DhtResolver {
    pub fn new(dht: Arc<Dht>) -> Self {
        Self { dht }
    }
}

#[async_trait]
impl Resolver for DhtResolver {
    fn name(&self) -> &str {
        "dht"
    }

    async fn resolve(&self, fingerprint: &Fingerprint, cancel: &CancellationToken) -> Result<SocketAddr> {
        self.dht.resolve(fingerprint, cancel).await
    }
}

/// A signed "I am here" datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    /// `<fingerprint>._peerbox._tcp.local`
    pub name: String,
    pub public_key: String,
    pub port: u16,
    pub timestamp: i64,
    pub signature: String,
}

impl Announcement {
    pub fn new(account: &Account, port: u16) -> Self {
        let name = format!("{}.{}", account.fingerprint().to_hex(), SERVICE_NAME);
        let timestamp = Utc::now().timestamp();
        let signature = account.sign(&Self::signed_bytes(&name, port, timestamp));
        Self {
            name,
            public_key: hex::encode(account.secret_keys().public().signing.as_bytes()),
            port,
            timestamp,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    fn signed_bytes(name: &str, port: u16, timestamp: i64) -> Vec<u8> {
        let mut out = Vec::with_capacity(ANNOUNCE_CONTEXT.len() + name.len() + 10);
        out.extend_from_slice(ANNOUNCE_CONTEXT);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&port.to_be_bytes());
        out.extend_from_slice(&timestamp.to_be_bytes());
        out
    }

    /// Checks the signature, that the key matches the announced fingerprint
    /// and that the announcement is recent. Returns the fingerprint.
    pub fn verify(&self) -> Result<Fingerprint> {
        let key_bytes = crypto::decode_key(&self.public_key)?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let fingerprint = Fingerprint::derive(SIGNING_ALGORITHM, key.as_bytes());

        let expected_name = format!("{}.{}", fingerprint.to_hex(), SERVICE_NAME);
        if self.name != expected_name {
            return Err(Error::MalformedMessage(format!(
                "announcement name {} does not match its key",
                self.name
            )));
        }
        if (Utc::now().timestamp() - self.timestamp).abs() > MAX_CLOCK_SKEW_SECS {
            return Err(Error::MalformedMessage("stale announcement".into()));
        }

        let signature_bytes = hex::decode(&self.signature).map_err(|_| Error::BadSignature)?;
        let signature = crypto::signature_from_slice(&signature_bytes)?;
        key.verify(&Self::signed_bytes(&self.name, self.port, self.timestamp), &signature)
            .map_err(|_| Error::BadSignature)?;
        Ok(fingerprint)
    }
}

/// Periodically broadcasts this node's announcement.
pub struct LanAnnouncer {
    targets: Vec<SocketAddr>,
    interval: Duration,
}

impl LanAnnouncer {
    /// Announces to the IPv4 broadcast address on `announce_port`.
    pub fn broadcast(announce_port: u16) -> Self {
        Self::to_targets(vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_port,
        )])
    }

    pub fn to_targets(targets: Vec<SocketAddr>) -> Self {
        Self {
            targets,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sends one round of announcements.
    pub async fn announce_once(&self, account: &Account, listen_port: u16) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let message = serde_json::to_vec(&Announcement::new(account, listen_port))?;

        for target in &self.targets {
            match socket.send_to(&message, target).await {
                Ok(_) => debug!("Sent announcement to {}", target),
                Err(e) => warn!("Failed to send announcement to {}: {}", target, e),
            }
        }
        Ok(())
    }

    /// Announces every interval until cancelled.
    pub fn spawn(self, account: Arc<Account>, listen_port: u16, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.announce_once(&account, listen_port).await {
                            warn!("LAN announcement failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Sighting {
    address: SocketAddr,
    seen_at: Instant,
}

/// Resolves fingerprints from announcements heard on the local network.
#[derive(Clone)]
pub struct LanResolver {
    sightings: Arc<RwLock<HashMap<Fingerprint, Sighting>>>,
    wait: Duration,
    max_age: Duration,
}

impl LanResolver {
    pub fn new(wait: Duration) -> Self {
        Self {
            sightings: Arc::new(RwLock::new(HashMap::new())),
            wait,
            max_age: Duration::from_secs(10 * 60),
        }
    }

    /// Binds the announcement port and starts listening until cancelled.
    pub async fn listen(&self, port: u16, cancel: CancellationToken) -> Result<(SocketAddr, JoinHandle<()>)> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        let local = socket.local_addr()?;
        let resolver = self.clone();
        info!("Listening for LAN announcements on {}", local);

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, from) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("LAN listener error: {}", e);
                            continue;
                        }
                    },
                };
                resolver.handle_datagram(&buf[..len], from);
            }
        });
        Ok((local, handle))
    }

    /// Records a verified announcement; anything else is ignored.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let announcement: Announcement = match serde_json::from_slice(data) {
            Ok(announcement) => announcement,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", from, e);
                return;
            }
        };
        match announcement.verify() {
            Ok(fingerprint) => {
                let address = SocketAddr::new(from.ip(), announcement.port);
                debug!("{} announced at {}", fingerprint, address);
                self.sightings.write().insert(
                    fingerprint,
                    Sighting {
                        address,
                        seen_at: Instant::now(),
                    },
                );
            }
            Err(e) => warn!("Rejected announcement from {}: {}", from, e),
        }
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<SocketAddr> {
        self.sightings
            .read()
            .get(fingerprint)
            .filter(|s| s.seen_at.elapsed() <= self.max_age)
            .map(|s| s.address)
    }
}

#[async_trait]
impl Resolver for LanResolver {
    fn name(&self) -> &str {
        "lan"
    }

    async fn resolve(&self, fingerprint: &Fingerprint, cancel: &CancellationToken) -> Result<SocketAddr> {
        let deadline = tokio::time::Instant::now() + self.wait;
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        loop {
            if let Some(address) = self.lookup(fingerprint) {
                return Ok(address);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(Error::AddressNotFound(*fingerprint)),
                _ = poll.tick() => {}
            }
        }
    }
}
