//! DHT messages and the HTTPS client that carries them.
//!
//! Requests are JSON bodies POSTed to `/kad/{ping,store,find_node,find_value}`
//! on the same TLS listener that serves files. The sender is identified by its
//! client certificate, never by anything in the body.

use super::routing::{Peer, Pinger};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::tls::TlsIdentity;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    /// Port the sender accepts DHT traffic on, if it wants to be routed to.
    #[serde(default)]
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    /// Address the sender claims to be reachable at.
    pub address: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindRequest {
    pub target: Fingerprint,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FindValueResponse {
    Value { address: SocketAddr },
    Closer { peers: Vec<Peer> },
}

/// Outgoing DHT calls.
#[async_trait]
pub trait DhtRpc: Send + Sync {
    /// Returns the fingerprint the peer proved during the handshake.
    async fn ping(&self, peer: &Peer) -> Result<Fingerprint>;

    /// Asks `peer` to record that we are reachable at `address`.
    async fn store(&self, peer: &Peer, address: SocketAddr) -> Result<()>;

    async fn find_node(&self, peer: &Peer, target: &Fingerprint) -> Result<Vec<Peer>>;

    async fn find_value(&self, peer: &Peer, target: &Fingerprint) -> Result<FindValueResponse>;
}

#[async_trait]
impl<T> Pinger for T
where
    T: DhtRpc + ?Sized,
{
    async fn is_alive(&self, peer: &Peer) -> bool {
        match self.ping(peer).await {
            Ok(fingerprint) => fingerprint == peer.fingerprint,
            Err(e) => {
                debug!("Ping to {} failed: {}", peer.address, e);
                false
            }
        }
    }
}

/// [`DhtRpc`] over HTTPS. Every connection pins the fingerprint of the peer
/// it is addressed to.
pub struct HttpDhtClient {
    identity: Arc<TlsIdentity>,
    listen_port: Option<u16>,
    timeout: Duration,
    clients: Mutex<HashMap<Fingerprint, reqwest::Client>>,
}

impl HttpDhtClient {
    pub fn new(identity: Arc<TlsIdentity>, listen_port: Option<u16>, timeout: Duration) -> Self {
        Self {
            identity,
            listen_port,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, fingerprint: &Fingerprint) -> Result<reqwest::Client> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(fingerprint) {
            return Ok(client.clone());
        }
        let client = self.identity.http_client(*fingerprint, self.timeout)?;
        clients.insert(*fingerprint, client.clone());
        Ok(client)
    }

    async fn call<Req, Resp>(&self, peer: &Peer, method: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("https://{}/kad/{}", peer.address, method);
        let response = self
            .client_for(&peer.fingerprint)?
            .post(&url)
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedStatus {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl DhtRpc for HttpDhtClient {
    async fn ping(&self, peer: &Peer) -> Result<Fingerprint> {
        let request = PingRequest {
            listen_port: self.listen_port,
        };
        let response: PingResponse = self.call(peer, "ping", &request).await?;
        Ok(response.fingerprint)
    }

    async fn store(&self, peer: &Peer, address: SocketAddr) -> Result<()> {
        let _: serde_json::Value = self
            .call(peer, "store", &StoreRequest { address })
            .await?;
        Ok(())
    }

    async fn find_node(&self, peer: &Peer, target: &Fingerprint) -> Result<Vec<Peer>> {
        let request = FindRequest {
            target: *target,
            listen_port: self.listen_port,
        };
        let response: FindNodeResponse = self.call(peer, "find_node", &request).await?;
        Ok(response.peers)
    }

    async fn find_value(&self, peer: &Peer, target: &Fingerprint) -> Result<FindValueResponse> {
        let request = FindRequest {
            target: *target,
            listen_port: self.listen_port,
        };
        self.call(peer, "find_value", &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_value_response_wire_format() {
        let value = FindValueResponse::Value {
            address: "10.0.0.1:7070".parse().unwrap(),
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["type"], "value");
        assert_eq!(json["address"], "10.0.0.1:7070");

        let closer: FindValueResponse =
            serde_json::from_str(r#"{"type":"closer","peers":[]}"#).unwrap();
        assert_eq!(closer, FindValueResponse::Closer { peers: vec![] });
    }

    #[test]
    fn test_ping_request_port_is_optional() {
        let request: PingRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.listen_port, None);
    }
}
