//! # Kademlia DHT
//!
//! Maps fingerprints to network addresses for peers that are not on the local
//! network. The pieces:
//!
//! - [`routing`]: 160 k-buckets keyed by shared prefix length with the local
//!   fingerprint, refreshed with ping-before-evict
//! - [`lookup`]: the distance-ordered candidate set that drives iterative
//!   lookups
//! - [`rpc`]: message types and the HTTPS client
//! - [`node`]: [`Dht`], which ties them together and implements the handlers
//!   served under `/kad/`
//!
//! A node only ever stores an address under the fingerprint the sender proved
//! in its TLS handshake.

pub mod lookup;
pub mod node;
pub mod routing;
pub mod rpc;

pub use lookup::{PeerRequestSet, RequestState, ALPHA};
pub use node::{Dht, DhtConfig};
pub use routing::{InsertOutcome, Peer, Pinger, RoutingTable, BUCKET_COUNT, K};
pub use rpc::{DhtRpc, FindValueResponse, HttpDhtClient};
