//! # PeerBox
//!
//! Encrypted, peer-to-peer file sharing between friends.
//!
//! Every user is an Ed25519 key pair. Friends exchange public keys, encrypt
//! files for each other and pull them directly from each other's machines over
//! mutually authenticated TLS, where the certificate key *is* the account key.
//! There is no central server: addresses are found through static
//! configuration, LAN broadcasts or a Kademlia DHT.
//!
//! ## Core Modules
//!
//! - [`fingerprint`] - 20-byte identity handles and XOR distance
//! - [`crypto`] / [`envelope`] - key material and the encrypted message format
//! - [`account`] - the passphrase-protected identity
//! - [`keyring`] - friends, stored encrypted, in nested groups
//! - [`storage`] - per-identity file tree with content-addressed versions
//! - [`tls`] - certificates derived from account keys
//! - [`dht`] - Kademlia routing, lookups and RPC
//! - [`discovery`] - resolving a fingerprint to an address
//! - [`server`] / [`sync`] - the HTTP sync protocol, both ends
//! - [`config`] / [`cli`] - settings and the command line front end
//!
//! ## Quick Start
//!
//! ```bash
//! # Create an account
//! peerbox init --name Ann --email ann@example.com
//!
//! # Swap keys with a friend
//! peerbox export --output ann.key
//! peerbox import bob.key
//! peerbox follow <bob's fingerprint> --address 192.0.2.10:41337
//!
//! # Share a file with Bob, then serve
//! peerbox add notes.txt --to <bob's fingerprint>
//! peerbox serve
//! ```

pub mod account;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod keyring;
pub mod server;
pub mod storage;
pub mod sync;
pub mod tls;

pub use account::{Account, AccountOptions};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use fingerprint::Fingerprint;
pub use keyring::{Friend, FriendIndex, Keyring};
pub use storage::{FileStore, StoredFile};
pub use sync::{SyncClient, SyncReport};
