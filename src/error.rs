//! Error types shared by the storage, crypto, transport and sync layers.
//!
//! Lower layers keep failures distinguishable; the HTTP layer decides which of
//! them collapse into an opaque status on the wire (see [`ErrorKind`]).

use crate::fingerprint::{Fingerprint, FingerprintError};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to pick retry and response behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Cryptographic,
    Authorization,
    NotFound,
    Network,
    Structural,
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    #[error("an account already exists at {0}")]
    AccountExists(PathBuf),

    #[error("cannot remove {0}: an account needs at least one user id")]
    LastUserId(String),

    #[error("incorrect passphrase")]
    IncorrectPassphrase,

    #[error("no identity found at {0}")]
    NoIdentity(PathBuf),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("message is not encrypted for this account")]
    NotARecipient,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed armor: {0}")]
    Armor(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signed by unknown key {0}")]
    UnknownSigner(Fingerprint),

    #[error("signed by unexpected key: expected {expected}, got {actual}")]
    UnexpectedSigner {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("signature verification failed")]
    BadSignature,

    #[error("peer {} is not permitted to read this file", .0.map(|fp| fp.to_hex()).unwrap_or_else(|| "<anonymous>".into()))]
    NotPermitted(Option<Fingerprint>),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("version {hash} of {name} not found")]
    VersionNotFound { name: String, hash: String },

    #[error("friend not found: {0}")]
    FriendNotFound(String),

    #[error("no user id with email {0}")]
    UserIdNotFound(String),

    #[error("keyring entry {path} cannot be read: {source}")]
    KeyringEntry {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("not following {0}")]
    NotFollowing(Fingerprint),

    #[error("no address found for {0}")]
    AddressNotFound(Fingerprint),

    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmptyPassphrase | Error::AccountExists(_) | Error::LastUserId(_) => {
                ErrorKind::Configuration
            }
            Error::IncorrectPassphrase
            | Error::NoIdentity(_)
            | Error::KeyDerivation(_)
            | Error::Encryption(_)
            | Error::Decryption(_)
            | Error::NotARecipient
            | Error::InvalidKey(_)
            | Error::Armor(_)
            | Error::MalformedMessage(_)
            | Error::BadSignature
            | Error::KeyringEntry { .. } => ErrorKind::Cryptographic,
            Error::UnknownSigner(_) | Error::UnexpectedSigner { .. } | Error::NotPermitted(_) => {
                ErrorKind::Authorization
            }
            Error::FileNotFound(_)
            | Error::VersionNotFound { .. }
            | Error::FriendNotFound(_)
            | Error::UserIdNotFound(_)
            | Error::NotFollowing(_) => ErrorKind::NotFound,
            Error::AddressNotFound(_)
            | Error::UnexpectedStatus { .. }
            | Error::SizeMismatch { .. }
            | Error::HashMismatch { .. }
            | Error::Cancelled
            | Error::Certificate(_)
            | Error::Tls(_)
            | Error::Http(_) => ErrorKind::Network,
            Error::Fingerprint(_) | Error::InvalidName(_) | Error::Json(_) => ErrorKind::Structural,
            Error::Unreadable { .. } | Error::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
