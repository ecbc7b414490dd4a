//! # Fingerprints
//!
//! A [`Fingerprint`] is the fixed-width handle every other module uses to name
//! an identity: accounts, friends, per-identity file directories, TLS peers and
//! DHT nodes are all addressed by one.
//!
//! Fingerprints are the first 20 bytes of a SHA-256 digest over an algorithm
//! tag and the raw public key, so the same key always reduces to the same
//! fingerprint whether it arrives in an armored key block or inside an X.509
//! certificate. They are ordered relative to each other by XOR distance, the
//! Kademlia metric.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 20;

/// Size of the fingerprint key space in bits.
pub const KEY_BITS: usize = FINGERPRINT_LEN * 8;

/// Length of a key ID in bytes.
pub const KEY_ID_LEN: usize = 8;

#[derive(Debug, Error, PartialEq)]
pub enum FingerprintError {
    #[error("invalid hex in fingerprint: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("fingerprint length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Identity handle derived from a public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FingerprintError> {
        let array: [u8; FINGERPRINT_LEN] =
            bytes.try_into().map_err(|_| FingerprintError::LengthMismatch {
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Derives the fingerprint of a public key.
    ///
    /// `algorithm` keeps keys of different types apart even when their raw
    /// bytes happen to coincide.
    pub fn derive(algorithm: &str, public_key: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(algorithm.as_bytes());
        hasher.update([0u8]);
        hasher.update(public_key);
        let digest = hasher.finalize();

        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Self(bytes)
    }

    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The short identifier used in envelope headers: the last eight bytes.
    pub fn key_id(&self) -> KeyId {
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&self.0[FINGERPRINT_LEN - KEY_ID_LEN..]);
        KeyId(id)
    }

    pub fn distance(&self, other: &Fingerprint) -> Distance {
        let mut out = [0u8; FINGERPRINT_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Number of leading bits shared with `other`; [`KEY_BITS`] for itself.
    pub fn prefix_len(&self, other: &Fingerprint) -> usize {
        self.distance(other).leading_zeros()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// XOR distance between two fingerprints, compared as a big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance([u8; FINGERPRINT_LEN]);

impl Distance {
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        KEY_BITS
    }
}

/// Short key identifier carried in envelope headers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    pub const fn from_bytes(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let array: [u8; KEY_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("key id must be 8 bytes"))?;
        Ok(Self(array))
    }
}
