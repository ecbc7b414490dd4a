//! # Cryptographic Operations
//!
//! This module provides the key material and primitives PeerBox is built on:
//! - Ed25519 primary keys for signing, user ID certification and TLS identity
//! - X25519 encryption subkeys, bound to the primary key by a signature
//! - Argon2id passphrase key derivation and ChaCha20-Poly1305 sealing
//! - Armored public key blocks used to exchange identities between friends
//!
//! Multi-recipient messages are built on top of these in [`crate::envelope`].

use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, KeyId};
use argon2::{Argon2, Params, Version};
use base64::prelude::*;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Algorithm tag for primary (signing) keys.
pub const SIGNING_ALGORITHM: &str = "ed25519";

/// Algorithm tag for encryption subkeys.
pub const ENCRYPTION_ALGORITHM: &str = "x25519";

/// Size of symmetric keys in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of KDF salts in bytes.
pub const SALT_SIZE: usize = 16;

/// Size of ChaCha20-Poly1305 nonces in bytes.
pub const NONCE_SIZE: usize = 12;

const ARMOR_LABEL: &str = "PEERBOX PUBLIC KEY BLOCK";
const USER_ID_CONTEXT: &[u8] = b"peerbox user id\0";
const BINDING_CONTEXT: &[u8] = b"peerbox subkey binding\0";

/// Symmetric key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Argon2id cost parameters.
///
/// Stored alongside every passphrase-protected container so that opening it
/// never depends on the defaults of the running binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Iterations.
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and throwaway accounts.
    pub fn fast() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives a symmetric key from a passphrase with Argon2id.
pub fn derive_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<SymmetricKey> {
    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    Ok(SymmetricKey::from_bytes(key))
}

/// Encrypts `plaintext` under `key`, returning the random nonce and ciphertext.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    Ok((nonce, ciphertext))
}

/// Decrypts data produced by [`seal`]. Fails on a wrong key or tampered data.
pub fn open(key: &SymmetricKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(Error::Decryption(format!(
            "invalid nonce length {}",
            nonce.len()
        )));
    }
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decryption("wrong key or tampered data".to_string()))
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Public half of an account: primary key plus encryption subkey.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeys {
    pub signing: VerifyingKey,
    pub encryption: crypto_box::PublicKey,
}

impl PublicKeys {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(SIGNING_ALGORITHM, self.signing.as_bytes())
    }

    pub fn encryption_fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(ENCRYPTION_ALGORITHM, self.encryption.as_bytes())
    }

    /// Key IDs of the primary key and the encryption subkey, in that order.
    pub fn key_ids(&self) -> [KeyId; 2] {
        [
            self.fingerprint().key_id(),
            self.encryption_fingerprint().key_id(),
        ]
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.signing
            .verify(message, signature)
            .map_err(|_| Error::BadSignature)
    }
}

/// Secret key material of an account.
#[derive(Clone)]
pub struct SecretKeys {
    signing: SigningKey,
    encryption: crypto_box::SecretKey,
}

impl SecretKeys {
    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        Self {
            signing: SigningKey::generate(&mut csprng),
            encryption: crypto_box::SecretKey::generate(&mut csprng),
        }
    }

    pub fn from_bytes(signing: [u8; 32], encryption: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing),
            encryption: crypto_box::SecretKey::from(encryption),
        }
    }

    pub fn signing_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn encryption_bytes(&self) -> [u8; 32] {
        self.encryption.to_bytes()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn encryption_key(&self) -> &crypto_box::SecretKey {
        &self.encryption
    }

    pub fn public(&self) -> PublicKeys {
        PublicKeys {
            signing: self.signing.verifying_key(),
            encryption: self.encryption.public_key(),
        }
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing.sign(data)
    }
}

impl std::fmt::Debug for SecretKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKeys")
            .field("fingerprint", &self.public().fingerprint())
            .finish_non_exhaustive()
    }
}

/// A name and email pair attached to a key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId {
    pub name: String,
    pub email: String,
}

impl UserId {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    fn signed_bytes(&self, fingerprint: &Fingerprint) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.name.len() + self.email.len());
        out.extend_from_slice(USER_ID_CONTEXT);
        out.extend_from_slice(fingerprint.as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.email.as_bytes());
        out
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// A user ID certified by the key it is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUserId {
    #[serde(flatten)]
    pub user_id: UserId,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl SignedUserId {
    pub fn certify(keys: &SecretKeys, user_id: UserId) -> Self {
        let fingerprint = keys.public().fingerprint();
        let signature = keys.sign(&user_id.signed_bytes(&fingerprint));
        Self {
            user_id,
            signature: signature.to_bytes().to_vec(),
        }
    }

    pub fn verify(&self, keys: &PublicKeys) -> Result<()> {
        let signature = signature_from_slice(&self.signature)?;
        keys.verify(&self.user_id.signed_bytes(&keys.fingerprint()), &signature)
    }
}

pub fn signature_from_slice(bytes: &[u8]) -> Result<Signature> {
    let array: [u8; 64] = bytes.try_into().map_err(|_| Error::BadSignature)?;
    Ok(Signature::from_bytes(&array))
}

fn binding_bytes(keys: &PublicKeys) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINDING_CONTEXT.len() + 64);
    out.extend_from_slice(BINDING_CONTEXT);
    out.extend_from_slice(keys.signing.as_bytes());
    out.extend_from_slice(keys.encryption.as_bytes());
    out
}

/// Everything a friend needs to know about an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicIdentity {
    pub keys: PublicKeys,
    pub binding_signature: Vec<u8>,
    pub user_ids: Vec<SignedUserId>,
}

#[derive(Serialize, Deserialize)]
struct PublicIdentityFile {
    signing_key: String,
    encryption_key: String,
    binding_signature: String,
    user_ids: Vec<SignedUserId>,
}

impl PublicIdentity {
    pub fn new(keys: &SecretKeys, user_ids: Vec<SignedUserId>) -> Self {
        let public = keys.public();
        let binding_signature = keys.sign(&binding_bytes(&public)).to_bytes().to_vec();
        Self {
            keys: public,
            binding_signature,
            user_ids,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.keys.fingerprint()
    }

    /// Checks the subkey binding and every user ID certification.
    pub fn verify(&self) -> Result<()> {
        let binding = signature_from_slice(&self.binding_signature)?;
        self.keys.verify(&binding_bytes(&self.keys), &binding)?;
        for user_id in &self.user_ids {
            user_id.verify(&self.keys)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = PublicIdentityFile {
            signing_key: hex::encode(self.keys.signing.as_bytes()),
            encryption_key: hex::encode(self.keys.encryption.as_bytes()),
            binding_signature: hex::encode(&self.binding_signature),
            user_ids: self.user_ids.clone(),
        };
        Ok(serde_json::to_vec(&file)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let file: PublicIdentityFile = serde_json::from_slice(bytes)?;
        let signing = VerifyingKey::from_bytes(&decode_key(&file.signing_key)?)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let encryption = crypto_box::PublicKey::from(decode_key(&file.encryption_key)?);
        let binding_signature =
            hex::decode(&file.binding_signature).map_err(|e| Error::InvalidKey(e.to_string()))?;

        Ok(Self {
            keys: PublicKeys {
                signing,
                encryption,
            },
            binding_signature,
            user_ids: file.user_ids,
        })
    }

    pub fn to_armored(&self) -> Result<String> {
        Ok(armor(ARMOR_LABEL, &self.to_bytes()?))
    }

    /// Parses and verifies an armored public key block.
    pub fn from_armored(text: &str) -> Result<Self> {
        let identity = Self::from_bytes(&dearmor(ARMOR_LABEL, text)?)?;
        identity.verify()?;
        Ok(identity)
    }
}

pub fn decode_key(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidKey(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}

pub fn armor(label: &str, data: &[u8]) -> String {
    let encoded = BASE64_STANDARD.encode(data);
    let mut out = format!("-----BEGIN {}-----\n\n", label);
    for line in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

pub fn dearmor(label: &str, text: &str) -> Result<Vec<u8>> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let start = text
        .find(&begin)
        .ok_or_else(|| Error::Armor(format!("missing '{}'", begin)))?
        + begin.len();
    let stop = text[start..]
        .find(&end)
        .ok_or_else(|| Error::Armor(format!("missing '{}'", end)))?
        + start;

    let body: String = text[start..stop]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(':'))
        .collect();

    BASE64_STANDARD
        .decode(body)
        .map_err(|e| Error::Armor(e.to_string()))
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
