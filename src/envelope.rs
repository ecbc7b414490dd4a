//! Encrypted, signed messages addressed to one or more recipients.
//!
//! Layout on disk:
//!
//! ```text
//! "PBX\x01" | header length (u32, big endian) | header (JSON) | nonce (12) | ciphertext
//! ```
//!
//! The header lists one stanza per recipient: the recipient's encryption key
//! ID and the random session key wrapped to that key with an ephemeral X25519
//! `SalsaBox`. The payload is sealed with the session key and holds the
//! signer's fingerprint, an Ed25519 signature and the content, so the signer
//! is only learned by someone who can decrypt.
//!
//! The header can be read without any secret key, which is what lets the
//! server compute a file's recipients for access control.

use crate::crypto::{self, hex_bytes, PublicKeys, SecretKeys, SymmetricKey, KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, KeyId, FINGERPRINT_LEN};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::SalsaBox;
use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const MAGIC: &[u8; 4] = b"PBX\x01";
const BOX_NONCE_SIZE: usize = 24;
const SIGNATURE_SIZE: usize = 64;
pub(crate) const MAX_HEADER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stanza {
    key_id: KeyId,
    #[serde(with = "hex_bytes")]
    ephemeral_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    wrapped_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    recipients: Vec<Stanza>,
}

/// A decrypted message whose signature has not been checked yet.
#[derive(Debug, Clone)]
pub struct OpenedMessage {
    pub signer: Fingerprint,
    signature: Signature,
    pub content: Vec<u8>,
}

impl OpenedMessage {
    pub fn verify(&self, signer_keys: &PublicKeys) -> Result<()> {
        if signer_keys.fingerprint() != self.signer {
            return Err(Error::UnexpectedSigner {
                expected: signer_keys.fingerprint(),
                actual: self.signer,
            });
        }
        signer_keys.verify(&self.content, &self.signature)
    }
}

/// Encrypts `content` for every key in `recipients` and signs it with `signer`.
///
/// Duplicate recipients are collapsed.
pub fn seal(content: &[u8], signer: &SecretKeys, recipients: &[&PublicKeys]) -> Result<Vec<u8>> {
    let session_key = SymmetricKey::random();

    let mut seen = HashSet::new();
    let mut stanzas = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let key_id = recipient.encryption_fingerprint().key_id();
        if !seen.insert(key_id) {
            continue;
        }
        stanzas.push(wrap_session_key(&session_key, recipient, key_id)?);
    }
    if stanzas.is_empty() {
        return Err(Error::Encryption("no recipients".into()));
    }

    let signature = signer.sign(content);
    let mut payload = Vec::with_capacity(FINGERPRINT_LEN + SIGNATURE_SIZE + content.len());
    payload.extend_from_slice(signer.public().fingerprint().as_bytes());
    payload.extend_from_slice(&signature.to_bytes());
    payload.extend_from_slice(content);

    let (nonce, ciphertext) = crypto::seal(&session_key, &payload)?;

    let header = serde_json::to_vec(&Header {
        recipients: stanzas,
    })?;
    let mut out = Vec::with_capacity(8 + header.len() + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn wrap_session_key(session_key: &SymmetricKey, recipient: &PublicKeys, key_id: KeyId) -> Result<Stanza> {
    let ephemeral = crypto_box::SecretKey::generate(&mut OsRng);
    let sealing_box = SalsaBox::new(&recipient.encryption, &ephemeral);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let wrapped_key = sealing_box
        .encrypt(&nonce, &session_key.as_bytes()[..])
        .map_err(|e| Error::Encryption(e.to_string()))?;

    Ok(Stanza {
        key_id,
        ephemeral_key: ephemeral.public_key().as_bytes().to_vec(),
        nonce: nonce.to_vec(),
        wrapped_key,
    })
}

fn split(data: &[u8]) -> Result<(Header, &[u8])> {
    if data.len() < MAGIC.len() + 4 || &data[..MAGIC.len()] != MAGIC {
        return Err(Error::MalformedMessage("not a PeerBox message".into()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[4..8]);
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    if header_len > MAX_HEADER_SIZE || data.len() < 8 + header_len {
        return Err(Error::MalformedMessage("truncated header".into()));
    }
    let header: Header = serde_json::from_slice(&data[8..8 + header_len])
        .map_err(|e| Error::MalformedMessage(e.to_string()))?;
    Ok((header, &data[8 + header_len..]))
}

/// Key IDs the message was encrypted to, read from the header alone.
pub fn recipient_key_ids(data: &[u8]) -> Result<Vec<KeyId>> {
    let (header, _) = split(data)?;
    Ok(header.recipients.into_iter().map(|s| s.key_id).collect())
}

/// Decrypts a message addressed to `keys`.
pub fn open(data: &[u8], keys: &SecretKeys) -> Result<OpenedMessage> {
    let (header, body) = split(data)?;
    let own_id = keys.public().encryption_fingerprint().key_id();

    let stanza = header
        .recipients
        .iter()
        .find(|s| s.key_id == own_id)
        .ok_or(Error::NotARecipient)?;
    let session_key = unwrap_session_key(stanza, keys)?;

    if body.len() < NONCE_SIZE {
        return Err(Error::MalformedMessage("truncated payload".into()));
    }
    let payload = crypto::open(&session_key, &body[..NONCE_SIZE], &body[NONCE_SIZE..])?;
    if payload.len() < FINGERPRINT_LEN + SIGNATURE_SIZE {
        return Err(Error::MalformedMessage("truncated signature".into()));
    }

    let signer = Fingerprint::from_slice(&payload[..FINGERPRINT_LEN])?;
    let signature =
        crypto::signature_from_slice(&payload[FINGERPRINT_LEN..FINGERPRINT_LEN + SIGNATURE_SIZE])?;

    Ok(OpenedMessage {
        signer,
        signature,
        content: payload[FINGERPRINT_LEN + SIGNATURE_SIZE..].to_vec(),
    })
}

fn unwrap_session_key(stanza: &Stanza, keys: &SecretKeys) -> Result<SymmetricKey> {
    let ephemeral: [u8; 32] = stanza
        .ephemeral_key
        .as_slice()
        .try_into()
        .map_err(|_| Error::MalformedMessage("bad ephemeral key".into()))?;
    if stanza.nonce.len() != BOX_NONCE_SIZE {
        return Err(Error::MalformedMessage("bad stanza nonce".into()));
    }

    let opening_box = SalsaBox::new(&crypto_box::PublicKey::from(ephemeral), keys.encryption_key());
    let key_bytes = opening_box
        .decrypt(GenericArray::from_slice(&stanza.nonce), stanza.wrapped_key.as_slice())
        .map_err(|_| Error::Decryption("cannot unwrap session key".into()))?;

    let key: [u8; KEY_SIZE] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Decryption("bad session key length".into()))?;
    Ok(SymmetricKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_seal_open_for_each_recipient() {
        let alice = SecretKeys::generate();
        let bob = SecretKeys::generate();
        let data = seal(b"hello", &alice, &[&alice.public(), &bob.public()]).unwrap();

        for keys in [&alice, &bob] {
            let opened = open(&data, keys).unwrap();
            assert_eq!(opened.content, b"hello");
            assert_eq!(opened.signer, alice.public().fingerprint());
            opened.verify(&alice.public()).unwrap();
        }
    }

    #[test]
    fn test_outsider_is_not_a_recipient() {
        let alice = SecretKeys::generate();
        let eve = SecretKeys::generate();
        let data = seal(b"hello", &alice, &[&alice.public()]).unwrap();
        assert_matches!(open(&data, &eve), Err(Error::NotARecipient));
    }

    #[test]
    fn test_header_lists_encryption_key_ids_without_duplicates() {
        let alice = SecretKeys::generate();
        let bob = SecretKeys::generate();
        let data = seal(b"x", &alice, &[&alice.public(), &bob.public(), &bob.public()]).unwrap();

        let ids = recipient_key_ids(&data).unwrap();
        assert_eq!(
            ids,
            vec![
                alice.public().key_ids()[1],
                bob.public().key_ids()[1]
            ]
        );
    }

    #[test]
    fn test_tampered_payload_fails_decryption() {
        let alice = SecretKeys::generate();
        let mut data = seal(b"hello", &alice, &[&alice.public()]).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert_matches!(open(&data, &alice), Err(Error::Decryption(_)));
    }

    #[test]
    fn test_wrong_signer_key_is_reported() {
        let alice = SecretKeys::generate();
        let bob = SecretKeys::generate();
        let data = seal(b"hello", &alice, &[&alice.public()]).unwrap();
        let opened = open(&data, &alice).unwrap();
        assert_matches!(
            opened.verify(&bob.public()),
            Err(Error::UnexpectedSigner { .. })
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_matches!(recipient_key_ids(b"plain text"), Err(Error::MalformedMessage(_)));
        assert_matches!(recipient_key_ids(b"PBX\x01\xff\xff\xff\xff"), Err(Error::MalformedMessage(_)));
    }
}
