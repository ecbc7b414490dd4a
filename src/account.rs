//! # Accounts
//!
//! An [`Account`] owns one primary signing key, one encryption subkey and a
//! list of self-certified user IDs. It lives under an account root directory:
//!
//! ```text
//! <root>/
//! ├── .account/
//! │   ├── secring.json        passphrase-protected key material
//! │   ├── keyring/            friends, see crate::keyring
//! │   └── sync_cursor.json    see crate::sync
//! ├── <fingerprint>/          files of followed identities (own included)
//! └── .<fingerprint>/         files of known but unfollowed identities
//! ```
//!
//! The container is sealed with a key derived from the passphrase by
//! Argon2id. Every mutation rewrites it through a temporary file in the same
//! directory followed by a rename, so a crash leaves either the old or the new
//! container on disk.

use crate::crypto::{
    self, derive_key, random_salt, KdfParams, PublicIdentity, SecretKeys, SignedUserId,
    SymmetricKey, UserId, SALT_SIZE,
};
use crate::envelope::{self, OpenedMessage};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::keyring::{Friend, FriendIndex, Keyring};
use base64::prelude::*;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroize;

/// Name of the per-account metadata directory under the account root.
pub const METADATA_DIR: &str = ".account";

const CONTAINER_FILE: &str = "secring.json";
const KEYRING_DIR: &str = "keyring";
const CONTAINER_VERSION: u32 = 1;

/// Options for creating an account.
#[derive(Debug, Clone, Default)]
pub struct AccountOptions {
    /// Cost of the passphrase key derivation. Stored in the container.
    pub kdf: KdfParams,
}

impl AccountOptions {
    /// Options with a cheap key derivation, for tests.
    pub fn fast() -> Self {
        Self {
            kdf: KdfParams::fast(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Container {
    version: u32,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
}

#[derive(Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
struct SecretMaterial {
    signing_key: String,
    encryption_key: String,
    #[zeroize(skip)]
    user_ids: Vec<SignedUserId>,
    primary: usize,
}

/// An opened account.
pub struct Account {
    root: PathBuf,
    keys: SecretKeys,
    user_ids: Vec<SignedUserId>,
    primary: usize,
    kdf: KdfParams,
    salt: [u8; SALT_SIZE],
    wrapping_key: SymmetricKey,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("root", &self.root)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl Account {
    /// Creates a new account under `root`.
    pub fn create(
        root: impl AsRef<Path>,
        name: &str,
        email: &str,
        passphrase: &str,
        options: &AccountOptions,
    ) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::EmptyPassphrase);
        }
        let root = root.as_ref().to_path_buf();
        let container_path = container_path(&root);
        if container_path.exists() {
            return Err(Error::AccountExists(container_path));
        }

        let keys = SecretKeys::generate();
        let user_id = SignedUserId::certify(&keys, UserId::new(name, email));
        let salt = random_salt();
        let wrapping_key = derive_key(passphrase, &salt, &options.kdf)?;

        let account = Self {
            root,
            keys,
            user_ids: vec![user_id],
            primary: 0,
            kdf: options.kdf,
            salt,
            wrapping_key,
        };

        std::fs::create_dir_all(account.metadata_dir())?;
        std::fs::create_dir_all(account.keyring_dir())?;
        account.persist()?;
        std::fs::create_dir_all(account.root.join(account.fingerprint().to_hex()))?;

        info!(
            "Created account {} for {}",
            account.fingerprint(),
            account.primary_user_id()
        );
        Ok(account)
    }

    /// Opens the account under `root`.
    ///
    /// A wrong passphrase fails on the first attempt with
    /// [`Error::IncorrectPassphrase`].
    pub fn open(root: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let path = container_path(&root);

        let data = match std::fs::read(&path) {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => return Err(Error::NoIdentity(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoIdentity(path))
            }
            Err(e) => return Err(Error::Unreadable { path, source: e }),
        };
        let container: Container =
            serde_json::from_slice(&data).map_err(|_| Error::NoIdentity(path.clone()))?;
        if container.version != CONTAINER_VERSION {
            return Err(Error::NoIdentity(path));
        }

        let salt: [u8; SALT_SIZE] = hex::decode(&container.salt)
            .ok()
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::NoIdentity(path.clone()))?;
        let nonce = hex::decode(&container.nonce).map_err(|_| Error::NoIdentity(path.clone()))?;
        let ciphertext = BASE64_STANDARD
            .decode(&container.ciphertext)
            .map_err(|_| Error::NoIdentity(path.clone()))?;

        let wrapping_key = derive_key(passphrase, &salt, &container.kdf)?;
        let mut plaintext = crypto::open(&wrapping_key, &nonce, &ciphertext)
            .map_err(|_| Error::IncorrectPassphrase)?;

        let material: std::result::Result<SecretMaterial, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        let material = material.map_err(|_| Error::NoIdentity(path.clone()))?;

        let keys = SecretKeys::from_bytes(
            crypto::decode_key(&material.signing_key)?,
            crypto::decode_key(&material.encryption_key)?,
        );
        if material.user_ids.is_empty() || material.primary >= material.user_ids.len() {
            return Err(Error::NoIdentity(path));
        }

        let account = Self {
            root,
            keys,
            user_ids: material.user_ids.clone(),
            primary: material.primary,
            kdf: container.kdf,
            salt,
            wrapping_key,
        };
        debug!("Opened account {}", account.fingerprint());
        Ok(account)
    }

    fn persist(&self) -> Result<()> {
        let material = SecretMaterial {
            signing_key: hex::encode(self.keys.signing_bytes()),
            encryption_key: hex::encode(self.keys.encryption_bytes()),
            user_ids: self.user_ids.clone(),
            primary: self.primary,
        };
        let mut plaintext = serde_json::to_vec(&material)?;
        let sealed = crypto::seal(&self.wrapping_key, &plaintext);
        plaintext.zeroize();
        let (nonce, ciphertext) = sealed?;

        let container = Container {
            version: CONTAINER_VERSION,
            kdf: self.kdf,
            salt: hex::encode(self.salt),
            nonce: hex::encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        };
        let json = serde_json::to_vec_pretty(&container)?;
        write_atomic(&container_path(&self.root), &json)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    pub fn keyring_dir(&self) -> PathBuf {
        self.metadata_dir().join(KEYRING_DIR)
    }

    /// The root keyring of this account.
    pub fn keyring(&self) -> Keyring {
        Keyring::new(self.keyring_dir())
    }

    /// Loads every friend into an index. See [`Keyring::friends_set`].
    pub async fn friends(&self) -> Result<FriendIndex> {
        self.keyring().friends_set(self).await
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.keys.public().fingerprint()
    }

    pub fn secret_keys(&self) -> &SecretKeys {
        &self.keys
    }

    pub fn user_ids(&self) -> impl Iterator<Item = &UserId> {
        self.user_ids.iter().map(|u| &u.user_id)
    }

    pub fn primary_user_id(&self) -> &UserId {
        &self.user_ids[self.primary].user_id
    }

    /// The public identity handed to friends, primary user ID first.
    pub fn public_identity(&self) -> PublicIdentity {
        let mut user_ids = Vec::with_capacity(self.user_ids.len());
        user_ids.push(self.user_ids[self.primary].clone());
        user_ids.extend(
            self.user_ids
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != self.primary)
                .map(|(_, u)| u.clone()),
        );
        PublicIdentity::new(&self.keys, user_ids)
    }

    /// Armored public key block for this account.
    pub fn export_public_key(&self) -> Result<String> {
        self.public_identity().to_armored()
    }

    pub fn add_user_id(&mut self, name: &str, email: &str) -> Result<()> {
        let user_id = UserId::new(name, email);
        if self.user_ids.iter().any(|u| u.user_id == user_id) {
            return Ok(());
        }
        self.user_ids
            .push(SignedUserId::certify(&self.keys, user_id));
        self.persist()
    }

    /// Removes a user ID. The last remaining user ID cannot be removed.
    pub fn remove_user_id(&mut self, email: &str) -> Result<()> {
        let index = self
            .user_ids
            .iter()
            .position(|u| u.user_id.email == email)
            .ok_or_else(|| Error::UserIdNotFound(email.to_string()))?;
        if self.user_ids.len() == 1 {
            return Err(Error::LastUserId(email.to_string()));
        }

        self.user_ids.remove(index);
        if self.primary == index {
            self.primary = 0;
        } else if self.primary > index {
            self.primary -= 1;
        }
        self.persist()
    }

    pub fn set_primary_user_id(&mut self, email: &str) -> Result<()> {
        self.primary = self
            .user_ids
            .iter()
            .position(|u| u.user_id.email == email)
            .ok_or_else(|| Error::UserIdNotFound(email.to_string()))?;
        self.persist()
    }

    /// Encrypts `content` for this account and every friend in `recipients`,
    /// signed with the account key.
    pub fn encrypt(&self, content: &[u8], recipients: &[&Friend]) -> Result<Vec<u8>> {
        let own = self.keys.public();
        let mut keys = Vec::with_capacity(recipients.len() + 1);
        keys.push(&own);
        keys.extend(recipients.iter().map(|f| f.keys()));
        envelope::seal(content, &self.keys, &keys)
    }

    /// Decrypts a message addressed to this account. The signature is not
    /// checked; see [`OpenedMessage::verify`].
    pub fn decrypt(&self, data: &[u8]) -> Result<OpenedMessage> {
        envelope::open(data, &self.keys)
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.keys.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<()> {
        self.keys.public().verify(data, signature)
    }
}

fn container_path(root: &Path) -> PathBuf {
    root.join(METADATA_DIR).join(CONTAINER_FILE)
}

/// Replaces `path` with `data` through a temporary sibling file.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidName(path.display().to_string()))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
