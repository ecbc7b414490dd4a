//! Friend keyring.
//!
//! A keyring is a directory of `<fingerprint>.friend` entries, each one an
//! envelope encrypted to and signed by the owning account, plus any number of
//! nested sub-keyrings used to group friends. The same friend may be copied
//! into several groups.

use crate::account::Account;
use crate::crypto::{PublicIdentity, PublicKeys, UserId};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, KeyId};
use crate::storage::{replace_file, FileStore};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

/// File extension of keyring entries.
pub const FRIEND_EXTENSION: &str = "friend";

/// A verified public identity of someone else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Friend {
    identity: PublicIdentity,
    fingerprint: Fingerprint,
}

impl Friend {
    /// Wraps `identity` after checking its subkey binding and user IDs.
    pub fn from_identity(identity: PublicIdentity) -> Result<Self> {
        identity.verify()?;
        let fingerprint = identity.fingerprint();
        Ok(Self {
            identity,
            fingerprint,
        })
    }

    pub fn from_armored(text: &str) -> Result<Self> {
        Self::from_identity(PublicIdentity::from_armored(text)?)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    pub fn keys(&self) -> &PublicKeys {
        &self.identity.keys
    }

    pub fn key_ids(&self) -> [KeyId; 2] {
        self.identity.keys.key_ids()
    }

    /// True if `key_id` names the primary key or the encryption subkey.
    pub fn matches_key_id(&self, key_id: &KeyId) -> bool {
        self.key_ids().contains(key_id)
    }

    pub fn user_ids(&self) -> impl Iterator<Item = &UserId> {
        self.identity.user_ids.iter().map(|u| &u.user_id)
    }

    pub fn primary_user_id(&self) -> Option<&UserId> {
        self.user_ids().next()
    }

    pub fn to_armored(&self) -> Result<String> {
        self.identity.to_armored()
    }
}

impl fmt::Display for Friend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary_user_id() {
            Some(uid) => write!(f, "{} {}", self.fingerprint, uid),
            None => write!(f, "{}", self.fingerprint),
        }
    }
}

/// Friends keyed by fingerprint, with a key ID lookup table.
#[derive(Debug, Clone, Default)]
pub struct FriendIndex {
    friends: HashMap<Fingerprint, Friend>,
    by_key_id: HashMap<KeyId, Fingerprint>,
}

impl FriendIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `friend`, returning false if the fingerprint was already present.
    pub fn insert(&mut self, friend: Friend) -> bool {
        let fingerprint = friend.fingerprint();
        if self.friends.contains_key(&fingerprint) {
            return false;
        }
        for key_id in friend.key_ids() {
            self.by_key_id.insert(key_id, fingerprint);
        }
        self.friends.insert(fingerprint, friend);
        true
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&Friend> {
        self.friends.get(fingerprint)
    }

    pub fn by_key_id(&self, key_id: &KeyId) -> Option<&Friend> {
        self.by_key_id
            .get(key_id)
            .and_then(|fp| self.friends.get(fp))
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.friends.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Friend> {
        self.friends.values()
    }
}

impl FromIterator<Friend> for FriendIndex {
    fn from_iter<I: IntoIterator<Item = Friend>>(iter: I) -> Self {
        let mut index = Self::new();
        for friend in iter {
            index.insert(friend);
        }
        index
    }
}

/// A keyring directory. Sub-keyrings are subdirectories.
#[derive(Debug, Clone)]
pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Group name; the directory name of this keyring.
    pub fn name(&self) -> Option<&str> {
        self.dir.file_name().and_then(|n| n.to_str())
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{}", fingerprint.to_hex(), FRIEND_EXTENSION))
    }

    /// Imports an armored public key block into the root of this keyring.
    pub async fn add_friend<R>(&self, account: &Account, mut reader: R) -> Result<Friend>
    where
        R: AsyncRead + Unpin,
    {
        let mut armored = String::new();
        reader.read_to_string(&mut armored).await?;
        let friend = Friend::from_armored(&armored)?;
        if friend.fingerprint() == account.fingerprint() {
            return Err(Error::InvalidKey("cannot add own key as a friend".into()));
        }

        self.write_entry(account, &friend).await?;
        info!("Added friend {}", friend);
        Ok(friend)
    }

    async fn write_entry(&self, account: &Account, friend: &Friend) -> Result<()> {
        let sealed = account.encrypt(&friend.identity.to_bytes()?, &[])?;
        fs::create_dir_all(&self.dir).await?;
        replace_file(&self.entry_path(&friend.fingerprint()), &sealed).await
    }

    async fn read_entry(account: &Account, path: &Path) -> Result<Friend> {
        let data = fs::read(path).await.map_err(|source| Error::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let opened = account.decrypt(&data)?;
        opened.verify(&account.secret_keys().public())?;
        Friend::from_identity(PublicIdentity::from_bytes(&opened.content)?)
    }

    /// Entry files of the whole tree, depth first: a keyring's own entries
    /// come before those of its sub-keyrings.
    async fn walk(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut stack = vec![self.dir.clone()];

        while let Some(dir) = stack.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    subdirs.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some(FRIEND_EXTENSION) {
                    files.push(path);
                }
            }
            files.sort();
            subdirs.sort();
            entries.extend(files);
            stack.extend(subdirs.into_iter().rev());
        }

        Ok(entries)
    }

    /// Deletes every entry for `fingerprint` anywhere in the tree and stops
    /// following it.
    pub async fn remove_friend(&self, store: &FileStore, fingerprint: &Fingerprint) -> Result<()> {
        let file_name = format!("{}.{}", fingerprint.to_hex(), FRIEND_EXTENSION);
        let mut removed = 0;
        for path in self.walk().await? {
            if path.file_name().and_then(|n| n.to_str()) == Some(file_name.as_str()) {
                fs::remove_file(&path).await?;
                debug!("Removed keyring entry {}", path.display());
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(Error::FriendNotFound(fingerprint.to_hex()));
        }

        store.unfollow(fingerprint).await?;
        info!("Removed friend {} ({} entries)", fingerprint, removed);
        Ok(())
    }

    /// Every entry in the tree, decrypted. Fails on the first entry that
    /// cannot be decrypted or verified.
    pub async fn list_friends(&self, account: &Account) -> Result<Vec<Friend>> {
        let mut friends = Vec::new();
        for path in self.walk().await? {
            let friend = Self::read_entry(account, &path)
                .await
                .map_err(|source| Error::KeyringEntry {
                    path: path.clone(),
                    source: Box::new(source),
                })?;
            friends.push(friend);
        }
        Ok(friends)
    }

    /// The whole tree flattened and deduplicated by fingerprint.
    pub async fn friends_set(&self, account: &Account) -> Result<FriendIndex> {
        Ok(self.list_friends(account).await?.into_iter().collect())
    }

    pub async fn find_by_fingerprint(
        &self,
        account: &Account,
        fingerprint: &Fingerprint,
    ) -> Result<Friend> {
        let file_name = format!("{}.{}", fingerprint.to_hex(), FRIEND_EXTENSION);
        for path in self.walk().await? {
            if path.file_name().and_then(|n| n.to_str()) == Some(file_name.as_str()) {
                return Self::read_entry(account, &path).await;
            }
        }
        Err(Error::FriendNotFound(fingerprint.to_hex()))
    }

    /// Finds the friend owning `key_id`, as primary key or subkey.
    pub async fn find_by_key_id(&self, account: &Account, key_id: &KeyId) -> Result<Friend> {
        for path in self.walk().await? {
            let friend = Self::read_entry(account, &path).await?;
            if friend.matches_key_id(key_id) {
                return Ok(friend);
            }
        }
        Err(Error::FriendNotFound(key_id.to_string()))
    }

    /// Opens the sub-keyring `name`, creating it if needed.
    pub async fn sub_keyring(&self, name: &str) -> Result<Keyring> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || name.ends_with(&format!(".{}", FRIEND_EXTENSION))
        {
            return Err(Error::InvalidName(name.to_string()));
        }
        let keyring = Keyring::new(self.dir.join(name));
        fs::create_dir_all(&keyring.dir).await?;
        Ok(keyring)
    }

    /// Immediate sub-keyrings, sorted by name.
    pub async fn sub_keyrings(&self) -> Result<Vec<Keyring>> {
        let mut read_dir = match fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keyrings = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                keyrings.push(Keyring::new(entry.path()));
            }
        }
        keyrings.sort_by(|a, b| a.dir.cmp(&b.dir));
        Ok(keyrings)
    }

    /// Copies `friend` into the sub-keyring `group`.
    pub async fn add_to_group(&self, account: &Account, friend: &Friend, group: &str) -> Result<Keyring> {
        let keyring = self.sub_keyring(group).await?;
        keyring.write_entry(account, friend).await?;
        debug!("Added {} to group {}", friend.fingerprint(), group);
        Ok(keyring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountOptions;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn account(dir: &TempDir, name: &str) -> Account {
        Account::create(
            dir.path(),
            name,
            &format!("{}@example.com", name.to_lowercase()),
            "pw",
            &AccountOptions::fast(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_find_friend() {
        let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let alice = account(&a_dir, "Alice");
        let bob = account(&b_dir, "Bob");

        let armored = bob.export_public_key().unwrap();
        let friend = alice
            .keyring()
            .add_friend(&alice, armored.as_bytes())
            .await
            .unwrap();
        assert_eq!(friend.fingerprint(), bob.fingerprint());
        assert_eq!(friend.primary_user_id().unwrap().name, "Bob");

        let found = alice
            .keyring()
            .find_by_fingerprint(&alice, &bob.fingerprint())
            .await
            .unwrap();
        assert_eq!(found, friend);

        let [primary_id, subkey_id] = friend.key_ids();
        for key_id in [primary_id, subkey_id] {
            let by_id = alice.keyring().find_by_key_id(&alice, &key_id).await.unwrap();
            assert_eq!(by_id.fingerprint(), bob.fingerprint());
        }
    }

    #[tokio::test]
    async fn test_own_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let alice = account(&dir, "Alice");
        let armored = alice.export_public_key().unwrap();
        let result = alice.keyring().add_friend(&alice, armored.as_bytes()).await;
        assert_matches!(result, Err(Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_groups_are_deduplicated_in_set() {
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
        let alice = account(&dirs[0], "Alice");
        let bob = account(&dirs[1], "Bob");
        let carol = account(&dirs[2], "Carol");

        let keyring = alice.keyring();
        let bob_friend = keyring
            .add_friend(&alice, bob.export_public_key().unwrap().as_bytes())
            .await
            .unwrap();
        keyring
            .add_friend(&alice, carol.export_public_key().unwrap().as_bytes())
            .await
            .unwrap();
        keyring.add_to_group(&alice, &bob_friend, "work").await.unwrap();
        let work = keyring.sub_keyring("work").await.unwrap();
        let nested = work.sub_keyring("team").await.unwrap();
        nested.write_entry(&alice, &bob_friend).await.unwrap();

        assert_eq!(keyring.list_friends(&alice).await.unwrap().len(), 4);
        let set = keyring.friends_set(&alice).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&bob.fingerprint()));
        assert!(set.by_key_id(&bob.public_identity().keys.key_ids()[1]).is_some());

        let groups = keyring.sub_keyrings().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name(), Some("work"));
    }

    #[tokio::test]
    async fn test_foreign_entry_fails_whole_listing() {
        let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let alice = account(&a_dir, "Alice");
        let bob = account(&b_dir, "Bob");
        alice
            .keyring()
            .add_friend(&alice, bob.export_public_key().unwrap().as_bytes())
            .await
            .unwrap();

        // An entry sealed by someone else cannot be opened by alice.
        let foreign = bob.encrypt(b"{}", &[]).unwrap();
        let bogus = alice.keyring_dir().join(format!("{}.friend", "ab".repeat(20)));
        std::fs::write(&bogus, foreign).unwrap();

        let result = alice.keyring().list_friends(&alice).await;
        assert_matches!(result, Err(Error::KeyringEntry { path, .. }) if path == bogus);
        assert!(alice.keyring().friends_set(&alice).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_friend_clears_groups_and_unfollows() {
        let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let alice = account(&a_dir, "Alice");
        let bob = account(&b_dir, "Bob");
        let store = FileStore::for_account(&alice);

        let keyring = alice.keyring();
        let friend = keyring
            .add_friend(&alice, bob.export_public_key().unwrap().as_bytes())
            .await
            .unwrap();
        keyring.add_to_group(&alice, &friend, "family").await.unwrap();
        store.follow(&bob.fingerprint()).await.unwrap();

        keyring.remove_friend(&store, &bob.fingerprint()).await.unwrap();
        assert!(keyring.list_friends(&alice).await.unwrap().is_empty());
        assert!(!store.is_following(&bob.fingerprint()).await);
        assert_matches!(
            keyring.remove_friend(&store, &bob.fingerprint()).await,
            Err(Error::FriendNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_missing_friend_is_not_found() {
        let dir = TempDir::new().unwrap();
        let alice = account(&dir, "Alice");
        let missing = Fingerprint::from_bytes([1; 20]);
        let result = alice.keyring().find_by_fingerprint(&alice, &missing).await;
        assert_matches!(result, Err(Error::FriendNotFound(_)));
    }
}
