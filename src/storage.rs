use crate::account::Account;
use crate::crypto::sha256_hex;
use crate::envelope::{self, OpenedMessage};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::keyring::{Friend, FriendIndex};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Extension appended to every stored file name.
pub const FILE_EXTENSION: &str = "pbx";

/// Suffix of the directory holding a file's previous contents.
pub const VERSIONS_SUFFIX: &str = ".versions";

/// One row of a remote listing, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// A current file with the metadata used for listing.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub file: StoredFile,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Per-identity encrypted file tree rooted at the account directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_account(account: &Account) -> Self {
        Self::new(account.root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a followed identity.
    pub fn identity_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.to_hex())
    }

    fn hidden_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(format!(".{}", fingerprint.to_hex()))
    }

    /// Encrypts the contents of `reader` for `account` and `recipients`, signs
    /// them and stores the result under the account's own directory.
    pub async fn add_file<R>(
        &self,
        account: &Account,
        mut reader: R,
        name: &str,
        recipients: &[&Friend],
    ) -> Result<StoredFile>
    where
        R: AsyncRead + Unpin,
    {
        let name = normalize_name(name)?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        let sealed = account.encrypt(&content, recipients)?;
        let file = self.put_file(&account.fingerprint(), &name, &sealed).await?;
        info!(
            "Added {} for {} recipient(s)",
            file.name(),
            recipients.len() + 1
        );
        Ok(file)
    }

    /// Stores already encrypted bytes, keeping the previous content as a
    /// version. Writing the current content again changes nothing.
    pub async fn put_file(&self, owner: &Fingerprint, name: &str, data: &[u8]) -> Result<StoredFile> {
        let name = normalize_name(name)?;
        let path = self.identity_dir(owner).join(&name);
        let file = StoredFile::current(*owner, name, path.clone());

        match fs::read(&path).await {
            Ok(previous) if previous == data => {
                debug!("{} unchanged", file.name());
                return Ok(file);
            }
            Ok(previous) => {
                let hash = sha256_hex(&previous);
                let version_path = file.versions_dir().join(&hash);
                if fs::metadata(&version_path).await.is_err() {
                    replace_file(&version_path, &previous).await?;
                    debug!("Kept version {} of {}", hash, file.name());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(Error::Unreadable { path, source }),
        }

        replace_file(&path, data).await?;
        Ok(file)
    }

    /// Removes a current file together with its versions, or a single version.
    pub async fn remove_file(&self, file: &StoredFile) -> Result<()> {
        match fs::remove_file(file.path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(file.name().to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        if !file.is_version() {
            match fs::remove_dir_all(file.versions_dir()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("Removed {}", file.name());
        Ok(())
    }

    /// The current file `name` of `owner`.
    pub async fn file(&self, owner: &Fingerprint, name: &str) -> Result<StoredFile> {
        let name = normalize_name(name)?;
        let path = self.identity_dir(owner).join(&name);
        if !is_file(&path).await {
            return Err(Error::FileNotFound(name));
        }
        Ok(StoredFile::current(*owner, name, path))
    }

    /// The version of `name` whose content hashes to `hash`.
    pub async fn version(&self, owner: &Fingerprint, name: &str, hash: &str) -> Result<StoredFile> {
        let name = normalize_name(name)?;
        if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidName(format!("{}.version/{}", name, hash)));
        }
        let current = StoredFile::current(*owner, name.clone(), self.identity_dir(owner).join(&name));
        let path = current.versions_dir().join(hash);
        if !is_file(&path).await {
            return Err(Error::VersionNotFound {
                name,
                hash: hash.to_string(),
            });
        }
        Ok(StoredFile::version(*owner, name, hash.to_string(), path))
    }

    /// Current files of `owner` modified at or after `after`, oldest first,
    /// at most `limit` of them (0 for no limit). Entries that cannot be read
    /// are skipped.
    pub async fn list_files(
        &self,
        owner: &Fingerprint,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<FileInfo>> {
        let base = self.identity_dir(owner);
        let mut files = Vec::new();
        let mut stack = vec![base.clone()];

        while let Some(dir) = stack.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) => {
                    if dir != base || e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Skipping {}: {}", dir.display(), e);
                    }
                    continue;
                }
            };

            loop {
                let entry = match read_dir.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error reading {}: {}", dir.display(), e);
                        break;
                    }
                };
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if file_name.starts_with('.') {
                    continue;
                }

                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        debug!("Skipping {}: {}", entry.path().display(), e);
                        continue;
                    }
                };
                if metadata.is_dir() {
                    if !file_name.ends_with(VERSIONS_SUFFIX) {
                        stack.push(entry.path());
                    }
                    continue;
                }
                if !metadata.is_file() {
                    continue;
                }

                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                let modified = DateTime::<Utc>::from(modified);
                if after.is_some_and(|after| modified < after) {
                    continue;
                }

                let path = entry.path();
                let Some(name) = relative_name(&base, &path) else {
                    continue;
                };
                files.push(FileInfo {
                    file: StoredFile::current(*owner, name, path),
                    size: metadata.len(),
                    modified,
                });
            }
        }

        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.file.name.cmp(&b.file.name)));
        if limit > 0 {
            files.truncate(limit);
        }
        Ok(files)
    }

    /// Starts following `fingerprint`.
    pub async fn follow(&self, fingerprint: &Fingerprint) -> Result<()> {
        let visible = self.identity_dir(fingerprint);
        if is_dir(&visible).await {
            return Ok(());
        }
        let hidden = self.hidden_dir(fingerprint);
        if is_dir(&hidden).await {
            fs::rename(&hidden, &visible).await?;
        } else {
            fs::create_dir_all(&visible).await?;
        }
        info!("Following {}", fingerprint);
        Ok(())
    }

    /// Stops following `fingerprint`, keeping its files hidden.
    pub async fn unfollow(&self, fingerprint: &Fingerprint) -> Result<()> {
        let hidden = self.hidden_dir(fingerprint);
        let visible = self.identity_dir(fingerprint);
        if is_dir(&visible).await {
            if is_dir(&hidden).await {
                fs::remove_dir_all(&hidden).await?;
            }
            fs::rename(&visible, &hidden).await?;
            info!("Stopped following {}", fingerprint);
        } else if !is_dir(&hidden).await {
            fs::create_dir_all(&hidden).await?;
        }
        Ok(())
    }

    pub async fn is_following(&self, fingerprint: &Fingerprint) -> bool {
        is_dir(&self.identity_dir(fingerprint)).await
    }

    /// Every followed fingerprint, including the account's own.
    pub async fn followed(&self) -> Result<Vec<Fingerprint>> {
        let mut read_dir = fs::read_dir(&self.root).await?;
        let mut followed = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(fp) = entry
                .file_name()
                .to_str()
                .and_then(|name| Fingerprint::parse(name).ok())
            {
                followed.push(fp);
            }
        }
        followed.sort();
        Ok(followed)
    }
}

/// A current file or one of its versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    owner: Fingerprint,
    name: String,
    version: Option<String>,
    path: PathBuf,
}

impl StoredFile {
    fn current(owner: Fingerprint, name: String, path: PathBuf) -> Self {
        Self {
            owner,
            name,
            version: None,
            path,
        }
    }

    fn version(owner: Fingerprint, name: String, hash: String, path: PathBuf) -> Self {
        Self {
            owner,
            name,
            version: Some(hash),
            path,
        }
    }

    pub fn owner(&self) -> &Fingerprint {
        &self.owner
    }

    /// Name relative to the owner's directory, e.g. `notes/todo.pbx`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_version(&self) -> bool {
        self.version.is_some()
    }

    /// Content hash of a version file.
    pub fn version_hash(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn versions_dir(&self) -> PathBuf {
        if self.is_version() {
            return self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        }
        let mut dir = self.path.clone().into_os_string();
        dir.push(VERSIONS_SUFFIX);
        PathBuf::from(dir)
    }

    /// True when nothing exists at the file's path.
    pub async fn deleted(&self) -> bool {
        fs::symlink_metadata(&self.path).await.is_err()
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).await.map_err(|source| Error::Unreadable {
            path: self.path.clone(),
            source,
        })
    }

    /// Previous contents of a current file, in no particular order.
    pub async fn versions(&self) -> Result<Vec<StoredFile>> {
        if self.is_version() {
            return Ok(Vec::new());
        }
        let mut read_dir = match fs::read_dir(self.versions_dir()).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let Some(hash) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if hash.starts_with('.') {
                continue;
            }
            versions.push(StoredFile::version(self.owner, self.name.clone(), hash, entry.path()));
        }
        Ok(versions)
    }

    /// Friends the file is encrypted for. Only the envelope header is read;
    /// key IDs of unknown parties are skipped.
    pub async fn recipients(&self, friends: &FriendIndex) -> Result<Vec<Fingerprint>> {
        let header = self.read_header().await?;
        let mut recipients = Vec::new();
        for key_id in envelope::recipient_key_ids(&header)? {
            if let Some(friend) = friends.by_key_id(&key_id) {
                if !recipients.contains(&friend.fingerprint()) {
                    recipients.push(friend.fingerprint());
                }
            }
        }
        Ok(recipients)
    }

    async fn read_header(&self) -> Result<Vec<u8>> {
        let unreadable = |source| Error::Unreadable {
            path: self.path.clone(),
            source,
        };
        let mut file = fs::File::open(&self.path).await.map_err(unreadable)?;
        let mut prefix = [0u8; 8];
        match file.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::MalformedMessage("not a PeerBox message".into()))
            }
            Err(e) => return Err(unreadable(e)),
        }
        let header_len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        if header_len > envelope::MAX_HEADER_SIZE {
            return Err(Error::MalformedMessage("header too large".into()));
        }

        let mut header = vec![0u8; 8 + header_len];
        header[..8].copy_from_slice(&prefix);
        file.read_exact(&mut header[8..]).await.map_err(unreadable)?;
        Ok(header)
    }

    /// Decrypts the file for `account` without checking the signature.
    pub async fn decrypt(&self, account: &Account) -> Result<OpenedMessage> {
        account.decrypt(&self.read().await?)
    }

    /// Checks that the file was signed by `expected`.
    ///
    /// The signer must be the account itself or a known friend; the failure
    /// cases are reported as distinct errors.
    pub async fn verify_signature(
        &self,
        account: &Account,
        friends: &FriendIndex,
        expected: &Fingerprint,
    ) -> Result<()> {
        let opened = self.decrypt(account).await?;
        let own_keys = account.secret_keys().public();
        let signer_keys = if opened.signer == account.fingerprint() {
            &own_keys
        } else {
            friends
                .get(&opened.signer)
                .map(Friend::keys)
                .ok_or(Error::UnknownSigner(opened.signer))?
        };
        if opened.signer != *expected {
            return Err(Error::UnexpectedSigner {
                expected: *expected,
                actual: opened.signer,
            });
        }
        opened.verify(signer_keys)
    }
}

/// Validates a relative file name and appends the file extension if missing.
pub fn normalize_name(name: &str) -> Result<String> {
    let invalid = || Error::InvalidName(name.to_string());
    if name.is_empty() || name.contains('\\') || name.contains('\0') || name.starts_with('/') {
        return Err(invalid());
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(invalid)?;
                if part.starts_with('.')
                    || part.ends_with(VERSIONS_SUFFIX)
                    || part.ends_with(".version")
                {
                    return Err(invalid());
                }
            }
            _ => return Err(invalid()),
        }
    }
    if name.ends_with('/') {
        return Err(invalid());
    }

    let suffix = format!(".{}", FILE_EXTENSION);
    if name.ends_with(&suffix) {
        Ok(name.to_string())
    } else {
        Ok(format!("{}{}", name, suffix))
    }
}

fn relative_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

/// Replaces `path` with `data` by writing a hidden sibling and renaming it.
pub(crate) async fn replace_file(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidName(path.display().to_string()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidName(path.display().to_string()))?;
    fs::create_dir_all(parent).await?;

    let tmp = parent.join(format!(".{}.{:016x}.tmp", file_name, rand::thread_rng().next_u64()));
    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
