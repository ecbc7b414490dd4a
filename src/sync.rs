//! # Sync client
//!
//! Pulls a followed friend's files from their server:
//!
//! 1. resolve the friend's address with the configured [`Resolver`]s
//! 2. list the files changed since the last successful sync
//! 3. fetch every file whose local copy differs, checking the declared size
//!    and SHA-256 before anything is written
//!
//! A failing file is reported and skipped; the cursor only moves forward once
//! a run completes without failures or cancellation.

use crate::account::Account;
use crate::crypto::sha256_hex;
use crate::discovery::{resolve_address, Resolver};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::server::format_http_date;
use crate::storage::{normalize_name, replace_file, FileStore, ListEntry};
use crate::tls::TlsIdentity;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::header::IF_MODIFIED_SINCE;
use reqwest::{StatusCode, Url};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CURSOR_FILE: &str = "sync_cursor.json";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time of the last complete sync per friend, persisted as JSON.
#[derive(Debug)]
pub struct SyncCursor {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SyncCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn for_account(account: &Account) -> Self {
        Self::new(account.metadata_dir().join(CURSOR_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!("Ignoring corrupt sync cursor {}: {}", self.path.display(), e);
                Ok(BTreeMap::new())
            }
        }
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.get(&fingerprint.to_hex()).copied())
    }

    pub async fn record(&self, fingerprint: &Fingerprint, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(fingerprint.to_hex(), at);
        replace_file(&self.path, &serde_json::to_vec_pretty(&entries)?).await
    }
}

/// Outcome of syncing one friend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub fingerprint: Fingerprint,
    /// Paths written by this run.
    pub fetched: Vec<String>,
    /// Files whose local copy already matched.
    pub skipped: usize,
    /// Paths that could not be fetched, with the reason.
    pub failed: Vec<(String, String)>,
    pub cancelled: bool,
}

impl SyncReport {
    fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            fetched: Vec::new(),
            skipped: 0,
            failed: Vec::new(),
            cancelled: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

pub struct SyncClient {
    account: Arc<Account>,
    store: FileStore,
    identity: Arc<TlsIdentity>,
    resolvers: Vec<Arc<dyn Resolver>>,
    cursor: SyncCursor,
    timeout: Duration,
}

impl SyncClient {
    pub fn new(account: Arc<Account>, identity: Arc<TlsIdentity>, resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self {
            store: FileStore::for_account(&account),
            cursor: SyncCursor::for_account(&account),
            account,
            identity,
            resolvers,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Syncs every followed friend concurrently.
    pub async fn download_all(&self, cancel: &CancellationToken) -> Result<Vec<(Fingerprint, Result<SyncReport>)>> {
        let own = self.account.fingerprint();
        let friends: Vec<Fingerprint> = self
            .store
            .followed()
            .await?
            .into_iter()
            .filter(|fp| *fp != own)
            .collect();

        let results = join_all(friends.iter().map(|fp| self.download_friend(fp, cancel))).await;
        Ok(friends.into_iter().zip(results).collect())
    }

    /// Pulls the files `fingerprint` has changed since the last complete
    /// sync.
    pub async fn download_friend(&self, fingerprint: &Fingerprint, cancel: &CancellationToken) -> Result<SyncReport> {
        if !self.store.is_following(fingerprint).await {
            return Err(Error::NotFollowing(*fingerprint));
        }
        let started = Utc::now();
        let since = self.cursor.get(fingerprint).await?;

        let address = resolve_address(&self.resolvers, fingerprint, cancel).await?;
        info!("Syncing {} from {}", fingerprint, address);
        let client = self.identity.http_client(*fingerprint, self.timeout)?;
        let base = Url::parse(&format!("https://{}/p2p/{}", address, fingerprint.to_hex()))
            .map_err(|e| Error::InvalidName(e.to_string()))?;

        let entries = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            entries = self.fetch_listing(&client, &base, since) => entries?,
        };
        debug!("{} lists {} files", fingerprint, entries.len());

        let mut report = SyncReport::new(*fingerprint);
        for entry in entries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.download_entry(&client, &base, fingerprint, &entry, cancel).await {
                Ok(true) => report.fetched.push(entry.path),
                Ok(false) => report.skipped += 1,
                Err(Error::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!("Failed to fetch {} from {}: {}", entry.path, fingerprint, e);
                    report.failed.push((entry.path, e.to_string()));
                }
            }
        }

        if report.is_complete() {
            self.cursor.record(fingerprint, started).await?;
        }
        info!(
            "Synced {}: {} fetched, {} unchanged, {} failed{}",
            fingerprint,
            report.fetched.len(),
            report.skipped,
            report.failed.len(),
            if report.cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }

    async fn fetch_listing(
        &self,
        client: &reqwest::Client,
        base: &Url,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ListEntry>> {
        let mut request = client.get(base.clone());
        if let Some(since) = since {
            request = request.header(IF_MODIFIED_SINCE, format_http_date(&since));
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(Vec::new()),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(Error::UnexpectedStatus {
                status: status.as_u16(),
                url: base.to_string(),
            }),
        }
    }

    /// Returns whether anything was written.
    async fn download_entry(
        &self,
        client: &reqwest::Client,
        base: &Url,
        owner: &Fingerprint,
        entry: &ListEntry,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let name = normalize_name(&entry.path)?;
        if self.matches_local(owner, &name, entry).await {
            debug!("{} is up to date", name);
            return Ok(false);
        }

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidName(base.to_string()))?
            .extend(name.split('/'));

        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            data = fetch_bytes(client, url) => data?,
        };

        let size = data.len() as u64;
        if size != entry.size {
            return Err(Error::SizeMismatch {
                path: entry.path.clone(),
                expected: entry.size,
                actual: size,
            });
        }
        let hash = sha256_hex(&data);
        if hash != entry.sha256 {
            return Err(Error::HashMismatch {
                path: entry.path.clone(),
                expected: entry.sha256.clone(),
                actual: hash,
            });
        }

        self.store.put_file(owner, &name, &data).await?;
        debug!("Stored {} ({} bytes)", name, size);
        Ok(true)
    }

    async fn matches_local(&self, owner: &Fingerprint, name: &str, entry: &ListEntry) -> bool {
        let Ok(file) = self.store.file(owner, name).await else {
            return false;
        };
        match file.read().await {
            Ok(data) => data.len() as u64 == entry.size && sha256_hex(&data) == entry.sha256,
            Err(_) => false,
        }
    }
}

async fn fetch_bytes(client: &reqwest::Client, url: Url) -> Result<Vec<u8>> {
    let response = client.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(Error::UnexpectedStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    Ok(response.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountOptions;
    use crate::discovery::StaticResolver;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cursor_starts_empty() {
        let dir = TempDir::new().unwrap();
        let cursor = SyncCursor::new(dir.path().join(CURSOR_FILE));
        assert_eq!(cursor.get(&Fingerprint::from_bytes([1; 20])).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursor_records_per_friend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CURSOR_FILE);
        let a = Fingerprint::from_bytes([1; 20]);
        let b = Fingerprint::from_bytes([2; 20]);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let cursor = SyncCursor::new(&path);
        cursor.record(&a, at).await.unwrap();
        assert_eq!(cursor.get(&a).await.unwrap(), Some(at));
        assert_eq!(cursor.get(&b).await.unwrap(), None);

        let reopened = SyncCursor::new(&path);
        assert_eq!(reopened.get(&a).await.unwrap(), Some(at));
        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("2024-05-01T12:00:00Z"));
    }

    #[tokio::test]
    async fn test_corrupt_cursor_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CURSOR_FILE);
        std::fs::write(&path, b"{ not json").unwrap();
        let cursor = SyncCursor::new(&path);
        assert_eq!(cursor.get(&Fingerprint::from_bytes([1; 20])).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unfollowed_friend_fails_fast() {
        let dir = TempDir::new().unwrap();
        let account = Arc::new(
            Account::create(dir.path(), "A", "a@example.com", "pw", &AccountOptions::fast()).unwrap(),
        );
        let identity = Arc::new(TlsIdentity::for_account(&account, &[]).unwrap());
        let stranger = Fingerprint::from_bytes([9; 20]);
        let resolvers: Vec<Arc<dyn Resolver>> = vec![Arc::new(StaticResolver::default())];
        let client = SyncClient::new(account, identity, resolvers);

        let result = client.download_friend(&stranger, &CancellationToken::new()).await;
        assert_matches!(result, Err(Error::NotFollowing(fp)) if fp == stranger);
    }

    #[test]
    fn test_report_completeness() {
        let mut report = SyncReport::new(Fingerprint::from_bytes([1; 20]));
        assert!(report.is_complete());
        report.failed.push(("a.pbx".into(), "boom".into()));
        assert!(!report.is_complete());
    }
}
