//! Integration tests for the sync protocol
//!
//! Each test runs real accounts against a real TLS server bound to
//! 127.0.0.1, with addresses supplied by a static resolver.

use assert_matches::assert_matches;
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use peerbox::crypto::sha256_hex;
use peerbox::discovery::{Resolver, StaticResolver};
use peerbox::server::{format_http_date, AppState, Server};
use peerbox::tls::TlsIdentity;
use peerbox::{Account, AccountOptions, Error, FileStore, Fingerprint, Friend, SyncClient};
use pretty_assertions::assert_eq;
use reqwest::header::{IF_MODIFIED_SINCE, RANGE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct TestPeer {
    _dir: TempDir,
    account: Arc<Account>,
    identity: Arc<TlsIdentity>,
    store: FileStore,
}

impl TestPeer {
    fn new(name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let email = format!("{}@example.com", name.to_lowercase());
        let account = Account::create(dir.path(), name, &email, "pw", &AccountOptions::fast()).unwrap();
        let identity = TlsIdentity::for_account(&account, &[]).unwrap();
        let store = FileStore::for_account(&account);
        Self {
            _dir: dir,
            account: Arc::new(account),
            identity: Arc::new(identity),
            store,
        }
    }

    fn fingerprint(&self) -> Fingerprint {
        self.account.fingerprint()
    }

    async fn befriend(&self, other: &TestPeer) -> Friend {
        let armored = other.account.export_public_key().unwrap();
        self.account
            .keyring()
            .add_friend(&self.account, armored.as_bytes())
            .await
            .unwrap()
    }

    async fn write(&self, name: &str, content: &[u8], recipients: &[&Friend]) -> Vec<u8> {
        let file = self
            .store
            .add_file(&self.account, content, name, recipients)
            .await
            .unwrap();
        file.read().await.unwrap()
    }

    /// Serves this peer's store until the token is cancelled.
    async fn serve(&self) -> (SocketAddr, CancellationToken) {
        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            &self.identity,
            AppState::new(self.account.clone()),
            None,
        )
        .await
        .unwrap();
        let address = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (address, cancel)
    }

    fn sync_client(&self, friend: Fingerprint, address: SocketAddr) -> SyncClient {
        let resolvers: Vec<Arc<dyn Resolver>> =
            vec![Arc::new(StaticResolver::new(HashMap::from([(friend, address)])))];
        SyncClient::new(self.account.clone(), self.identity.clone(), resolvers)
            .with_timeout(Duration::from_secs(10))
    }

    fn http_client(&self, server: Fingerprint) -> reqwest::Client {
        self.identity.http_client(server, Duration::from_secs(10)).unwrap()
    }
}

/// Two friends: `a` follows `b`.
async fn friends() -> (TestPeer, TestPeer, Friend) {
    let a = TestPeer::new("Ann");
    let b = TestPeer::new("Bob");
    let friend_a = b.befriend(&a).await;
    a.befriend(&b).await;
    a.store.follow(&b.fingerprint()).await.unwrap();
    (a, b, friend_a)
}

#[tokio::test]
async fn test_friend_file_is_synced_and_decrypts() {
    let (a, b, friend_a) = friends().await;
    let sealed = b.write("hello.txt", b"hello, world", &[&friend_a]).await;
    let (address, stop) = b.serve().await;

    let client = a.sync_client(b.fingerprint(), address);
    let report = client
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.fetched, vec!["hello.txt.pbx".to_string()]);
    assert!(report.is_complete());

    let local = a.store.file(&b.fingerprint(), "hello.txt").await.unwrap();
    let bytes = local.read().await.unwrap();
    assert_eq!(bytes.len(), sealed.len());
    assert_eq!(sha256_hex(&bytes), sha256_hex(&sealed));

    let opened = local.decrypt(&a.account).await.unwrap();
    assert_eq!(opened.content, b"hello, world".to_vec());
    let friends = a.account.friends().await.unwrap();
    local
        .verify_signature(&a.account, &friends, &b.fingerprint())
        .await
        .unwrap();
    assert!(client.cursor().get(&b.fingerprint()).await.unwrap().is_some());

    // Nothing new: nothing fetched.
    let again = client
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(again.fetched.is_empty());
    assert!(again.is_complete());

    // An update arrives and the previous content becomes a version.
    b.write("hello.txt", b"hello again", &[&friend_a]).await;
    let update = client
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(update.fetched, vec!["hello.txt.pbx".to_string()]);
    let local = a.store.file(&b.fingerprint(), "hello.txt").await.unwrap();
    assert_eq!(local.decrypt(&a.account).await.unwrap().content, b"hello again".to_vec());
    assert_eq!(local.versions().await.unwrap().len(), 1);

    stop.cancel();
}

#[tokio::test]
async fn test_matching_local_copy_is_skipped() {
    let (a, b, friend_a) = friends().await;
    b.write("hello.txt", b"hello, world", &[&friend_a]).await;
    let (address, stop) = b.serve().await;
    let client = a.sync_client(b.fingerprint(), address);

    let first = client
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.fetched.len(), 1);

    // Without a cursor the whole directory is listed again.
    std::fs::remove_file(client.cursor().path()).unwrap();
    let report = client
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.fetched.is_empty());
    assert_eq!(report.skipped, 1);
    assert!(report.is_complete());
    assert!(client.cursor().get(&b.fingerprint()).await.unwrap().is_some());

    stop.cancel();
}

#[tokio::test]
async fn test_listing_honors_if_modified_since() {
    let (a, b, friend_a) = friends().await;
    b.write("old.txt", b"old", &[&friend_a]).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let cutoff = chrono::Utc::now();
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.write("new.txt", b"new", &[&friend_a]).await;
    let (address, stop) = b.serve().await;

    let client = a.http_client(b.fingerprint());
    let url = format!("https://{}/p2p/{}", address, b.fingerprint());
    let paths = |listing: Vec<serde_json::Value>| -> Vec<String> {
        listing
            .iter()
            .map(|entry| entry["path"].as_str().unwrap().to_string())
            .collect()
    };

    let everything: Vec<serde_json::Value> = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(paths(everything), vec!["old.txt.pbx".to_string(), "new.txt.pbx".to_string()]);

    let recent: Vec<serde_json::Value> = client
        .get(&url)
        .header(IF_MODIFIED_SINCE, format_http_date(&cutoff))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(paths(recent), vec!["new.txt.pbx".to_string()]);

    stop.cancel();
}

#[tokio::test]
async fn test_private_file_is_not_synced() {
    let (a, b, friend_a) = friends().await;
    b.write("private.txt", b"only for me", &[]).await;
    b.write("shared.txt", b"for ann", &[&friend_a]).await;
    let (address, stop) = b.serve().await;

    let report = a
        .sync_client(b.fingerprint(), address)
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.fetched, vec!["shared.txt.pbx".to_string()]);
    assert_matches!(
        a.store.file(&b.fingerprint(), "private.txt").await,
        Err(Error::FileNotFound(_))
    );

    stop.cancel();
}

#[tokio::test]
async fn test_download_all_skips_own_directory() {
    let (a, b, friend_a) = friends().await;
    b.write("note.txt", b"note", &[&friend_a]).await;
    let (address, stop) = b.serve().await;

    let results = a
        .sync_client(b.fingerprint(), address)
        .download_all(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let (fingerprint, report) = &results[0];
    assert_eq!(*fingerprint, b.fingerprint());
    assert_eq!(report.as_ref().unwrap().fetched.len(), 1);

    stop.cancel();
}

#[tokio::test]
async fn test_cancelled_sync_does_not_move_cursor() {
    let (a, b, _) = friends().await;
    let (address, stop) = b.serve().await;
    let client = a.sync_client(b.fingerprint(), address);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = client.download_friend(&b.fingerprint(), &cancel).await;
    assert_matches!(result, Err(Error::Cancelled));
    assert_eq!(client.cursor().get(&b.fingerprint()).await.unwrap(), None);

    stop.cancel();
}

#[tokio::test]
async fn test_range_request_returns_exact_slice() {
    let (a, b, friend_a) = friends().await;
    let sealed = b.write("data.bin", &[7u8; 4096], &[&friend_a]).await;
    let (address, stop) = b.serve().await;

    let url = format!("https://{}/p2p/{}/data.bin.pbx", address, b.fingerprint());
    let response = a
        .http_client(b.fingerprint())
        .get(&url)
        .header(RANGE, "bytes=100-1123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &sealed[100..1124]);

    stop.cancel();
}

#[tokio::test]
async fn test_versions_are_served() {
    let (a, b, friend_a) = friends().await;
    let first = b.write("doc.txt", b"draft", &[&friend_a]).await;
    b.write("doc.txt", b"final", &[&friend_a]).await;
    let (address, stop) = b.serve().await;
    let client = a.http_client(b.fingerprint());
    let base = format!("https://{}/p2p/{}", address, b.fingerprint());

    let url = format!("{}/doc.txt.pbx.version/{}", base, sha256_hex(&first));
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), first.as_slice());

    let missing = format!("{}/doc.txt.pbx.version/{}", base, "0".repeat(64));
    assert_eq!(client.get(&missing).send().await.unwrap().status(), StatusCode::NOT_FOUND);

    let malformed = format!("{}/doc.txt.pbx.version/xyz", base);
    assert_eq!(client.get(&malformed).send().await.unwrap().status(), StatusCode::BAD_REQUEST);

    stop.cancel();
}

#[tokio::test]
async fn test_status_codes() {
    let (a, b, friend_a) = friends().await;
    b.write("secret.txt", b"for ann only", &[&friend_a]).await;

    // A friend of Bob's who is not a recipient.
    let c = TestPeer::new("Cat");
    b.befriend(&c).await;
    c.befriend(&b).await;
    // Someone Bob has never heard of.
    let d = TestPeer::new("Dan");

    let (address, stop) = b.serve().await;
    let base = format!("https://{}/p2p/{}", address, b.fingerprint());
    let file_url = format!("{}/secret.txt.pbx", base);

    let ann = a.http_client(b.fingerprint());
    assert_eq!(ann.get(&file_url).send().await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        ann.get(format!("{}/missing.pbx", base)).send().await.unwrap().status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        ann.get(format!("https://{}/p2p/not-a-fingerprint", address))
            .send()
            .await
            .unwrap()
            .status(),
        StatusCode::BAD_REQUEST
    );

    // Listings never tell whether Bob follows a fingerprint.
    let unfollowed = format!("https://{}/p2p/{}", address, "42".repeat(20));
    for outsider in [&a, &c, &d] {
        let client = outsider.http_client(b.fingerprint());
        let response = client.get(&unfollowed).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listing: Vec<serde_json::Value> = response.json().await.unwrap();
        assert!(listing.is_empty());
    }

    for outsider in [&c, &d] {
        let client = outsider.http_client(b.fingerprint());
        assert_eq!(client.get(&file_url).send().await.unwrap().status(), StatusCode::UNAUTHORIZED);
        let listing: Vec<serde_json::Value> = client.get(&base).send().await.unwrap().json().await.unwrap();
        assert!(listing.is_empty());
    }

    stop.cancel();
}

#[tokio::test]
async fn test_wrong_server_key_is_refused() {
    let (a, b, _) = friends().await;
    let impostor = TestPeer::new("Eve");
    let (address, stop) = impostor.serve().await;

    let result = a
        .sync_client(b.fingerprint(), address)
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await;
    assert_matches!(result, Err(Error::Http(_)));

    stop.cancel();
}

#[tokio::test]
async fn test_unexpected_signer_is_distinguished() {
    let a = TestPeer::new("Ann");
    let f1 = TestPeer::new("Fay");
    let f2 = TestPeer::new("Gus");
    let friend_a = f1.befriend(&a).await;
    a.befriend(&f1).await;
    a.befriend(&f2).await;
    a.store.follow(&f2.fingerprint()).await.unwrap();

    // Fay's file turns up in Gus's directory.
    let sealed = f1.write("claim.txt", b"signed by fay", &[&friend_a]).await;
    let file = a.store.put_file(&f2.fingerprint(), "claim.txt", &sealed).await.unwrap();

    let friends = a.account.friends().await.unwrap();
    let result = file.verify_signature(&a.account, &friends, &f2.fingerprint()).await;
    assert_matches!(
        result,
        Err(Error::UnexpectedSigner { expected, actual })
            if expected == f2.fingerprint() && actual == f1.fingerprint()
    );
}

/// Serves `router` over TLS with `identity`, without the real handlers.
async fn serve_router(identity: &TlsIdentity, router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(identity.server_config().unwrap());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let router = router.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                    router.clone().oneshot(request)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    address
}

#[tokio::test]
async fn test_corrupted_downloads_are_rejected() {
    let (a, b, _) = friends().await;
    let good = sha256_hex(b"hello");
    let listing = serde_json::json!([
        { "path": "bad-hash.pbx", "size": 5, "sha256": "0".repeat(64) },
        { "path": "bad-size.pbx", "size": 99, "sha256": good },
        { "path": "good.pbx", "size": 5, "sha256": good },
    ]);
    let router = Router::new()
        .route(
            "/p2p/:fingerprint",
            get(move || {
                let listing = listing.clone();
                async move { Json(listing) }
            }),
        )
        .route("/p2p/:fingerprint/*name", get(|| async { "hello" }));
    let address = serve_router(&b.identity, router).await;

    let client = a.sync_client(b.fingerprint(), address);
    let report = client
        .download_friend(&b.fingerprint(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.fetched, vec!["good.pbx".to_string()]);
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed[0].1.contains("hash mismatch"));
    assert!(report.failed[1].1.contains("size mismatch"));
    assert_matches!(
        a.store.file(&b.fingerprint(), "bad-hash").await,
        Err(Error::FileNotFound(_))
    );
    assert_eq!(client.cursor().get(&b.fingerprint()).await.unwrap(), None);
}
