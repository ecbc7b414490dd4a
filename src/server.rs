//! # Sync server
//!
//! Serves the file store and the DHT over HTTP/1.1 on a mutually
//! authenticated TLS listener.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /p2p/{fp}` | listing of `fp`'s files the caller may read |
//! | `GET /p2p/{fp}/{name}` | current content of a file, byte ranges supported |
//! | `GET /p2p/{fp}/{name}.version/{sha256}` | a superseded version |
//! | `POST /kad/{ping,store,find_node,find_value}` | DHT RPC |
//!
//! Every connection is tagged with the fingerprint of the client certificate
//! (if one was presented). A file is only served to the recipients it was
//! encrypted for; everyone else gets a 401 or an empty listing.

use crate::account::Account;
use crate::crypto::sha256_hex;
use crate::dht::rpc::{FindNodeResponse, FindRequest, PingRequest, PingResponse, StoreRequest};
use crate::dht::{Dht, FindValueResponse};
use crate::error::{Error, ErrorKind, Result};
use crate::fingerprint::Fingerprint;
use crate::storage::{FileStore, ListEntry, StoredFile};
use crate::tls::{self, TlsIdentity};
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker between a file name and a version hash in URLs.
pub const VERSION_MARKER: &str = ".version/";

/// Read-only state shared by the file handlers.
#[derive(Clone)]
pub struct AppState {
    pub account: Arc<Account>,
    pub store: FileStore,
}

impl AppState {
    pub fn new(account: Arc<Account>) -> Self {
        let store = FileStore::for_account(&account);
        Self { account, store }
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Copy)]
pub struct PeerIdentity {
    /// Derived from the client certificate; `None` for anonymous clients.
    pub fingerprint: Option<Fingerprint>,
    pub remote: SocketAddr,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Maps library errors to responses. Authorization failures are logged with
/// their cause but answered with a bare 401.
#[derive(Debug)]
pub struct ApiError(Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Structural => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match status {
            StatusCode::UNAUTHORIZED => {
                debug!("Denied: {}", self.0);
                "unauthorized".to_string()
            }
            StatusCode::NOT_FOUND => "not found".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR => {
                warn!("Request failed: {}", self.0);
                "internal error".to_string()
            }
            _ => self.0.to_string(),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Routes for the file store and, when given, the DHT.
pub fn router(state: AppState, dht: Option<Arc<Dht>>) -> Router {
    let mut router = Router::new()
        .route("/p2p/:fingerprint", get(list_files))
        .route("/p2p/:fingerprint/*name", get(get_file))
        .with_state(state);
    if let Some(dht) = dht {
        router = router.merge(kad_routes(dht));
    }
    router.layer(TraceLayer::new_for_http())
}

fn kad_routes(dht: Arc<Dht>) -> Router {
    Router::new()
        .route("/kad/ping", post(kad_ping))
        .route("/kad/store", post(kad_store))
        .route("/kad/find_node", post(kad_find_node))
        .route("/kad/find_value", post(kad_find_value))
        .with_state(dht)
}

async fn list_files(
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    Path(fingerprint): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ListEntry>>> {
    let owner = Fingerprint::parse(&fingerprint).map_err(Error::from)?;
    let Some(caller) = peer.fingerprint else {
        debug!("Anonymous listing of {} from {}", owner, peer.remote);
        return Ok(Json(Vec::new()));
    };
    let friends = state.account.friends().await?;
    if !friends.contains(&caller) {
        debug!("Listing of {} requested by stranger {}", owner, caller);
        return Ok(Json(Vec::new()));
    }
    if !state.store.is_following(&owner).await {
        debug!("Listing of unfollowed {} requested by {}", owner, caller);
        return Ok(Json(Vec::new()));
    }

    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date);

    let mut entries = Vec::new();
    for info in state.store.list_files(&owner, since, 0).await? {
        let recipients = match info.file.recipients(&friends).await {
            Ok(recipients) => recipients,
            Err(e) => {
                debug!("Not listing {}: {}", info.file.name(), e);
                continue;
            }
        };
        if !tls::is_permitted(Some(&caller), &recipients) {
            continue;
        }
        let data = match info.file.read().await {
            Ok(data) => data,
            Err(e) => {
                debug!("Not listing {}: {}", info.file.name(), e);
                continue;
            }
        };
        entries.push(ListEntry {
            path: info.file.name().to_string(),
            size: data.len() as u64,
            sha256: sha256_hex(&data),
        });
    }

    debug!("Listed {} files of {} for {}", entries.len(), owner, caller);
    Ok(Json(entries))
}

async fn get_file(
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    Path((fingerprint, name)): Path<(String, String)>,
    request: Request,
) -> ApiResult<Response> {
    let owner = Fingerprint::parse(&fingerprint).map_err(Error::from)?;
    let caller = peer.fingerprint.ok_or(Error::NotPermitted(None))?;
    let friends = state.account.friends().await?;
    if !friends.contains(&caller) {
        return Err(Error::NotPermitted(Some(caller)).into());
    }
    if !state.store.is_following(&owner).await {
        return Err(Error::NotFollowing(owner).into());
    }

    let file = lookup_file(&state.store, &owner, &name).await?;
    let recipients = file.recipients(&friends).await?;
    if !tls::is_permitted(Some(&caller), &recipients) {
        return Err(Error::NotPermitted(Some(caller)).into());
    }

    debug!("Serving {} of {} to {}", file.name(), owner, caller);
    let response = ServeFile::new(file.path())
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    Ok(response.map(Body::new))
}

/// Resolves `name` (optionally `<name>.version/<hash>`) to a stored file.
async fn lookup_file(store: &FileStore, owner: &Fingerprint, name: &str) -> Result<StoredFile> {
    let name = name.trim_start_matches('/');
    match split_version(name) {
        Some((name, hash)) => store.version(owner, name, hash).await,
        None => store.file(owner, name).await,
    }
}

/// Splits `<name>.version/<hash>` into its parts.
pub fn split_version(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once(VERSION_MARKER)
}

/// Parses an HTTP date such as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Formats `date` as an HTTP date.
pub fn format_http_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

async fn kad_ping(
    State(dht): State<Arc<Dht>>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<PingRequest>,
) -> Json<PingResponse> {
    let fingerprint = dht
        .handle_ping(peer.fingerprint, peer.remote, request.listen_port)
        .await;
    Json(PingResponse { fingerprint })
}

async fn kad_store(
    State(dht): State<Arc<Dht>>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<StoreRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    dht.handle_store(peer.fingerprint, request.address).await?;
    Ok(Json(serde_json::json!({ "stored": true })))
}

async fn kad_find_node(
    State(dht): State<Arc<Dht>>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<FindRequest>,
) -> Json<FindNodeResponse> {
    let peers = dht
        .handle_find_node(peer.fingerprint, peer.remote, request.listen_port, &request.target)
        .await;
    Json(FindNodeResponse { peers })
}

async fn kad_find_value(
    State(dht): State<Arc<Dht>>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<FindRequest>,
) -> Json<FindValueResponse> {
    Json(
        dht.handle_find_value(peer.fingerprint, peer.remote, request.listen_port, &request.target)
            .await,
    )
}

/// A bound TLS listener serving [`router`].
pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
}

impl Server {
    pub async fn bind(
        address: SocketAddr,
        identity: &TlsIdentity,
        state: AppState,
        dht: Option<Arc<Dht>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let acceptor = TlsAcceptor::from(identity.server_config()?);
        Ok(Self {
            listener,
            acceptor,
            router: router(state, dht),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `cancel` fires. Each connection is served
    /// on its own task.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Serving on {}", self.local_addr()?);
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            tokio::spawn(serve_connection(
                self.acceptor.clone(),
                self.router.clone(),
                stream,
                remote,
                cancel.clone(),
            ));
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    router: Router,
    stream: TcpStream,
    remote: SocketAddr,
    cancel: CancellationToken,
) {
    let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!("TLS handshake with {} failed: {}", remote, e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake with {} timed out", remote);
            return;
        }
    };

    let peer = PeerIdentity {
        fingerprint: tls::peer_fingerprint(tls.get_ref().1),
        remote,
    };
    match peer.fingerprint {
        Some(fingerprint) => debug!("Connection from {} as {}", remote, fingerprint),
        None => debug!("Anonymous connection from {}", remote),
    }

    let app = router.layer(Extension(peer));
    let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        app.clone().oneshot(request)
    });
    let connection = hyper::server::conn::http1::Builder::new().serve_connection(TokioIo::new(tls), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = cancel.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        debug!("Connection with {} ended: {}", remote, e);
    }
}
