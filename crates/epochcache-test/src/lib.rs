//! Helpers for testing memoized caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    filesystem shared cache still writes to it.
//!
//!  - When using [`BlobServer`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `epochcache` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("epochcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));

        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct BlobState {
    token: Option<String>,
    blobs: Mutex<BTreeMap<String, Value>>,
    hits: Mutex<BTreeMap<String, usize>>,
    fetch_delay: Mutex<Duration>,
}

#[derive(Debug, Deserialize)]
struct StoreRequest {
    key: String,
    value: Value,
}

async fn count_hits(State(state): State<Arc<BlobState>>, req: Request, next: Next) -> Response {
    {
        let mut hits = state.hits.lock().unwrap();
        let hits = hits
            .entry(format!("{} {}", req.method(), req.uri().path()))
            .or_default();
        *hits += 1;
    }

    next.run(req).await
}

async fn check_token(
    State(state): State<Arc<BlobState>>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    if let Some(token) = &state.token {
        let expected = format!("Bearer {token}");
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if authorization != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    next.run(req).await
}

async fn fetch_blob(
    State(state): State<Arc<BlobState>>,
    extract::Path(key): extract::Path<String>,
) -> Response {
    let delay = *state.fetch_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    match state.blobs.lock().unwrap().get(&key) {
        Some(value) => Json(value.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn store_blob(
    State(state): State<Arc<BlobState>>,
    Json(request): Json<StoreRequest>,
) -> StatusCode {
    state
        .blobs
        .lock()
        .unwrap()
        .insert(request.key, request.value);
    StatusCode::CREATED
}

/// An in-memory blob store speaking the shared cache HTTP protocol.
///
/// Values are stored with a `POST` of `{ "key": ..., "value": ... }` to [`url`](Self::url), and
/// read with a `GET` of the key relative to it. All requests are counted.
pub struct BlobServer {
    server: Server,
    state: Arc<BlobState>,
}

impl BlobServer {
    /// Creates a blob store that requires the given bearer `token`, if any.
    pub fn new(token: Option<&str>) -> Self {
        let state = Arc::new(BlobState {
            token: token.map(Into::into),
            ..Default::default()
        });

        let router = Router::new()
            .route("/blobs/", post(store_blob))
            .route("/blobs/*key", get(fetch_blob))
            .layer(middleware::from_fn_with_state(state.clone(), check_token))
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// The base URL of the blob store.
    pub fn url(&self) -> Url {
        self.server.url("blobs/")
    }

    /// Delays every `GET` request by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.state.fetch_delay.lock().unwrap() = delay;
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: Value) {
        self.state.blobs.lock().unwrap().insert(key.into(), value);
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.blobs.lock().unwrap().keys().cloned().collect()
    }

    /// Returns and resets the number of requests, per method and path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Returns and resets the total number of requests.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }
}
