//! A remote cache to be shared between different processes.
//!
//! The goal of this cache is to have a faster warm-up time when starting a new process by
//! serving values that another process already computed in the same epoch. Writes are
//! best-effort: they are queued, executed by a background worker with limited concurrency,
//! and dropped when the queue is full. Errors never reach the caller of a memoized function.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Error, anyhow};
use reqwest::{Client, StatusCode};
use sentry::protocol::Context;
use sentry::{Hub, SentryFutureExt};
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::{OnceCell, mpsc, oneshot};

pub mod config;

pub use config::{
    FilesystemSharedCacheConfig, HttpSharedCacheConfig, SharedCacheBackendConfig,
    SharedCacheConfig,
};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors using the cache backend.
///
/// This exists since some special cache errors should not be logged since they are
/// considered to be normal at scale, as long as their ratio stays low.
#[derive(thiserror::Error, Debug)]
enum SharedCacheError {
    #[error("timeout connecting to cache service")]
    ConnectTimeout,
    #[error("timeout fetching from cache service")]
    Timeout,
    #[error(transparent)]
    Other(#[from] Error),
}

impl SharedCacheError {
    fn details(&self) -> &'static str {
        match self {
            Self::ConnectTimeout => "connect-timeout",
            Self::Timeout => "timeout",
            Self::Other(_) => "other",
        }
    }
}

#[derive(Debug)]
struct HttpState {
    config: HttpSharedCacheConfig,
    client: Client,
}

impl HttpState {
    fn try_new(mut config: HttpSharedCacheConfig) -> anyhow::Result<Self> {
        config.url = config::base_url(config.url);
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    /// Fetches an item from the blob store.
    ///
    /// Only a `200` response counts as a hit, every other status is treated as absent.
    async fn fetch(&self, key: &str) -> Result<Option<Value>, SharedCacheError> {
        let url = self
            .config
            .url
            .join(key)
            .context("URL construction failed")?;
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = tokio::time::timeout(CONNECT_TIMEOUT, request.send())
            .await
            .map_err(|_| SharedCacheError::ConnectTimeout)?
            .map_err(|err| {
                tracing::trace!("Error in shared_cache HTTP response for {}", key);
                Error::new(err).context("Bad HTTP response for shared_cache")
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            tracing::trace!("Miss hitting shared_cache HTTP {} ({})", key, status);
            return Ok(None);
        }

        let value = tokio::time::timeout(FETCH_TIMEOUT, response.json::<Value>())
            .await
            .map_err(|_| SharedCacheError::Timeout)?
            .context("Invalid JSON in shared_cache response")?;
        tracing::trace!("Success hitting shared_cache HTTP {}", key);
        Ok(Some(value))
    }

    async fn store(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<SharedCacheStoreResult, SharedCacheError> {
        let mut request = self
            .client
            .post(self.config.url.clone())
            .json(&json!({ "key": key, "value": value }));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        match tokio::time::timeout(STORE_TIMEOUT, request.send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                match status {
                    successful if successful.is_success() => {
                        tracing::trace!("Success storing shared_cache HTTP {}", key);
                        Ok(SharedCacheStoreResult::Written)
                    }
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        Err(anyhow!("Invalid credentials for shared_cache").into())
                    }
                    _ => Err(anyhow!("Error response from shared_cache: {}", status).into()),
                }
            }
            Ok(Err(err)) => {
                tracing::trace!("Error in shared_cache HTTP response for {}", key);
                Err(Error::new(err).context("Bad HTTP response for shared_cache").into())
            }
            Err(_) => Err(SharedCacheError::Timeout),
        }
    }
}

impl FilesystemSharedCacheConfig {
    /// Reads `{path}/{key}.json`, if it exists.
    async fn fetch(&self, key: &str) -> Result<Option<Value>, SharedCacheError> {
        let abspath = self.path.join(format!("{key}.json"));
        tracing::debug!("Fetching shared cache item from {}", abspath.display());
        let contents = match fs::read(&abspath).await {
            Ok(contents) => contents,
            Err(err) => match err.kind() {
                io::ErrorKind::NotFound => return Ok(None),
                _ => return Err(err).context("Failed to open file in shared cache")?,
            },
        };
        let value = serde_json::from_slice(&contents).context("Invalid JSON in shared cache")?;
        Ok(Some(value))
    }

    async fn store(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<SharedCacheStoreResult, SharedCacheError> {
        let abspath = self.path.join(format!("{key}.json"));
        let parent_dir = abspath
            .parent()
            .ok_or_else(|| Error::msg("Shared cache directory not found"))?;
        fs::create_dir_all(parent_dir)
            .await
            .context("Failed to create parent directories")?;
        // Keys are versioned by epoch, an existing file already holds this value.
        if fs::try_exists(&abspath).await.unwrap_or(false) {
            return Ok(SharedCacheStoreResult::Skipped);
        }

        let contents = serde_json::to_vec(value).context("Failed to serialize value")?;
        let temp_dir = self.path.join(".tmp");
        fs::create_dir_all(&temp_dir)
            .await
            .context("failed to create tempdir")?;
        let temp_file = NamedTempFile::new_in(&temp_dir).context("failed to create tempfile")?;
        fs::write(temp_file.path(), &contents)
            .await
            .context("Failed to copy data into file")?;

        temp_file
            .persist(&abspath)
            .context("Failed to save file in shared cache")?;
        Ok(SharedCacheStoreResult::Written)
    }
}

/// The result of an attempt to write an entry to the shared cache.
#[derive(Debug, Clone, Copy)]
enum SharedCacheStoreResult {
    /// Successfully written to the cache as a new entry.
    Written,
    /// Skipped writing the item as it was already on the cache.
    Skipped,
}

impl AsRef<str> for SharedCacheStoreResult {
    fn as_ref(&self) -> &str {
        match self {
            SharedCacheStoreResult::Written => "written",
            SharedCacheStoreResult::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SharedCacheStoreResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Debug)]
enum SharedCacheBackend {
    Http(HttpState),
    Fs(FilesystemSharedCacheConfig),
}

impl SharedCacheBackend {
    /// Creates the backend.
    ///
    /// If the backend can not be created the error will already be reported.
    fn maybe_new(cfg: SharedCacheBackendConfig) -> Option<Self> {
        match cfg {
            SharedCacheBackendConfig::Http(cfg) => match HttpState::try_new(cfg)
                .context("Failed to initialise HTTP backend for shared cache")
            {
                Ok(state) => Some(SharedCacheBackend::Http(state)),
                Err(err) => {
                    sentry::capture_error(&*err);
                    None
                }
            },
            SharedCacheBackendConfig::Filesystem(cfg) => Some(SharedCacheBackend::Fs(cfg)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "HTTP",
            Self::Fs(_) => "filesystem",
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>, SharedCacheError> {
        match self {
            Self::Http(state) => state.fetch(key).await,
            Self::Fs(cfg) => cfg.fetch(key).await,
        }
    }

    async fn store(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<SharedCacheStoreResult, SharedCacheError> {
        match self {
            Self::Http(state) => state.store(key, value).await,
            Self::Fs(cfg) => cfg.store(key, value).await,
        }
    }
}

/// Message to send upload tasks across the [`SharedCacheService::upload_queue_tx`].
#[derive(Debug)]
struct UploadMessage {
    /// The name of the memoized cache, used for metrics.
    cache: Arc<str>,
    /// The key to store the value at.
    key: String,
    /// The value to store.
    value: Value,
    /// A channel to notify completion of storage.
    done_tx: oneshot::Sender<()>,
}

pub type SharedCacheRef = Arc<OnceCell<SharedCacheService>>;

/// A shared cache service.
///
/// Initialising is asynchronous, until it is done the [`SharedCacheRef`] is empty and
/// memoized caches behave as if no shared cache was configured.
#[derive(Debug, Clone)]
pub struct SharedCacheService {
    backend: Arc<SharedCacheBackend>,
    upload_queue_tx: mpsc::Sender<UploadMessage>,
}

impl SharedCacheService {
    pub fn new(
        config: Option<SharedCacheConfig>,
        runtime: tokio::runtime::Handle,
    ) -> SharedCacheRef {
        let cache = SharedCacheRef::default();
        if let Some(config) = config {
            runtime.spawn(Self::init(cache.clone(), config));
        }
        cache
    }

    async fn init(cache: SharedCacheRef, config: SharedCacheConfig) {
        let (tx, rx) = mpsc::channel(config.max_upload_queue_size.max(1));
        if let Some(backend) = SharedCacheBackend::maybe_new(config.backend) {
            let backend = Arc::new(backend);
            tokio::spawn(
                Self::upload_worker(rx, backend.clone(), config.max_concurrent_uploads.max(1))
                    .bind_hub(Hub::new_from_top(Hub::current())),
            );
            let _ = cache.set(SharedCacheService {
                backend,
                upload_queue_tx: tx,
            });
        }
    }

    /// Long running task managing concurrent uploads to the shared cache.
    async fn upload_worker(
        mut work_rx: mpsc::Receiver<UploadMessage>,
        backend: Arc<SharedCacheBackend>,
        max_concurrent_uploads: usize,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(max_concurrent_uploads);
        let mut uploads_counter = max_concurrent_uploads;
        loop {
            tokio::select! {
                Some(message) = work_rx.recv(), if uploads_counter > 0 => {
                    uploads_counter -= 1;
                    tokio::spawn(
                        Self::single_uploader(done_tx.clone(), backend.clone(), message)
                            .bind_hub(Hub::new_from_top(Hub::current()))
                    );
                    let uploads_in_flight: u64 = (max_concurrent_uploads - uploads_counter) as u64;
                    metric!(gauge("services.shared_cache.uploads_in_flight") = uploads_in_flight);
                }
                Some(_) = done_rx.recv() => {
                    uploads_counter += 1;
                }
                else => break,
            }
        }
        tracing::info!("Shared cache upload worker terminated");
    }

    /// Does a single upload to the shared cache backend.
    ///
    /// Handles metrics and error reporting.
    async fn single_uploader(
        done_tx: mpsc::Sender<()>,
        backend: Arc<SharedCacheBackend>,
        message: UploadMessage,
    ) {
        let UploadMessage {
            cache,
            key,
            value,
            done_tx: complete_tx,
        } = message;

        sentry::configure_scope(|scope| {
            let mut map = BTreeMap::new();
            map.insert("backend".to_string(), backend.name().into());
            map.insert("cache".to_string(), cache.as_ref().into());
            map.insert("path".to_string(), key.clone().into());
            scope.set_context("Shared Cache", Context::Other(map));
        });

        match backend.store(&key, &value).await {
            Ok(op) => {
                metric!(
                    counter("services.shared_cache.store") += 1,
                    "cache" => cache.as_ref(),
                    "write" => op.as_ref(),
                    "status" => "ok",
                );
            }
            Err(outer_err) => {
                let errdetails = outer_err.details();
                if let SharedCacheError::Other(err) = outer_err {
                    let stderr: &dyn std::error::Error = &*err;
                    tracing::error!(
                        stderr,
                        "Error storing value on {} shared cache",
                        backend.name(),
                    );
                }
                metric!(
                    counter("services.shared_cache.store") += 1,
                    "cache" => cache.as_ref(),
                    "status" => "error",
                    "errdetails" => errdetails,
                );
            }
        }

        // Tell the work coordinator we're done.
        done_tx.send(()).await.unwrap_or_else(|err| {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(
                stderr,
                "Shared cache single_uploader failed to send done message",
            );
        });

        // Tell the original work submitter we're done, if they dropped this we don't care.
        complete_tx.send(()).ok();
    }

    /// Returns the name of the backend configured.
    fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Retrieve a value from the shared cache.
    ///
    /// Errors are transparently hidden, either a cache item is available or it is not.
    #[tracing::instrument(name = "fetch_shared_cache", skip(self))]
    pub async fn fetch(&self, cache: &str, key: &str) -> Option<Value> {
        let _guard = Hub::current().push_scope();
        let backend_name = self.backend_name();
        sentry::configure_scope(|scope| {
            let mut map = BTreeMap::new();
            map.insert("backend".to_string(), backend_name.into());
            map.insert("cache".to_string(), cache.into());
            map.insert("path".to_string(), key.into());
            scope.set_context("Shared Cache", Context::Other(map));
        });

        let res = tokio::time::timeout(FETCH_TIMEOUT, self.backend.fetch(key))
            .await
            .unwrap_or(Err(SharedCacheError::Timeout));
        match res {
            Ok(Some(value)) => {
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "cache" => cache,
                    "hit" => "true",
                    "status" => "ok",
                );
                Some(value)
            }
            Ok(None) => {
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "cache" => cache,
                    "hit" => "false",
                    "status" => "ok",
                );
                None
            }
            Err(outer_err) => {
                let errdetails = outer_err.details();
                if let SharedCacheError::Other(err) = outer_err {
                    let stderr: &dyn std::error::Error = &*err;
                    tracing::error!(stderr, "Error fetching from {} shared cache", backend_name);
                }
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "cache" => cache,
                    "status" => "error",
                    "errdetails" => errdetails,
                );
                None
            }
        }
    }

    /// Place a value on the shared cache.
    ///
    /// Errors are transparently hidden, this service handles any errors itself.
    ///
    /// # Return
    ///
    /// A [`oneshot::Receiver`] is returned which will receive a value once the value has been
    /// stored in the shared cache. Due to backpressure it is possible that the value is never
    /// stored, in which case the corresponding [`oneshot::Sender`] is dropped and awaiting the
    /// receiver will resolve into an [`Err`].
    ///
    /// This [`oneshot::Receiver`] can also be safely ignored if you do not need to know
    /// when the value is stored. This mostly exists to enable testing.
    pub fn store(&self, cache: &str, key: String, value: Value) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        metric!(
            gauge("services.shared_cache.uploads_queue_capacity") =
                self.upload_queue_tx.capacity() as u64
        );
        self.upload_queue_tx
            .try_send(UploadMessage {
                cache: cache.into(),
                key,
                value,
                done_tx,
            })
            .unwrap_or_else(|_| {
                metric!(counter("services.shared_cache.store.dropped") += 1, "cache" => cache);
                tracing::error!("Shared cache upload queue full");
            });
        done_rx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    async fn wait_init(service: &SharedCacheRef) -> &SharedCacheService {
        const MAX_DELAY: Duration = Duration::from_secs(3);
        let start = Instant::now();
        loop {
            if start.elapsed() > MAX_DELAY {
                panic!("shared cache not ready");
            }
            if let Some(service) = service.get() {
                return service;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn fs_config(path: &std::path::Path, max_upload_queue_size: usize) -> SharedCacheConfig {
        SharedCacheConfig {
            max_concurrent_uploads: 10,
            max_upload_queue_size,
            backend: SharedCacheBackendConfig::Filesystem(FilesystemSharedCacheConfig {
                path: path.to_path_buf(),
            }),
        }
    }

    #[tokio::test]
    async fn test_filesystem_fetch_found() {
        epochcache_test::setup();
        let dir = epochcache_test::tempdir();

        let key = "prices/v1/ab/cdef01/some_item";
        let cache_path = dir.path().join("prices/v1/ab/cdef01/some_item.json");
        fs::create_dir_all(cache_path.parent().unwrap())
            .await
            .unwrap();
        fs::write(&cache_path, br#"{"eth":3120.5}"#).await.unwrap();

        let svc = SharedCacheService::new(
            Some(fs_config(dir.path(), 10)),
            tokio::runtime::Handle::current(),
        );
        let svc = wait_init(&svc).await;

        let ret = svc.fetch("prices", key).await;
        assert_eq!(ret, Some(json!({"eth": 3120.5})));
    }

    #[tokio::test]
    async fn test_filesystem_fetch_not_found() {
        epochcache_test::setup();
        let dir = epochcache_test::tempdir();

        let svc = SharedCacheService::new(
            Some(fs_config(dir.path(), 10)),
            tokio::runtime::Handle::current(),
        );
        let svc = wait_init(&svc).await;

        let ret = svc.fetch("prices", "prices/v1/ab/cdef01/missing").await;
        assert_eq!(ret, None);
    }

    #[tokio::test]
    async fn test_filesystem_fetch_corrupt() {
        epochcache_test::setup();
        let dir = epochcache_test::tempdir();

        let cache_path = dir.path().join("prices/v1/corrupt.json");
        fs::create_dir_all(cache_path.parent().unwrap())
            .await
            .unwrap();
        fs::write(&cache_path, b"{not json").await.unwrap();

        let svc = SharedCacheService::new(
            Some(fs_config(dir.path(), 10)),
            tokio::runtime::Handle::current(),
        );
        let svc = wait_init(&svc).await;

        assert_eq!(svc.fetch("prices", "prices/v1/corrupt").await, None);
    }

    #[tokio::test]
    async fn test_filesystem_store() {
        epochcache_test::setup();
        let dir = epochcache_test::tempdir();

        let svc = SharedCacheService::new(
            Some(fs_config(dir.path(), 10)),
            tokio::runtime::Handle::current(),
        );
        let svc = wait_init(&svc).await;

        let key = "pools/v2/ab/cdef01/some_item".to_string();
        let recv = svc.store("pools", key.clone(), json!(["usdc-eth", "wbtc-eth"]));
        // Wait for storing to complete.
        recv.await.unwrap();

        let cache_path = dir.path().join("pools/v2/ab/cdef01/some_item.json");
        let data = fs::read(&cache_path)
            .await
            .context("Failed to read written cache file")
            .unwrap();
        assert_eq!(data, br#"["usdc-eth","wbtc-eth"]"#);

        assert_eq!(
            svc.fetch("pools", &key).await,
            Some(json!(["usdc-eth", "wbtc-eth"]))
        );
    }

    #[tokio::test]
    async fn test_uninitialized_without_config() {
        let svc = SharedCacheService::new(None, tokio::runtime::Handle::current());
        tokio::task::yield_now().await;
        assert!(svc.get().is_none());
    }
}
