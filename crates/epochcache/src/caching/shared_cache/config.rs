use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

/// The environment variable the bearer token is read from if none is configured.
pub const TOKEN_ENV_VAR: &str = "EPOCHCACHE_SHARED_CACHE_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemSharedCacheConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSharedCacheConfig {
    /// Base URL of the blob store.
    ///
    /// Values are written with a `POST` to this URL, and read with a `GET` to the key joined
    /// onto it. A missing trailing `/` is added.
    #[serde(deserialize_with = "deserialize_base_url")]
    pub url: Url,

    /// Bearer token sent with every request.
    ///
    /// If this is not provided the token will be looked up in the
    /// `EPOCHCACHE_SHARED_CACHE_TOKEN` variable.
    #[serde(default = "default_token", deserialize_with = "deserialize_token")]
    pub token: Option<String>,
}

/// Makes sure the path of `url` ends in `/`, so that keys joined onto it extend its path.
pub(crate) fn base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn deserialize_base_url<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Url, D::Error> {
    Url::deserialize(deserializer).map(base_url)
}

fn default_token() -> Option<String> {
    env::var(TOKEN_ENV_VAR).ok().filter(|token| !token.is_empty())
}

fn deserialize_token<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let token = Option::<String>::deserialize(deserializer)?;
    Ok(token.or_else(default_token))
}

/// The backend to use for the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedCacheBackendConfig {
    Http(HttpSharedCacheConfig),
    Filesystem(FilesystemSharedCacheConfig),
}

/// A remote cache that can be shared between processes.
///
/// Values that are not in the in-memory cache of the current epoch are looked up from here
/// in parallel to computing them. Freshly computed values are written here so that other
/// processes, or a restarted one, can pick them up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCacheConfig {
    /// The number of allowed concurrent uploads to the shared cache.
    ///
    /// Uploading to the shared cache is not critical and should not disrupt any normal
    /// work. This limits the number of concurrent uploads so that associated resources are
    /// kept in check.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// The number of queued up uploads to the cache.
    ///
    /// If more items need to be uploaded to the shared cache than there are allowed
    /// concurrently the uploads will be queued. If the queue is full the uploads are
    /// simply dropped.
    #[serde(default = "default_max_upload_queue_size")]
    pub max_upload_queue_size: usize,

    /// The backend to use for the shared cache.
    #[serde(flatten)]
    pub backend: SharedCacheBackendConfig,
}

fn default_max_upload_queue_size() -> usize {
    400
}

fn default_max_concurrent_uploads() -> usize {
    20
}
