use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use epochcache::caching::shared_cache::{
    FilesystemSharedCacheConfig, HttpSharedCacheConfig, SharedCacheBackendConfig,
    SharedCacheConfig,
};
use epochcache::caching::{
    CacheKey, EpochId, MemoizeConfig, PersistConfig, SharedCacheRef, SharedCacheService,
    VersionedKey,
};
use serde::Serialize;
use url::Url;

pub use epochcache_test::{BlobServer, setup, tempdir};

/// A fixed point in time, in milliseconds since the unix epoch.
pub const NOW: u64 = 1_700_000_000_000;

/// Counts invocations of a producer.
#[derive(Debug, Clone, Default)]
pub struct Invocations(Arc<AtomicUsize>);

impl Invocations {
    /// Records an invocation and returns the number of earlier ones.
    pub fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A cache config with a one minute epoch, persisted as `{name}/v1`.
pub fn persisted_config(name: &str) -> MemoizeConfig {
    MemoizeConfig {
        persist: Some(PersistConfig {
            name: name.into(),
            version: "v1".into(),
            kind: None,
        }),
        ..MemoizeConfig::new(Duration::from_secs(60))
    }
}

/// The key under which the value for `args` at [`NOW`] is persisted.
pub fn persist_key<A: Serialize>(config: &MemoizeConfig, args: &A) -> String {
    let persist = config.persist.as_ref().unwrap();
    let content_key = CacheKey::from_args(args).unwrap();
    let cache_key = VersionedKey::new(&content_key, EpochId::at(NOW, config.ttl));
    format!("{}/{}/{}", persist.name, persist.version, cache_key.path())
}

pub fn fs_shared_cache(path: &Path) -> SharedCacheRef {
    let config = SharedCacheConfig {
        max_concurrent_uploads: 10,
        max_upload_queue_size: 100,
        backend: SharedCacheBackendConfig::Filesystem(FilesystemSharedCacheConfig {
            path: path.to_path_buf(),
        }),
    };
    SharedCacheService::new(Some(config), tokio::runtime::Handle::current())
}

pub fn http_shared_cache(url: Url, token: &str) -> SharedCacheRef {
    let config = SharedCacheConfig {
        max_concurrent_uploads: 10,
        max_upload_queue_size: 100,
        backend: SharedCacheBackendConfig::Http(HttpSharedCacheConfig {
            url,
            token: Some(token.into()),
        }),
    };
    SharedCacheService::new(Some(config), tokio::runtime::Handle::current())
}

/// Waits until the shared cache service is initialized.
pub async fn wait_init(shared_cache: &SharedCacheRef) {
    wait_for(|| shared_cache.get().is_some()).await;
}

/// Polls `condition` until it holds, panicking after a couple of seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    const MAX_DELAY: Duration = Duration::from_secs(3);
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > MAX_DELAY {
            panic!("condition not met within {MAX_DELAY:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
