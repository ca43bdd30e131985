use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cache_error::CacheEntry;
use super::cache_key::CacheKey;
use super::epoch::{Clock, SystemClock, ttl_millis};
use super::shared_cache::SharedCacheRef;
use super::validity::is_valid_default;

/// Stale values are never served if they are older than this many epochs.
pub(crate) const STALE_EPOCHS: u32 = 5;

/// Where and under which namespace values are persisted in the shared cache.
///
/// Changing the `version` invalidates everything that was persisted before, without having
/// to touch the contents of the remote store.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersistConfig {
    /// The logical name of the cache.
    pub name: String,
    /// A version tag.
    pub version: String,
    /// An optional tag describing the type of the persisted values.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl PersistConfig {
    /// The key prefix all values of this cache are stored under.
    pub(crate) fn namespace(&self) -> String {
        match &self.kind {
            Some(kind) => format!("{}/{}/{}", self.name, kind, self.version),
            None => format!("{}/{}", self.name, self.version),
        }
    }
}

/// Configuration of a single memoized function.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoizeConfig {
    /// The width of an epoch.
    ///
    /// A value computed in one epoch is never served as a fresh value in the next one.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum number of entries kept in memory.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,

    /// Maximum age of a stale value that can be served while a fresh one is computed.
    ///
    /// Stale values are never older than five epochs, regardless of this setting.
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,

    /// Fail with [`CacheError::NoCache`](super::CacheError::NoCache) instead of waiting for a
    /// fresh value when no value is ready.
    #[serde(default)]
    pub reject_when_no_cache: bool,

    /// Serve a recent value of a previous epoch while the current one is computed.
    #[serde(default = "default_using_stale_value")]
    pub using_stale_value: bool,

    /// Fail the producer with [`CacheError::Timeout`](super::CacheError::Timeout) if it does
    /// not settle within this duration.
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,

    /// Persist values in the shared cache.
    #[serde(default)]
    pub persist: Option<PersistConfig>,
}

fn default_max_cache_size() -> u64 {
    1000
}

fn default_using_stale_value() -> bool {
    true
}

impl MemoizeConfig {
    /// Creates a configuration with the given epoch width, and defaults for everything else.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_cache_size: default_max_cache_size(),
            max_age: None,
            reject_when_no_cache: false,
            using_stale_value: default_using_stale_value(),
            request_timeout: None,
            persist: None,
        }
    }

    /// The epoch width in milliseconds, never `0`.
    pub(crate) fn ttl_millis(&self) -> u64 {
        ttl_millis(self.ttl)
    }

    /// The maximum age in milliseconds of a value that is served stale.
    pub(crate) fn stale_window(&self) -> u64 {
        let epochs = self.ttl_millis().saturating_mul(STALE_EPOCHS.into());
        match self.max_age {
            Some(max_age) => epochs.min(ttl_millis(max_age)),
            None => epochs,
        }
    }

    /// How long entries are kept in memory.
    ///
    /// An entry needs to outlive both its own epoch and the window in which it might be
    /// served stale.
    pub(crate) fn store_ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis().max(self.stale_window()))
    }
}

pub(crate) type KeyFn<A> = Arc<dyn Fn(&A) -> CacheEntry<CacheKey> + Send + Sync>;
pub(crate) type ValidityFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Everything needed to memoize a function, next to the function itself.
///
/// See [`wrap`](super::wrap).
pub struct MemoizeOptions<A, T> {
    pub(crate) name: Arc<str>,
    pub(crate) config: MemoizeConfig,
    pub(crate) key: KeyFn<A>,
    pub(crate) is_valid: ValidityFn<T>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) shared_cache: Option<SharedCacheRef>,
}

impl<A, T> MemoizeOptions<A, T>
where
    A: Serialize + 'static,
    T: Serialize + 'static,
{
    /// Options for a cache named `name`, keyed by all of the call arguments.
    pub fn new(name: &str, config: MemoizeConfig) -> Self {
        Self::with_key_fn(name, config, Arc::new(|args: &A| CacheKey::from_args(args)))
    }
}

impl<A, T> MemoizeOptions<A, T>
where
    A: 'static,
    T: Serialize + 'static,
{
    /// Options for a cache named `name`, keyed by the part of the arguments `key` selects.
    ///
    /// This allows arguments that are not relevant to the result, or can not be serialized,
    /// to be ignored.
    pub fn keyed<K, F>(name: &str, config: MemoizeConfig, key: F) -> Self
    where
        K: Serialize,
        F: Fn(&A) -> K + Send + Sync + 'static,
    {
        let key = Arc::new(move |args: &A| CacheKey::from_args(&key(args)));
        Self::with_key_fn(name, config, key)
    }

    fn with_key_fn(name: &str, config: MemoizeConfig, key: KeyFn<A>) -> Self {
        Self {
            name: name.into(),
            config,
            key,
            is_valid: Arc::new(is_valid_default::<T>),
            clock: Arc::new(SystemClock),
            shared_cache: None,
        }
    }
}

impl<A: 'static, T: 'static> MemoizeOptions<A, T> {
    /// Replaces the function that selects the cache-relevant part of the arguments.
    pub fn key<K, F>(mut self, key: F) -> Self
    where
        K: Serialize,
        F: Fn(&A) -> K + Send + Sync + 'static,
    {
        self.key = Arc::new(move |args: &A| CacheKey::from_args(&key(args)));
        self
    }

    /// Replaces the check deciding whether a computed value is worth caching.
    pub fn is_valid<F>(mut self, is_valid: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.is_valid = Arc::new(is_valid);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Uses the given shared cache for caches that have `persist` configured.
    pub fn shared_cache(mut self, shared_cache: SharedCacheRef) -> Self {
        self.shared_cache = Some(shared_cache);
        self
    }
}

impl<A, T> fmt::Debug for MemoizeOptions<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizeOptions")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("shared_cache", &self.shared_cache.is_some())
            .finish()
    }
}
