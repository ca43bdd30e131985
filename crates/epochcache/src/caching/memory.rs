use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::future::{self, BoxFuture, Shared};
use futures::{FutureExt, TryFutureExt};
use moka::ops::compute::Op;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::cache_error::{CacheEntry, CacheError};
use super::cache_key::VersionedKey;
use super::config::{KeyFn, MemoizeConfig, MemoizeOptions, ValidityFn};
use super::epoch::{Clock, EpochId};
use super::ledger::{EpochLedger, LedgerRecord};
use super::shared_cache::{SharedCacheRef, SharedCacheService};
use super::timeout::with_timeout;
use crate::utils::futures::first_ok;

/// The ledger holds this many records per entry the in-memory cache can hold.
const LEDGER_RECORDS_PER_ENTRY: usize = 5;

type Producer<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, CacheEntry<T>> + Send + Sync>;
type InMemoryCache<T> = moka::sync::Cache<VersionedKey, Arc<InFlightEntry<T>>>;

/// A single producer invocation, for one combination of arguments and epoch.
struct InFlightEntry<T> {
    /// Distinguishes entries that were created for the same key.
    id: u64,
    /// The computation, shared between everyone waiting for it.
    future: Shared<BoxFuture<'static, CacheEntry<T>>>,
    /// The value, once the computation produced a valid one.
    resolved: Arc<OnceLock<T>>,
}

impl<T: Clone> InFlightEntry<T> {
    fn value(&self) -> Option<T> {
        self.resolved.get().cloned()
    }
}

impl<T> fmt::Debug for InFlightEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightEntry")
            .field("id", &self.id)
            .field("resolved", &self.resolved.get().is_some())
            .finish()
    }
}

/// Where a computed value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Producer,
    Remote,
}

/// Destination of write-through stores.
#[derive(Debug, Clone)]
struct RemoteTarget {
    service: SharedCacheService,
    cache: Arc<str>,
    key: String,
}

/// Everything a settling computation needs to update its own entry.
///
/// A running computation must not hold on to the [`Memoized`] it belongs to.
struct Settle<T> {
    name: Arc<str>,
    cache: InMemoryCache<T>,
    cache_key: VersionedKey,
    id: u64,
    resolved: Arc<OnceLock<T>>,
    is_valid: ValidityFn<T>,
    remote: Option<RemoteTarget>,
}

impl<T> Settle<T>
where
    T: Clone + Send + Sync + Serialize + 'static,
{
    fn finish(self, result: CacheEntry<(T, Origin)>) -> CacheEntry<T> {
        let name = &*self.name;
        match result {
            Ok((value, Origin::Remote)) => {
                let _ = self.resolved.set(value.clone());
                Ok(value)
            }
            Ok((value, Origin::Producer)) if (self.is_valid)(&value) => {
                if self.resolved.set(value.clone()).is_ok() {
                    self.write_through(&value);
                }
                Ok(value)
            }
            Ok((value, Origin::Producer)) => {
                metric!(counter("caches.computation.invalid") += 1, "cache" => name);
                tracing::debug!("Not caching empty {} value for {}", name, self.cache_key);
                self.remove();
                Ok(value)
            }
            Err(err) => {
                metric!(
                    counter("caches.computation.error") += 1,
                    "cache" => name,
                    "reason" => err.metrics_tag(),
                );
                tracing::debug!("{} computation for {} failed: {}", name, self.cache_key, err);
                self.remove();
                Err(err)
            }
        }
    }

    /// Removes the entry from the in-memory cache, unless it was replaced in the meantime.
    fn remove(&self) {
        let id = self.id;
        self.cache
            .entry(self.cache_key.clone())
            .and_compute_with(|entry| match entry {
                Some(entry) if entry.value().id == id => Op::Remove,
                _ => Op::Nop,
            });
    }

    fn write_through(&self, value: &T) {
        let Some(remote) = &self.remote else {
            return;
        };
        match serde_json::to_value(value) {
            Ok(json) => {
                remote.service.store(&remote.cache, remote.key.clone(), json);
            }
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, "Failed to serialize {} value", self.name);
            }
        }
    }
}

struct Inner<A, T> {
    name: Arc<str>,
    instance: Uuid,
    config: MemoizeConfig,
    producer: Producer<A, T>,
    key: KeyFn<A>,
    is_valid: ValidityFn<T>,
    clock: Arc<dyn Clock>,
    shared_cache: Option<SharedCacheRef>,
    cache: InMemoryCache<T>,
    ledger: Mutex<EpochLedger>,
    next_id: AtomicU64,
}

/// A memoized producer.
///
/// Calls with equal arguments share one producer invocation per epoch. While the current
/// epoch is computing, a recent value of a previous epoch is served if there is one.
///
/// Cloning is cheap, clones share the same cache.
pub struct Memoized<A, T> {
    inner: Arc<Inner<A, T>>,
}

impl<A, T> Clone for Memoized<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> fmt::Debug for Memoized<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self
            .inner
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Memoized")
            .field("name", &self.inner.name)
            .field("instance", &self.inner.instance)
            .field("in-memory items", &self.inner.cache.entry_count())
            .field("ledger records", &ledger)
            .finish()
    }
}

/// Memoizes `producer`.
///
/// Errors of the producer are converted into [`CacheError::ProducerFailed`]. If a
/// `request_timeout` is configured, the producer is wrapped by [`with_timeout`].
pub fn wrap<A, T, E, F, Fut>(producer: F, options: MemoizeOptions<A, T>) -> Memoized<A, T>
where
    A: 'static,
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    E: Into<anyhow::Error> + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let MemoizeOptions {
        name,
        config,
        key,
        is_valid,
        clock,
        shared_cache,
    } = options;

    let mapped = move |args: A| producer(args).map_err(CacheError::producer);
    let producer: Producer<A, T> = match config.request_timeout {
        Some(timeout) => Arc::new(with_timeout(mapped, timeout)),
        None => Arc::new(move |args: A| mapped(args).boxed()),
    };

    let cache = moka::sync::Cache::builder()
        .name(&name)
        .max_capacity(config.max_cache_size)
        .time_to_live(config.store_ttl())
        .build();
    let ledger_capacity = usize::try_from(config.max_cache_size)
        .unwrap_or(usize::MAX)
        .saturating_mul(LEDGER_RECORDS_PER_ENTRY);

    let instance = Uuid::new_v4();
    tracing::debug!("Created memoized cache {} ({})", name, instance);

    Memoized {
        inner: Arc::new(Inner {
            name,
            instance,
            config,
            producer,
            key,
            is_valid,
            clock,
            shared_cache,
            cache,
            ledger: Mutex::new(EpochLedger::new(ledger_capacity)),
            next_id: AtomicU64::new(0),
        }),
    }
}

impl<A, T> Memoized<A, T>
where
    A: 'static,
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Returns a value for `args`.
    ///
    /// This returns, in order of preference:
    /// 1. the value of the current epoch, if it is already computed,
    /// 2. a recent value of a previous epoch, if `using_stale_value` is enabled,
    /// 3. [`CacheError::NoCache`], if `reject_when_no_cache` is enabled,
    /// 4. the value of the current epoch, once it is computed.
    ///
    /// In every case, the computation of the current epoch is started if it is not running
    /// yet.
    pub async fn call(&self, args: A) -> CacheEntry<T> {
        let inner = &*self.inner;
        let name = &*inner.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        let content_key = (inner.key)(&args)?;
        let now = inner.clock.now();
        let epoch = EpochId::at(now, inner.config.ttl);
        let cache_key = VersionedKey::new(&content_key, epoch);

        let (entry, is_fresh) = self.cache_for_epoch(cache_key.clone(), args, now);
        if let Some(value) = entry.value() {
            metric!(counter("caches.memory.hit") += 1, "cache" => name);
            return Ok(value);
        }
        if !is_fresh {
            metric!(counter("caches.memory.coalesced") += 1, "cache" => name);
        }

        if inner.config.using_stale_value {
            if let Some(value) = self.find_stale(&cache_key, now) {
                metric!(counter("caches.stale.hit") += 1, "cache" => name);
                return Ok(value);
            }
        }

        if inner.config.reject_when_no_cache {
            metric!(counter("caches.no_cache") += 1, "cache" => name);
            return Err(CacheError::NoCache {
                instance: inner.instance,
                epoch,
                ledger_len: self.ledger().len(),
            });
        }

        entry.future.clone().await
    }

    /// Returns whether an entry for `args` exists in the current epoch, computed or not.
    pub fn contains(&self, args: &A) -> CacheEntry<bool> {
        let content_key = (self.inner.key)(args)?;
        let epoch = EpochId::at(self.inner.clock.now(), self.inner.config.ttl);
        Ok(self
            .inner
            .cache
            .contains_key(&VersionedKey::new(&content_key, epoch)))
    }

    /// The name this cache was created with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The id of this cache, unique per process.
    pub fn instance(&self) -> Uuid {
        self.inner.instance
    }

    pub fn config(&self) -> &MemoizeConfig {
        &self.inner.config
    }

    /// Returns the entry for `cache_key`, creating it if it does not exist.
    ///
    /// The returned flag is `true` if the entry was created by this call.
    fn cache_for_epoch(
        &self,
        cache_key: VersionedKey,
        args: A,
        now: u64,
    ) -> (Arc<InFlightEntry<T>>, bool) {
        let inner = &*self.inner;
        let entry = inner
            .cache
            .entry(cache_key.clone())
            .or_insert_with(|| self.create_entry(cache_key.clone(), args));

        let is_fresh = entry.is_fresh();
        let entry = entry.into_value();
        if is_fresh {
            metric!(counter("caches.computation") += 1, "cache" => &*inner.name);
            tracing::trace!("Spawning {} computation for {}", inner.name, cache_key);
            tokio::spawn(
                entry
                    .future
                    .clone()
                    .bind_hub(Hub::new_from_top(Hub::current())),
            );

            let mut ledger = self.ledger();
            ledger.push(
                LedgerRecord {
                    created_at: now,
                    cache_key,
                },
                |key| inner.cache.contains_key(key),
            );
            metric!(gauge("caches.ledger.size") = ledger.len() as u64, "cache" => &*inner.name);
        }
        (entry, is_fresh)
    }

    /// Invokes the producer and wraps its computation into a new entry.
    ///
    /// The computation only starts to make progress once it is polled.
    fn create_entry(&self, cache_key: VersionedKey, args: A) -> Arc<InFlightEntry<T>> {
        let inner = &*self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let resolved = Arc::new(OnceLock::new());

        let name = inner.name.clone();
        let computation =
            match std::panic::catch_unwind(AssertUnwindSafe(|| (inner.producer)(args))) {
                Ok(computation) => computation,
                Err(_) => future::ready(Err(CacheError::InternalError)).boxed(),
            };
        let computation = AssertUnwindSafe(computation)
            .catch_unwind()
            .map(move |result| {
                result.unwrap_or_else(|_| {
                    tracing::error!("{} producer panicked", name);
                    Err(CacheError::InternalError)
                })
            });

        let remote = self.remote_target(&cache_key);
        let fetch = remote
            .clone()
            .map(|remote| fetch_remote(remote, inner.is_valid.clone()));

        let settle = Settle {
            name: inner.name.clone(),
            cache: inner.cache.clone(),
            cache_key,
            id,
            resolved: resolved.clone(),
            is_valid: inner.is_valid.clone(),
            remote,
        };

        let future = async move {
            let result = match fetch {
                Some(fetch) => {
                    let computation = computation.map_ok(|value| (value, Origin::Producer));
                    let fetch = fetch.map(|value| value.map(|value| (value, Origin::Remote)));
                    first_ok(computation, fetch).await
                }
                None => computation.await.map(|value| (value, Origin::Producer)),
            };
            settle.finish(result)
        };

        Arc::new(InFlightEntry {
            id,
            future: future.boxed().shared(),
            resolved,
        })
    }

    /// Returns where values for `cache_key` are persisted, if persisting is configured and
    /// the shared cache is ready.
    fn remote_target(&self, cache_key: &VersionedKey) -> Option<RemoteTarget> {
        let persist = self.inner.config.persist.as_ref()?;
        let service = self.inner.shared_cache.as_ref()?.get()?;
        Some(RemoteTarget {
            service: service.clone(),
            cache: persist.name.as_str().into(),
            key: format!("{}/{}", persist.namespace(), cache_key.path()),
        })
    }

    /// Finds the most recent value of a previous epoch that may be served stale.
    fn find_stale(&self, cache_key: &VersionedKey, now: u64) -> Option<T> {
        let window = self.inner.config.stale_window();
        let ledger = self.ledger();
        for record in ledger.iter_rev() {
            if &record.cache_key == cache_key || record.content_key() != cache_key.content_key() {
                continue;
            }
            let Some(entry) = self.inner.cache.get(&record.cache_key) else {
                continue;
            };
            let Some(value) = entry.value() else {
                continue;
            };
            if now.saturating_sub(record.created_at) < window {
                return Some(value);
            }
            // Everything further back is even older.
            break;
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn ledger_len(&self) -> usize {
        self.ledger().len()
    }

    fn ledger(&self) -> MutexGuard<'_, EpochLedger> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reads a value from the shared cache, ignoring anything that is not a valid `T`.
fn fetch_remote<T>(remote: RemoteTarget, is_valid: ValidityFn<T>) -> BoxFuture<'static, Option<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    async move {
        let value = remote.service.fetch(&remote.cache, &remote.key).await?;
        match serde_json::from_value::<T>(value) {
            Ok(value) if is_valid(&value) => Some(value),
            Ok(_) => {
                tracing::debug!("Ignoring empty {} value in shared cache", remote.cache);
                None
            }
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::warn!(stderr, "Invalid {} value in shared cache", remote.cache);
                None
            }
        }
    }
    .boxed()
}
