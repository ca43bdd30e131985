//! # Memoization with epochs
//!
//! A memoized function sits in front of an expensive asynchronous producer, like a price
//! lookup or an on-chain read. It avoids concurrent duplicate calls to the producer, rotates
//! its values as time passes without any explicit invalidation, and prefers serving a slightly
//! outdated value over making the caller wait.
//!
//! ## Epochs
//!
//! Time is cut into fixed-width buckets, the epochs, whose width is the configured `ttl`. The
//! id of an epoch is `floor(now / ttl)`. Every value is keyed by its [`CacheKey`], derived from
//! the call arguments, combined with the epoch it was computed in, forming a [`VersionedKey`].
//! A new epoch thus means a new key, and a new producer invocation.
//!
//! ## Cache Layers
//!
//! - An in-memory layer, keyed by [`VersionedKey`]. It holds one entry per producer invocation,
//!   which is inserted before the producer settles. All concurrent calls with the same
//!   arguments in the same epoch share that entry.
//! - An optional shared cache layer, see [`SharedCacheService`]. When a cache has `persist`
//!   configured, a fresh entry races the producer against a lookup in the shared cache, and the
//!   first one to produce a value wins. Values computed by the producer are written through.
//!
//! A call goes through the following steps:
//! - The entry for the current epoch is looked up, or created.
//! - If that entry already has a value, it is returned.
//! - Otherwise, if `using_stale_value` is enabled, the epoch ledger is scanned backwards for
//!   the most recent value of a previous epoch. It is returned if it is younger than
//!   `max_age` and five epochs.
//! - Otherwise, if `reject_when_no_cache` is enabled, the call fails with
//!   [`CacheError::NoCache`].
//! - Otherwise, the call waits for the current epoch.
//!
//! Failures and empty values are never cached. Their entry is removed as soon as they settle,
//! and the next call starts a fresh computation.
//!
//! ### Metrics
//!
//! We collect a couple of metrics, each of those is tagged with a `cache` field that corresponds to
//! the name of the memoized function. Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by a computed value of the current epoch.
//! - `caches.memory.coalesced`: Accesses that joined a running computation.
//! - `caches.stale.hit`: Accesses served by a value of a previous epoch.
//! - `caches.no_cache`: Accesses rejected because of `reject_when_no_cache`.
//! - `caches.computation`: Producer invocations.
//! - `caches.computation.invalid`: Producer invocations that returned an empty value.
//! - `caches.computation.error`: Producer invocations that failed, tagged with a `reason`.
//! - `caches.ledger.size`: A gauge of the number of records in the epoch ledger.
//! - `services.shared_cache.fetch(hit:true)`: Values served by the shared-cache layer.

mod cache_error;
mod cache_key;
mod config;
mod epoch;
mod ledger;
mod memory;
pub mod shared_cache;
mod timeout;
mod validity;


pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder, VersionedKey};
pub use config::{MemoizeConfig, MemoizeOptions, PersistConfig};
pub use epoch::{Clock, EpochId, ManualClock, SystemClock};
pub use memory::{Memoized, wrap};
pub use shared_cache::{
    SharedCacheBackendConfig, SharedCacheConfig, SharedCacheRef, SharedCacheService,
};
pub use timeout::with_timeout;
pub use validity::is_valid_default;
