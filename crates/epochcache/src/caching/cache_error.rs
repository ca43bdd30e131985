use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::epoch::EpochId;

/// An error that happens when calling a memoized producer.
///
/// None of these variants is ever stored in the cache. A failed call only reaches the callers
/// that were awaiting that particular computation, the next call starts a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The call arguments could not be turned into a cache key.
    ///
    /// This is a bug in the caller, and it is reported before anything is looked up.
    #[error("failed to derive cache key: {0}")]
    Serialization(String),
    /// The producer returned an error.
    ///
    /// The attached string contains the full error chain of the producer.
    #[error("producer failed: {0}")]
    ProducerFailed(String),
    /// The producer did not settle within the configured `request_timeout`.
    #[error("producer timed out after {0:?}")]
    Timeout(Duration),
    /// No value was ready and the cache is configured to not wait for a fresh one.
    #[error(
        "no cached value available (instance: {instance}, epoch: {epoch}, ledger size: {ledger_len})"
    )]
    NoCache {
        instance: Uuid,
        epoch: EpochId,
        ledger_len: usize,
    },
    /// An unexpected error, like a panicking producer.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Wraps a producer error, keeping its context chain.
    pub fn producer(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        Self::ProducerFailed(format!("{err:#}"))
    }

    /// A short tag used for metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Serialization(_) => "serialization",
            Self::ProducerFailed(_) => "producer",
            Self::Timeout(_) => "timeout",
            Self::NoCache { .. } => "no-cache",
            Self::InternalError => "internal",
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// The result of a memoized call, containing either `Ok(T)` or the reason why no value
/// could be provided.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
