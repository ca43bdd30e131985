use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::cache_error::CacheError;
use super::epoch::EpochId;

/// The time-independent identity of a memoized call.
///
/// Two calls with structurally equal arguments always have equal keys.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hash_path(&self.hash))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Derives the key for the given call arguments.
    ///
    /// The arguments are serialized into canonical JSON (object keys sorted), which is then
    /// hashed. Arguments that can not be represented as JSON, like maps with non-string
    /// keys, fail with [`CacheError::Serialization`].
    pub fn from_args<A: Serialize + ?Sized>(args: &A) -> Result<Self, CacheError> {
        let mut builder = CacheKeyBuilder::default();
        builder.write_args(args)?;
        Ok(builder.build())
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`].
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes the canonical form of the call arguments into the [`CacheKey`].
    pub fn write_args<A: Serialize + ?Sized>(&mut self, args: &A) -> Result<(), CacheError> {
        let value = serde_json::to_value(args)?;
        self.metadata.push_str("args: ");
        write_canonical(&mut self.metadata, &value)?;
        self.metadata.push('\n');
        Ok(())
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        CacheKey {
            hash: Sha256::digest(&self.metadata).into(),
            metadata: self.metadata.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Writes `value` as compact JSON with object keys in sorted order.
///
/// `serde_json` keeps insertion order when its `preserve_order` feature is enabled anywhere
/// in the dependency graph, so the ordering is done here explicitly.
fn write_canonical(out: &mut String, value: &Value) -> Result<(), CacheError> {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(out, item)?;
            }
            out.push('}');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// A [`CacheKey`] combined with the epoch it is valid in.
///
/// This is the key of the in-memory store and, prefixed with a namespace, of the remote store.
#[derive(Debug, Clone, Eq)]
pub struct VersionedKey {
    content_key: CacheKey,
    epoch: EpochId,
    hash: [u8; 32],
}

impl VersionedKey {
    pub fn new(content_key: &CacheKey, epoch: EpochId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content_key.hash);
        hasher.update(epoch.0.to_be_bytes());

        Self {
            content_key: content_key.clone(),
            epoch,
            hash: hasher.finalize().into(),
        }
    }

    pub fn content_key(&self) -> &CacheKey {
        &self.content_key
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    /// Returns the relative path for this key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn path(&self) -> String {
        hash_path(&self.hash)
    }
}

impl fmt::Display for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl PartialEq for VersionedKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for VersionedKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

fn hash_path(hash: &[u8; 32]) -> String {
    let mut path = format!("{:02x}/", hash[0]);
    for b in &hash[1..4] {
        let _ = write!(path, "{b:02x}");
    }
    path.push('/');
    for b in &hash[4..] {
        let _ = write!(path, "{b:02x}");
    }
    path
}
