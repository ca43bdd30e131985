use std::collections::VecDeque;

use super::cache_key::{CacheKey, VersionedKey};

/// A record of an entry being created.
#[derive(Debug, Clone)]
pub(crate) struct LedgerRecord {
    /// Creation time of the entry, in milliseconds since the unix epoch.
    pub created_at: u64,
    /// The key of the entry in the in-memory store.
    pub cache_key: VersionedKey,
}

impl LedgerRecord {
    pub fn content_key(&self) -> &CacheKey {
        self.cache_key.content_key()
    }
}

/// An ordered log of entry creations.
///
/// The in-memory store is keyed by epoch, so it can not answer "what is the most recent
/// value for these arguments". The ledger can, by being scanned from the back.
///
/// The ledger holds at most `capacity` records. When full, records whose entries are no
/// longer in the store are dropped first, and only then the oldest record.
#[derive(Debug)]
pub(crate) struct EpochLedger {
    records: VecDeque<LedgerRecord>,
    capacity: usize,
}

impl EpochLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends a record, making room for it if necessary.
    ///
    /// `is_live` tells whether the entry of a record is still in the store.
    pub fn push(&mut self, record: LedgerRecord, is_live: impl Fn(&VersionedKey) -> bool) {
        if self.records.len() >= self.capacity {
            let before = self.records.len();
            self.records.retain(|record| is_live(&record.cache_key));
            tracing::trace!(
                "Compacted epoch ledger from {} to {} records",
                before,
                self.records.len()
            );
        }
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Iterates over records, most recent first.
    pub fn iter_rev(&self) -> impl Iterator<Item = &LedgerRecord> {
        self.records.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
