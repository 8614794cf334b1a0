//! Local record cache: a by-RID hint, never authoritative.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::record::{Record, Rid};

/// Bounded mapping RID → most recent record image. Not a strict cache
/// contract: storage is always the source of truth, this only shortcuts a
/// round trip when the record has not been concurrently invalidated.
pub struct LocalRecordCache {
    inner: Mutex<LruCache<Rid, Record>>,
    enabled: bool,
}

impl LocalRecordCache {
    pub fn new(capacity: usize) -> Self {
        let enabled = capacity > 0;
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        LocalRecordCache {
            inner: Mutex::new(LruCache::new(cap)),
            enabled,
        }
    }

    /// Called when the database opens; currently a no-op placeholder for
    /// symmetry with `shutdown`, kept because storage startup/shutdown hooks
    /// are a pair in the façade's lifecycle.
    pub fn startup(&self) {}

    pub fn shutdown(&self) {
        self.clear();
    }

    pub fn find_record(&self, rid: &Rid) -> Option<Record> {
        if !self.enabled {
            return None;
        }
        self.inner.lock().get(rid).cloned()
    }

    pub fn update_record(&self, record: Record) {
        if !self.enabled {
            return;
        }
        self.inner.lock().put(record.rid, record);
    }

    pub fn delete_record(&self, rid: &Rid) {
        self.inner.lock().pop(rid);
    }

    /// Cleared after every request; the cache is a per-request hint, not
    /// a durable store.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record::RecordVersion;

    fn record(pos: i64) -> Record {
        Record::loaded(Rid::new(9, pos), RecordVersion::Tracked(1), 1, b"{}".to_vec())
    }

    #[test]
    fn find_miss_on_empty_cache() {
        let cache = LocalRecordCache::new(8);
        assert!(cache.find_record(&Rid::new(9, 1)).is_none());
    }

    #[test]
    fn update_then_find_hits() {
        let cache = LocalRecordCache::new(8);
        let r = record(1);
        cache.update_record(r.clone());
        let found = cache.find_record(&r.rid).expect("cache hit");
        assert_eq!(found.bytes, r.bytes);
    }

    #[test]
    fn delete_evicts() {
        let cache = LocalRecordCache::new(8);
        let r = record(1);
        cache.update_record(r.clone());
        cache.delete_record(&r.rid);
        assert!(cache.find_record(&r.rid).is_none());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = LocalRecordCache::new(8);
        cache.update_record(record(1));
        cache.update_record(record(2));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = LocalRecordCache::new(0);
        cache.update_record(record(1));
        assert!(cache.find_record(&Rid::new(9, 1)).is_none());
    }
}
