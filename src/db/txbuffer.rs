//! In-memory transaction buffer, replayed to storage at commit.

use std::collections::{BTreeMap, BTreeSet};

use super::record::{Record, Rid};

/// Result of looking a RID up in the buffer before consulting cache/storage.
pub enum TxLookup<'a> {
    /// The RID was deleted in this transaction; callers must not fall
    /// through to cache or storage.
    Deleted,
    Found(&'a Record),
    NotBuffered,
}

/// Buffered created/updated/deleted records for one transaction, keyed by
/// RID. Ordered by RID (a `BTreeMap`) rather than strict insertion order:
/// this still gives commit a deterministic, reproducible replay sequence
/// without needing an extra ordered-map dependency, and constraints on
/// created/updated counts and pairing don't depend on insertion order
/// anyway.
#[derive(Default)]
pub struct TxBuffer {
    created: BTreeMap<Rid, Record>,
    updated: BTreeMap<Rid, Record>,
    deleted: BTreeSet<Rid>,
    active: bool,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.created.clear();
        self.updated.clear();
        self.deleted.clear();
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Enqueue a create. The RID must be "new" at enqueue time;
    /// storage assigns the final identity at commit.
    pub fn enqueue_create(&mut self, record: Record) {
        debug_assert!(record.rid.is_new());
        self.deleted.remove(&record.rid);
        self.created.insert(record.rid, record);
    }

    /// Enqueue an update. If the same RID was created earlier in this
    /// transaction, the update collapses into the create's final version
    /// instead of producing a separate updated-records entry.
    pub fn enqueue_update(&mut self, record: Record) {
        self.deleted.remove(&record.rid);
        if let Some(existing) = self.created.get_mut(&record.rid) {
            existing.bytes = record.bytes;
            existing.version = record.version;
            existing.dirty = true;
        } else {
            self.updated.insert(record.rid, record);
        }
    }

    pub fn enqueue_delete(&mut self, rid: Rid) {
        self.created.remove(&rid);
        self.updated.remove(&rid);
        self.deleted.insert(rid);
    }

    pub fn lookup(&self, rid: &Rid) -> TxLookup<'_> {
        if self.deleted.contains(rid) {
            return TxLookup::Deleted;
        }
        if let Some(record) = self.created.get(rid) {
            return TxLookup::Found(record);
        }
        if let Some(record) = self.updated.get(rid) {
            return TxLookup::Found(record);
        }
        TxLookup::NotBuffered
    }

    pub fn created(&self) -> impl Iterator<Item = (&Rid, &Record)> {
        self.created.iter()
    }

    pub fn updated(&self) -> impl Iterator<Item = (&Rid, &Record)> {
        self.updated.iter()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &Rid> {
        self.deleted.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Commit order is created, then updated, then deleted -- an
    /// implementation choice, stable as long as it stays consistent.
    pub fn reset(&mut self) {
        self.created.clear();
        self.updated.clear();
        self.deleted.clear();
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record::RecordVersion;

    #[test]
    fn lookup_returns_deleted_sentinel() {
        let mut tx = TxBuffer::new();
        tx.begin();
        let rid = Rid::new(9, 1);
        tx.enqueue_delete(rid);
        assert!(matches!(tx.lookup(&rid), TxLookup::Deleted));
    }

    #[test]
    fn update_after_create_collapses_into_create() {
        let mut tx = TxBuffer::new();
        tx.begin();
        let mut created = Record::new(9, 1, b"{\"k\":1}".to_vec());
        created.rid = Rid::new(9, 5);
        tx.enqueue_create(created.clone());

        let mut updated = created.clone();
        updated.bytes = b"{\"k\":2}".to_vec();
        updated.version = RecordVersion::Tracked(2);
        tx.enqueue_update(updated.clone());

        assert_eq!(tx.created().count(), 1);
        assert_eq!(tx.updated().count(), 0);
        let (_, stored) = tx.created().next().unwrap();
        assert_eq!(stored.bytes, updated.bytes);
    }

    #[test]
    fn delete_removes_from_created_and_updated() {
        let mut tx = TxBuffer::new();
        tx.begin();
        let rid = Rid::new(9, 5);
        let mut record = Record::new(9, 1, b"{}".to_vec());
        record.rid = rid;
        tx.enqueue_update(record);
        tx.enqueue_delete(rid);
        assert!(matches!(tx.lookup(&rid), TxLookup::Deleted));
        assert_eq!(tx.updated().count(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut tx = TxBuffer::new();
        tx.begin();
        tx.enqueue_delete(Rid::new(9, 1));
        tx.reset();
        assert!(tx.is_empty());
        assert!(!tx.is_active());
    }
}
