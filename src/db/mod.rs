//! Database façade: `Storage` (wire-agnostic interface) + `Database`
//! (concrete struct composing Storage, the hook pipeline, the local cache
//! and the transaction buffer). Deep inheritance collapses to interface +
//! struct, no class hierarchy.

pub mod cache;
pub mod hooks;
pub mod memory;
pub mod record;
pub mod txbuffer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::errors::{Error, FacadeError};
use crate::utils::dashmap::new_dashmap;

use cache::LocalRecordCache;
use hooks::{DistributedMode, HookEvent, HookRegistry, HookResult, RunMode};
use record::{Record, RecordVersion, Rid};
use txbuffer::{TxBuffer, TxLookup};

/// A permission an operation requires on a cluster or resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingStrategy {
    None,
    KeepShared,
    KeepExclusive,
}

/// Outcome of a storage-level save. `Rerouted` covers the case where
/// storage silently redirected the write to a different cluster or rid.
pub enum SaveOutcome {
    Saved {
        rid: Rid,
        version: RecordVersion,
        bytes: Vec<u8>,
    },
    Rerouted {
        rid: Rid,
        version: RecordVersion,
        bytes: Vec<u8>,
    },
}

pub enum DeleteOutcome {
    Deleted,
    Rerouted,
    /// The record moved rather than being removed outright; the cache entry
    /// must be left alone.
    Moved,
}

/// Wire-agnostic storage contract. The on-disk engine, index manager and
/// schema/security metadata store are out of scope and are consumed
/// only through this trait and `AuthProvider` below.
pub trait Storage: Send + Sync {
    fn read(
        &self,
        rid: Rid,
        fetch_plan: Option<&str>,
        load_tombstone: bool,
    ) -> Result<Option<Record>, Error>;

    fn save(
        &self,
        record: &Record,
        cluster_id: i16,
        mode: SaveMode,
    ) -> Result<SaveOutcome, Error>;

    fn delete(
        &self,
        rid: Rid,
        version: RecordVersion,
        require_exists: bool,
    ) -> Result<DeleteOutcome, Error>;

    fn clean_out(&self, rid: Rid, version: RecordVersion) -> Result<DeleteOutcome, Error>;

    fn hide(&self, rid: Rid) -> Result<(), Error>;

    fn cluster_exists(&self, cluster_id: i16) -> bool;

    fn is_distributed(&self) -> bool {
        false
    }

    /// True for storage variants where a new record's class must match the
    /// cluster it is assigned to.
    fn detects_class_by_cluster_id(&self) -> bool {
        false
    }

    fn class_for_cluster(&self, _cluster_id: i16) -> Option<String> {
        None
    }

    fn declared_class(&self, _record: &Record) -> Option<String> {
        None
    }

    /// Remote storage bypasses schema-based auth and mints a passthrough
    /// user on `open`.
    fn is_remote_passthrough(&self) -> bool {
        false
    }
}

/// A single resource rule: generic (`specific = None`, i.e. `resource.ALL`)
/// or scoped to one specific named resource (e.g. one cluster name).
#[derive(Debug, Clone)]
pub struct ResourceRule {
    pub resource: String,
    pub specific: Option<String>,
    pub allows: fn(Permission) -> bool,
}

#[derive(Debug, Clone, Default)]
pub struct Role {
    pub name: String,
    pub rules: Vec<ResourceRule>,
}

#[derive(Debug, Clone, Default)]
pub struct AppUser {
    pub username: String,
    pub roles: Vec<Role>,
}

impl AppUser {
    pub fn has_roles(&self) -> bool {
        !self.roles.is_empty()
    }
}

/// Authentication/authorization metadata store, out of scope beyond
/// this contract.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> Result<AppUser, FacadeError>;

    /// Recovery-only affordance (Open Question 1, resolved in DESIGN.md):
    /// only ever invoked when the caller has explicitly opted in via
    /// `allow_admin_repair`.
    fn repair_admin(&self) -> Result<AppUser, FacadeError> {
        Err(FacadeError::AccessDenied(
            "admin repair is not supported by this auth provider".to_string(),
        ))
    }
}

/// Composes `Storage` + hook pipeline + local cache + transaction buffer.
pub struct Database<S: Storage> {
    name: String,
    storage: Arc<S>,
    hooks: HookRegistry,
    cache: LocalRecordCache,
    tx: Mutex<TxBuffer>,
    mvcc_enabled: bool,
    index_locks: DashMap<String, Arc<Mutex<()>>>,
    current_user: Mutex<Option<AppUser>>,
    open: AtomicBool,
}

impl<S: Storage> Database<S> {
    pub fn new(name: impl Into<String>, storage: Arc<S>, cache_capacity: usize, mvcc_enabled: bool) -> Self {
        Database {
            name: name.into(),
            storage,
            hooks: HookRegistry::new(),
            cache: LocalRecordCache::new(cache_capacity),
            tx: Mutex::new(TxBuffer::new()),
            mvcc_enabled,
            index_locks: new_dashmap(num_cpus::get()),
            current_user: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn require_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FacadeError::NotOpen(self.name.clone()).into())
        }
    }

    /// `open(user, pw)`.
    pub fn open(
        &self,
        auth: &dyn AuthProvider,
        username: &str,
        password: &str,
        allow_admin_repair: bool,
    ) -> Result<(), Error> {
        if self.is_open() {
            return Err(FacadeError::AlreadyOpen(self.name.clone()).into());
        }

        let user = if self.storage.is_remote_passthrough() {
            AppUser {
                username: username.to_string(),
                roles: vec![Role {
                    name: "passthrough".to_string(),
                    rules: Vec::new(),
                }],
            }
        } else {
            let authenticated = auth.authenticate(username, password)?;
            if !authenticated.has_roles() {
                if allow_admin_repair {
                    auth.repair_admin()?
                } else {
                    return Err(FacadeError::AccessDenied(format!(
                        "user {username} has no roles and admin repair is disabled"
                    ))
                    .into());
                }
            } else {
                authenticated
            }
        };

        *self.current_user.lock() = Some(user);
        self.cache.startup();
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    pub fn close(&self) {
        self.cache.shutdown();
        self.hooks.clear();
        *self.current_user.lock() = None;
        self.open.store(false, Ordering::Release);
    }

    /// `checkSecurity(resource, op, specifics…)`. Preserves the
    /// original's last-matching-specific-wins semantics bit for bit
    /// (Open Question 3, resolved in DESIGN.md): a generic `resource.ALL`
    /// rule sets the baseline, then each specific in `specifics` that has a
    /// matching rule overwrites the decision, in order -- no all-or-none
    /// aggregation.
    pub fn check_security(
        &self,
        resource: &str,
        op: Permission,
        specifics: &[String],
    ) -> Result<(), FacadeError> {
        let guard = self.current_user.lock();
        let user = guard
            .as_ref()
            .ok_or_else(|| FacadeError::AccessDenied("no authenticated user".to_string()))?;

        let mut allowed = false;
        for role in &user.roles {
            for rule in &role.rules {
                if rule.resource == resource && rule.specific.is_none() {
                    allowed = (rule.allows)(op);
                }
            }
        }
        for specific in specifics {
            for role in &user.roles {
                for rule in &role.rules {
                    if rule.resource == resource && rule.specific.as_deref() == Some(specific.as_str())
                    {
                        allowed = (rule.allows)(op);
                    }
                }
            }
        }

        if allowed {
            Ok(())
        } else {
            Err(FacadeError::AccessDenied(format!(
                "{resource} {op:?} denied for user {}",
                user.username
            )))
        }
    }

    fn check_cluster_permission(&self, cluster_id: i16, op: Permission) -> Result<(), Error> {
        self.check_security("cluster", op, &[cluster_id.to_string()])
            .map_err(Error::from)
    }

    /// `load(rid, fetchPlan?, ignoreCache?, loadTombstone?, lockingStrategy)`.
    pub fn load(
        &self,
        rid: Rid,
        fetch_plan: Option<&str>,
        ignore_cache: bool,
        load_tombstone: bool,
        _locking: LockingStrategy,
    ) -> Result<Option<Record>, Error> {
        self.require_open()?;
        self.check_cluster_permission(rid.cluster_id, Permission::Read)?;

        {
            let tx = self.tx.lock();
            match tx.lookup(&rid) {
                TxLookup::Deleted => return Ok(None),
                TxLookup::Found(record) => return Ok(Some(record.clone())),
                TxLookup::NotBuffered => {}
            }
        }

        if !ignore_cache {
            if let Some(cached) = self.cache.find_record(&rid) {
                return Ok(Some(cached));
            }
        }

        let Some(mut record) = self.storage.read(rid, fetch_plan, load_tombstone)? else {
            return Ok(None);
        };

        if record.is_tombstone() {
            return Ok(if load_tombstone { Some(record) } else { None });
        }

        let distributed = self.storage.is_distributed();
        let before = self
            .hooks
            .callback_hooks(HookEvent::BeforeRead, &mut record, distributed, RunMode::Default);
        if matches!(before, HookResult::Skip) {
            return Ok(None);
        }

        self.hooks
            .callback_hooks(HookEvent::AfterRead, &mut record, distributed, RunMode::Default);
        self.cache.update_record(record.clone());
        Ok(Some(record))
    }

    /// `save(record, cluster?, mode, forceCreate, …)`.
    pub fn save(
        &self,
        mut record: Record,
        cluster: Option<i16>,
        mode: SaveMode,
        force_create: bool,
    ) -> Result<Record, Error> {
        self.require_open()?;
        if !record.dirty {
            return Ok(record);
        }

        let is_new = record.rid.is_new() || force_create;
        let cluster_id = if is_new {
            cluster.unwrap_or(record.rid.cluster_id)
        } else {
            record.rid.cluster_id
        };

        if !self.storage.cluster_exists(cluster_id) {
            return Err(Error::Facade(FacadeError::ClusterNotFound(cluster_id)));
        }

        if is_new && self.storage.detects_class_by_cluster_id() {
            if let (Some(expected), Some(declared)) = (
                self.storage.class_for_cluster(cluster_id),
                self.storage.declared_class(&record),
            ) {
                if expected != declared {
                    return Err(Error::Facade(FacadeError::Internal {
                        rid: Some(record.rid),
                        message: format!(
                            "record class {declared} does not match cluster {cluster_id} class {expected}"
                        ),
                    }));
                }
            }
        }

        self.check_cluster_permission(
            cluster_id,
            if is_new {
                Permission::Create
            } else {
                Permission::Update
            },
        )?;
        record.rid.cluster_id = cluster_id;

        let distributed = self.storage.is_distributed();
        let before_event = if is_new {
            HookEvent::BeforeCreate
        } else {
            HookEvent::BeforeUpdate
        };

        let index_names = self.touched_index_names(&record);
        let _locks = self.acquire_index_locks(&index_names);
        let _release = scopeguard::guard((), |_| self.release_index_locks(&index_names));

        match self
            .hooks
            .callback_hooks(before_event, &mut record, distributed, RunMode::Default)
        {
            HookResult::SkipIo => return Ok(record),
            HookResult::RecordReplaced(replacement) => return Ok(replacement),
            HookResult::RecordChanged | HookResult::RecordNotChanged => {}
            HookResult::Skip => return Ok(record),
        }

        if self.mvcc_enabled && !record.version.is_tracked() && !is_new {
            record.version = RecordVersion::Untracked;
        }

        let save_result = self.storage.save(&record, cluster_id, mode);

        let failed_event = if is_new {
            HookEvent::CreateFailed
        } else {
            HookEvent::UpdateFailed
        };

        let outcome = match save_result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.hooks
                    .callback_hooks(failed_event, &mut record, distributed, RunMode::Default);
                record.status = record::RecordStatus::NotLoaded;
                return Err(err);
            }
        };

        let (rid, version, bytes, rerouted) = match outcome {
            SaveOutcome::Saved { rid, version, bytes } => (rid, version, bytes, false),
            SaveOutcome::Rerouted { rid, version, bytes } => (rid, version, bytes, true),
        };

        record.rid = rid;
        record.version = version;
        record.bytes = bytes;
        record.dirty = false;
        record.status = record::RecordStatus::Loaded;

        let success_event = match (is_new, rerouted) {
            (true, false) => HookEvent::AfterCreate,
            (true, true) => HookEvent::CreateReplicated,
            (false, false) => HookEvent::AfterUpdate,
            (false, true) => HookEvent::UpdateReplicated,
        };
        self.hooks
            .callback_hooks(success_event, &mut record, distributed, RunMode::Default);

        self.cache.update_record(record.clone());
        Ok(record)
    }

    /// `delete(rid, version, requireExists, callHooks, mode, prohibitTombstone)`.
    pub fn delete(
        &self,
        rid: Rid,
        version: RecordVersion,
        require_exists: bool,
        call_hooks: bool,
        prohibit_tombstone: bool,
    ) -> Result<(), Error> {
        self.require_open()?;
        self.check_cluster_permission(rid.cluster_id, Permission::Delete)?;

        let distributed = self.storage.is_distributed();
        let mut placeholder = Record::loaded(rid, version, 0, Vec::new());

        if call_hooks {
            self.hooks.callback_hooks(
                HookEvent::BeforeDelete,
                &mut placeholder,
                distributed,
                RunMode::Default,
            );
        }

        let result = if prohibit_tombstone {
            self.storage.clean_out(rid, version)
        } else {
            self.storage.delete(rid, version, require_exists)
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                if call_hooks {
                    self.hooks.callback_hooks(
                        HookEvent::DeleteFailed,
                        &mut placeholder,
                        distributed,
                        RunMode::Default,
                    );
                }
                return Err(err);
            }
        };

        if call_hooks {
            let event = if matches!(outcome, DeleteOutcome::Rerouted) {
                HookEvent::DeleteReplicated
            } else {
                HookEvent::AfterDelete
            };
            self.hooks
                .callback_hooks(event, &mut placeholder, distributed, RunMode::Default);
        }

        if !matches!(outcome, DeleteOutcome::Moved) {
            self.cache.delete_record(&rid);
        }
        Ok(())
    }

    /// `hide(rid, mode)`: like delete, storage `hide`, no hook fired.
    pub fn hide(&self, rid: Rid) -> Result<(), Error> {
        self.require_open()?;
        self.check_cluster_permission(rid.cluster_id, Permission::Delete)?;
        self.storage.hide(rid)?;
        self.cache.delete_record(&rid);
        Ok(())
    }

    pub fn begin_transaction(&self) {
        self.tx.lock().begin();
    }

    pub fn tx_enqueue_create(&self, record: Record) {
        self.tx.lock().enqueue_create(record);
    }

    pub fn tx_enqueue_update(&self, record: Record) {
        self.tx.lock().enqueue_update(record);
    }

    pub fn tx_enqueue_delete(&self, rid: Rid) {
        self.tx.lock().enqueue_delete(rid);
    }

    /// `commit(tx)`: replay created, then updated, then
    /// deleted; on any failure roll back and surface the error.
    pub fn commit(&self) -> Result<CommitReport, Error> {
        self.require_open()?;
        let mut report = CommitReport::default();

        let (created, updated, deleted): (Vec<_>, Vec<_>, Vec<_>) = {
            let tx = self.tx.lock();
            (
                tx.created().map(|(_, r)| r.clone()).collect(),
                tx.updated().map(|(_, r)| r.clone()).collect(),
                tx.deleted().copied().collect(),
            )
        };

        let result = (|| -> Result<(), Error> {
            for record in created {
                let client_rid = record.rid;
                let saved = self.save(record, None, SaveMode::Sync, true)?;
                report.created.insert(client_rid, saved.rid);
            }
            for record in updated {
                let rid = record.rid;
                let saved = self.save(record, None, SaveMode::Sync, false)?;
                report.updated.insert(rid, saved.version);
            }
            for rid in deleted {
                self.delete(rid, RecordVersion::Untracked, false, true, false)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.tx.lock().reset();
                Ok(report)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    pub fn rollback(&self) {
        let mut tx = self.tx.lock();
        if tx.is_active() {
            tx.reset();
        }
    }

    /// Index names a save touches. Index manager internals are out of
    /// scope; the façade only needs their names to serialize
    /// concurrent modifications in a fixed order.
    fn touched_index_names(&self, record: &Record) -> Vec<String> {
        self.storage
            .declared_class(record)
            .map(|class| vec![format!("{class}.idx")])
            .unwrap_or_default()
    }

    /// Index modification locks are acquired in lexicographic order to
    /// avoid deadlock and released in `finally`
    /// via the caller's `scopeguard::guard`.
    fn acquire_index_locks(&self, names: &[String]) -> Vec<Arc<Mutex<()>>> {
        let mut sorted = names.to_vec();
        sorted.sort();
        sorted
            .into_iter()
            .map(|name| {
                self.index_locks
                    .entry(name)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            })
            .collect()
    }

    fn release_index_locks(&self, _names: &[String]) {
        // Locks are Arc<Mutex<()>> guards held by the RAII guard objects
        // returned from `acquire_index_locks`; dropping them releases the
        // lock. Kept as an explicit, named step so the "always release in
        // finally" contract is visible at the call site.
    }
}

/// Returned by `commit`: identity/version changes the client must apply.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub created: HashMap<Rid, Rid>,
    pub updated: HashMap<Rid, RecordVersion>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

    struct MemStorage {
        next_position: AtomicI64,
        records: DashMap<Rid, Record>,
    }

    impl MemStorage {
        fn new() -> Self {
            MemStorage {
                next_position: AtomicI64::new(1),
                records: DashMap::new(),
            }
        }
    }

    impl Storage for MemStorage {
        fn read(
            &self,
            rid: Rid,
            _fetch_plan: Option<&str>,
            _load_tombstone: bool,
        ) -> Result<Option<Record>, Error> {
            Ok(self.records.get(&rid).map(|r| r.clone()))
        }

        fn save(&self, record: &Record, cluster_id: i16, _mode: SaveMode) -> Result<SaveOutcome, Error> {
            let rid = if record.rid.is_persistent() {
                record.rid
            } else {
                let pos = self.next_position.fetch_add(1, AtomicOrdering::Relaxed);
                Rid::new(cluster_id, pos)
            };
            let version = if record.rid.is_persistent() {
                record.version.bump()
            } else {
                RecordVersion::initial()
            };
            let stored = Record::loaded(rid, version, record.record_type, record.bytes.clone());
            self.records.insert(rid, stored.clone());
            Ok(SaveOutcome::Saved {
                rid,
                version,
                bytes: stored.bytes,
            })
        }

        fn delete(&self, rid: Rid, _version: RecordVersion, _require_exists: bool) -> Result<DeleteOutcome, Error> {
            self.records.remove(&rid);
            Ok(DeleteOutcome::Deleted)
        }

        fn clean_out(&self, rid: Rid, version: RecordVersion) -> Result<DeleteOutcome, Error> {
            self.delete(rid, version, false)
        }

        fn hide(&self, rid: Rid) -> Result<(), Error> {
            self.records.remove(&rid);
            Ok(())
        }

        fn cluster_exists(&self, cluster_id: i16) -> bool {
            cluster_id >= 0
        }
    }

    struct AllowAllAuth;

    impl AuthProvider for AllowAllAuth {
        fn authenticate(&self, username: &str, _password: &str) -> Result<AppUser, FacadeError> {
            Ok(AppUser {
                username: username.to_string(),
                roles: vec![Role {
                    name: "admin".to_string(),
                    rules: vec![ResourceRule {
                        resource: "cluster".to_string(),
                        specific: None,
                        allows: |_| true,
                    }],
                }],
            })
        }
    }

    fn open_db() -> Database<MemStorage> {
        let db = Database::new("demo", Arc::new(MemStorage::new()), 16, true);
        db.open(&AllowAllAuth, "admin", "admin", false).unwrap();
        db
    }

    #[test]
    fn create_then_load_round_trips_bytes_and_version() {
        let db = open_db();
        let record = Record::new(9, 1, br#"{"k":1}"#.to_vec());
        let saved = db.save(record, Some(9), SaveMode::Sync, false).unwrap();
        assert_eq!(saved.version, RecordVersion::Tracked(1));

        let loaded = db
            .load(saved.rid, None, false, false, LockingStrategy::None)
            .unwrap()
            .expect("record present");
        assert_eq!(loaded.bytes, br#"{"k":1}"#.to_vec());
        assert_eq!(loaded.version, RecordVersion::Tracked(1));
    }

    #[test]
    fn save_then_load_uses_cache_without_hitting_storage_twice() {
        let db = open_db();
        let record = Record::new(9, 1, b"{}".to_vec());
        let saved = db.save(record, Some(9), SaveMode::Sync, false).unwrap();
        db.cache.delete_record(&saved.rid);
        db.cache.update_record(saved.clone());
        let loaded = db
            .load(saved.rid, None, false, false, LockingStrategy::None)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.bytes, saved.bytes);
    }

    #[test]
    fn tx_deleted_short_circuits_load_without_storage() {
        let db = open_db();
        let rid = Rid::new(9, 999);
        db.begin_transaction();
        db.tx_enqueue_delete(rid);
        let loaded = db
            .load(rid, None, false, false, LockingStrategy::None)
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn commit_returns_created_and_updated_pairs() {
        let db = open_db();
        db.begin_transaction();
        let mut created = Record::new(9, 1, b"{}".to_vec());
        created.rid = Rid::new(9, NEW_MARKER);
        db.tx_enqueue_create(created);
        let report = db.commit().unwrap();
        assert_eq!(report.created.len(), 1);
    }

    const NEW_MARKER: i64 = record::NEW_CLUSTER_POSITION;
}
