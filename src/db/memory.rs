//! A default in-memory `Storage`/`AuthProvider` pair. The on-disk storage
//! engine, index manager and schema/security metadata store are out of
//! scope; this backend exists so the server binary has a concrete
//! `Database<S>` to open, not as a production persistence layer.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::record::{Record, RecordVersion, Rid};
use super::{AppUser, DeleteOutcome, Permission, ResourceRule, Role, SaveMode, SaveOutcome, Storage};
use crate::errors::{Error, FacadeError};

pub struct MemoryStorage {
    next_position: AtomicI64,
    records: DashMap<Rid, Record>,
    clusters: Vec<i16>,
}

impl MemoryStorage {
    pub fn new(clusters: Vec<i16>) -> Self {
        MemoryStorage {
            next_position: AtomicI64::new(1),
            records: DashMap::new(),
            clusters,
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage::new(vec![0])
    }
}

impl Storage for MemoryStorage {
    fn read(&self, rid: Rid, _fetch_plan: Option<&str>, _load_tombstone: bool) -> Result<Option<Record>, Error> {
        Ok(self.records.get(&rid).map(|entry| entry.clone()))
    }

    fn save(&self, record: &Record, cluster_id: i16, _mode: SaveMode) -> Result<SaveOutcome, Error> {
        let rid = if record.rid.is_persistent() {
            record.rid
        } else {
            let position = self.next_position.fetch_add(1, Ordering::Relaxed);
            Rid::new(cluster_id, position)
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

    fn delete(&self, rid: Rid, _version: RecordVersion, require_exists: bool) -> Result<DeleteOutcome, Error> {
        match self.records.remove(&rid) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None if require_exists => Err(FacadeError::NotFound(rid).into()),
            None => Ok(DeleteOutcome::Deleted),
        }
    }

    fn clean_out(&self, rid: Rid, version: RecordVersion) -> Result<DeleteOutcome, Error> {
        self.delete(rid, version, false)
    }

    fn hide(&self, rid: Rid) -> Result<(), Error> {
        self.records.remove(&rid);
        Ok(())
    }

    fn cluster_exists(&self, cluster_id: i16) -> bool {
        self.clusters.contains(&cluster_id)
    }
}

/// One configured login. Passwords are compared in
/// plaintext here since SCRAM/JWT negotiation belongs to the (out of
/// scope) auth metadata store, not this default backend.
#[derive(Debug, Clone)]
pub struct StaticUser {
    pub username: String,
    pub password: String,
    pub is_admin: bool,
}

pub struct StaticAuth {
    users: Vec<StaticUser>,
}

impl StaticAuth {
    pub fn new(users: Vec<StaticUser>) -> Self {
        StaticAuth { users }
    }
}

impl super::AuthProvider for StaticAuth {
    fn authenticate(&self, username: &str, password: &str) -> Result<AppUser, FacadeError> {
        let user = self
            .users
            .iter()
            .find(|candidate| candidate.username == username)
            .ok_or_else(|| FacadeError::AccessDenied(format!("unknown user {username}")))?;

        if user.password != password {
            return Err(FacadeError::AccessDenied(format!("bad password for {username}")));
        }

        let allows: fn(Permission) -> bool = |_| true;
        let rules = vec![
            ResourceRule {
                resource: "cluster".to_string(),
                specific: None,
                allows,
            },
            ResourceRule {
                resource: "server".to_string(),
                specific: None,
                allows: if user.is_admin { allows } else { |_| false },
            },
        ];

        Ok(AppUser {
            username: user.username.clone(),
            roles: vec![Role {
                name: if user.is_admin { "admin".to_string() } else { "user".to_string() },
                rules,
            }],
        })
    }
}

pub fn shared_storage(clusters: Vec<i16>) -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new(clusters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AuthProvider;

    #[test]
    fn authenticate_rejects_unknown_user() {
        let auth = StaticAuth::new(vec![StaticUser {
            username: "admin".to_string(),
            password: "secret".to_string(),
            is_admin: true,
        }]);
        assert!(auth.authenticate("nobody", "x").is_err());
    }

    #[test]
    fn authenticate_rejects_bad_password() {
        let auth = StaticAuth::new(vec![StaticUser {
            username: "admin".to_string(),
            password: "secret".to_string(),
            is_admin: true,
        }]);
        assert!(auth.authenticate("admin", "wrong").is_err());
    }

    #[test]
    fn authenticate_accepts_matching_credentials() {
        let auth = StaticAuth::new(vec![StaticUser {
            username: "admin".to_string(),
            password: "secret".to_string(),
            is_admin: true,
        }]);
        let user = auth.authenticate("admin", "secret").unwrap();
        assert!(user.has_roles());
    }
}
