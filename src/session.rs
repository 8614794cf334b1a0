//! Per-connection session state.
//!
//! A session is created on `CONNECT`/`DB_OPEN` and destroyed on
//! `DB_CLOSE`. The dispatcher rebinds the session for every request and
//! rejects any request against an unknown session id unless the opcode is
//! `DB_CLOSE` or `SHUTDOWN`.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use rand::Rng;

use crate::utils::dashmap::new_dashmap;

/// Negotiated protocol version floor below which none of the `proto >= N`
/// optional-field branches apply.
pub const MIN_PROTOCOL_VERSION: i16 = 1;

/// A session's last-command bookkeeping, refreshed after every dispatched
/// request.
#[derive(Debug, Default)]
pub struct LastCommandStats {
    pub opcode: AtomicU32,
    pub started_at_millis: AtomicI64,
    pub duration_micros: AtomicI64,
}

impl LastCommandStats {
    fn record(&self, opcode: u8, started: Instant, duration: std::time::Duration) {
        self.opcode.store(opcode as u32, Ordering::Relaxed);
        self.started_at_millis
            .store(started.elapsed().as_millis() as i64, Ordering::Relaxed);
        self.duration_micros
            .store(duration.as_micros() as i64, Ordering::Relaxed);
    }
}

/// Per-connection session record.
pub struct Session {
    pub id: i32,
    pub protocol_version: i16,
    serializer_name: parking_lot::Mutex<Option<String>>,
    pub client_id: Option<String>,
    pub driver_name: Option<String>,
    pub driver_version: Option<String>,
    /// Name of the last database this session bound with `DB_OPEN`. The
    /// façade handle itself lives in the dispatcher's per-connection
    /// context, not here, since `Database<S>` is generic over the storage
    /// type and a session table must stay storage-agnostic.
    bound_database: parking_lot::Mutex<Option<String>>,
    pub request_count: AtomicU32,
    pub last_command: LastCommandStats,
    created_at: Instant,
}

impl Session {
    fn new(id: i32, protocol_version: i16) -> Self {
        Session {
            id,
            protocol_version,
            serializer_name: parking_lot::Mutex::new(None),
            client_id: None,
            driver_name: None,
            driver_version: None,
            bound_database: parking_lot::Mutex::new(None),
            request_count: AtomicU32::new(0),
            last_command: LastCommandStats::default(),
            created_at: Instant::now(),
        }
    }

    pub fn bound_database(&self) -> Option<String> {
        self.bound_database.lock().clone()
    }

    pub fn bind_database(&self, name: impl Into<String>) {
        *self.bound_database.lock() = Some(name.into());
    }

    pub fn unbind_database(&self) {
        *self.bound_database.lock() = None;
    }

    pub fn is_bound(&self) -> bool {
        self.bound_database.lock().is_some()
    }

    pub fn serializer_name(&self) -> Option<String> {
        self.serializer_name.lock().clone()
    }

    /// Set from `DB_OPEN`'s `serializer` field (`proto > 21` only).
    pub fn set_serializer_name(&self, name: impl Into<String>) {
        *self.serializer_name.lock() = Some(name.into());
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// `proto > 21`.
    pub fn wants_serializer_name(&self) -> bool {
        self.protocol_version > 21
    }

    pub fn note_request(&self, opcode: u8, started: Instant) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.last_command.record(opcode, started, started.elapsed());
    }
}

/// Session table keyed by id, shared across every connection handler on
/// the server; the dispatcher rebinds the session per request from this
/// shared state.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<i32, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            sessions: new_dashmap(num_cpus::get()),
        }
    }

    /// Allocates a fresh session id and registers it; called from
    /// `CONNECT`/`DB_OPEN`.
    pub fn create(&self, protocol_version: i16) -> Arc<Session> {
        loop {
            let id = rand::rng().random_range(1..=i32::MAX);
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.sessions.entry(id) {
                let session = Arc::new(Session::new(id, protocol_version));
                slot.insert(session.clone());
                return session;
            }
        }
    }

    pub fn get(&self, id: i32) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    /// `DB_CLOSE` destroys the session.
    pub fn remove(&self, id: i32) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let table = SessionTable::new();
        let session = table.create(20);
        let found = table.get(session.id).expect("session present");
        assert_eq!(found.protocol_version, 20);
    }

    #[test]
    fn remove_destroys_session() {
        let table = SessionTable::new();
        let session = table.create(20);
        assert!(table.remove(session.id).is_some());
        assert!(table.get(session.id).is_none());
    }

    #[test]
    fn serializer_name_gate_matches_protocol_21_boundary() {
        let table = SessionTable::new();
        let old = table.create(21);
        let new = table.create(22);
        assert!(!old.wants_serializer_name());
        assert!(new.wants_serializer_name());
    }

    #[test]
    fn bind_and_unbind_database() {
        let table = SessionTable::new();
        let session = table.create(20);
        assert!(!session.is_bound());
        session.bind_database("demo");
        assert_eq!(session.bound_database().as_deref(), Some("demo"));
        session.unbind_database();
        assert!(!session.is_bound());
    }
}
