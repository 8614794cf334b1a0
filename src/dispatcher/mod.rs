//! Protocol dispatcher: routes a request opcode to a handler,
//! orchestrates begin/end response framing, converts handler errors to
//! wire error frames.
//!
//! One dispatcher instance is shared by every connection handler task on
//! the server, one cooperative handler per connection; the per-connection
//! state is the `Session` plus the socket itself, both of which travel
//! through `handle_connection`.

pub mod ops;

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::db::{AuthProvider, Database, Storage};
use crate::errors::{DispatchError, Error};
use crate::session::{Session, SessionTable};
use crate::stats::DispatcherStats;
use crate::wire::envelope::{
    lookup_opcode, read_request_header, write_error_response, write_ok_header, ErrorFrameEntry,
    WriteLock, OP_CONNECT, OP_DB_CLOSE, OP_SHUTDOWN,
};

/// Bounds and toggles the dispatcher enforces irrespective of any one
/// storage backend.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub min_protocol_version: i16,
    pub max_protocol_version: i16,
    pub allow_admin_repair: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            min_protocol_version: crate::session::MIN_PROTOCOL_VERSION,
            max_protocol_version: 24,
            allow_admin_repair: false,
        }
    }
}

/// Composes the façade, the session table and the dispatcher's own
/// counters. The current database is an explicit context value carried
/// per request rather than thread-local state.
pub struct Dispatcher<S: Storage, A: AuthProvider> {
    pub db: Arc<Database<S>>,
    pub auth: Arc<A>,
    pub sessions: SessionTable,
    pub stats: DispatcherStats,
    pub config: DispatcherConfig,
}

impl<S: Storage, A: AuthProvider> Dispatcher<S, A> {
    pub fn new(db: Arc<Database<S>>, auth: Arc<A>, config: DispatcherConfig) -> Self {
        Dispatcher {
            db,
            auth,
            sessions: SessionTable::new(),
            stats: DispatcherStats::default(),
            config,
        }
    }

    /// Drives one connection end to end: writes the server's protocol
    /// version as the first two bytes before any request is read, then
    /// loops reading requests until the stream closes or a transport
    /// error aborts it.
    pub async fn handle_connection<T>(&self, mut stream: T) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let write_lock = WriteLock::new();
        {
            let _guard = write_lock.acquire().await;
            crate::wire::frame::write_short(&mut stream, self.config.max_protocol_version).await?;
        }

        loop {
            match self.handle_one_request(&mut stream, &write_lock).await {
                Ok(ConnectionSignal::Continue) => continue,
                Ok(ConnectionSignal::Shutdown) => return Ok(()),
                Err(Error::Io(err)) if is_disconnect(&err) => return Ok(()),
                Err(err) => {
                    tracing::warn!(error = %err, "aborting connection after request error");
                    return Err(err);
                }
            }
        }
    }

    async fn handle_one_request<T>(
        &self,
        stream: &mut T,
        write_lock: &WriteLock,
    ) -> Result<ConnectionSignal, Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let header = read_request_header(stream).await?;
        let started = Instant::now();
        self.stats.record_request();

        let opcode_name = match lookup_opcode(header.opcode) {
            Ok(name) => name,
            Err(err) => {
                // Unknown opcode is not handled but not fatal either; at
                // the wire boundary that's a normal error frame while
                // preserving the session.
                self.stats.record_unknown_opcode();
                tracing::warn!(opcode = header.opcode, "unknown opcode");
                let _guard = write_lock.acquire().await;
                self.write_error(stream, header.session_id, Error::Dispatch(err), 0)
                    .await?;
                return Ok(ConnectionSignal::Continue);
            }
        };

        // CONNECT has no session yet by definition; DB_CLOSE/SHUTDOWN may
        // race a session that already expired client-side.
        let session_optional =
            header.opcode == OP_CONNECT || header.opcode == OP_DB_CLOSE || header.opcode == OP_SHUTDOWN;

        let session = match self.sessions.get(header.session_id) {
            Some(session) => Some(session),
            None if session_optional => None,
            None => {
                self.stats.record_unknown_session();
                tracing::warn!(session_id = header.session_id, "unknown session");
                let err = Error::Dispatch(DispatchError::UnknownSession(header.session_id));
                // Unknown session closes the connection, but a
                // best-effort error frame is still attempted.
                let _guard = write_lock.acquire().await;
                let _ = self.write_error(stream, header.session_id, err, 0).await;
                return Err(Error::Dispatch(DispatchError::UnknownSession(
                    header.session_id,
                )));
            }
        };

        let protocol_version = session
            .as_ref()
            .map(|s| s.protocol_version)
            .unwrap_or(self.config.max_protocol_version);

        tracing::debug!(
            opcode = opcode_name,
            session_id = header.session_id,
            "dispatching request"
        );

        let ctx = ops::OpContext {
            dispatcher: self,
            session: session.clone(),
            session_id: header.session_id,
            protocol_version,
        };

        let result = {
            // Handlers write their response inline, so the lock has
            // to span the call itself, not just the error path.
            let _guard = write_lock.acquire().await;
            ops::dispatch(header.opcode, &ctx, stream).await
        };

        if let Some(session) = &session {
            session.note_request(header.opcode, started);
        }
        // The database's local cache is a hint, not authoritative;
        // invalidation already happens transactionally inside `save`/
        // `delete`. Nothing further to clear here per request.

        match result {
            Ok(OpOutcome::Responded) => Ok(ConnectionSignal::Continue),
            Ok(OpOutcome::Shutdown) => Ok(ConnectionSignal::Shutdown),
            Err(err) => {
                self.stats.record_failure();
                let _guard = write_lock.acquire().await;
                self.write_error(stream, header.session_id, err, protocol_version)
                    .await?;
                Ok(ConnectionSignal::Continue)
            }
        }
    }

    async fn write_error<T>(
        &self,
        stream: &mut T,
        session_id: i32,
        err: Error,
        protocol_version: i16,
    ) -> Result<(), Error>
    where
        T: AsyncWrite + Unpin,
    {
        let entry = ErrorFrameEntry {
            class_name: err.error_class().to_string(),
            message: err.to_string(),
        };
        write_error_response(stream, session_id, &[entry], protocol_version).await
    }
}

enum ConnectionSignal {
    Continue,
    Shutdown,
}

/// Outcome of a single opcode handler: whether it already wrote a
/// complete OK response, or requested the connection be torn down.
pub(crate) enum OpOutcome {
    Responded,
    Shutdown,
}

pub(crate) async fn write_ok<T>(stream: &mut T, session_id: i32) -> Result<(), Error>
where
    T: AsyncWrite + Unpin,
{
    write_ok_header(stream, session_id).await
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AppUser, Role, ResourceRule};
    use crate::errors::FacadeError;
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

    struct MemStorage {
        next_position: AtomicI64,
        records: dashmap::DashMap<crate::db::record::Rid, crate::db::record::Record>,
    }

    impl MemStorage {
        fn new() -> Self {
            MemStorage {
                next_position: AtomicI64::new(1),
                records: dashmap::DashMap::new(),
            }
        }
    }

    impl Storage for MemStorage {
        fn read(
            &self,
            rid: crate::db::record::Rid,
            _fetch_plan: Option<&str>,
            _load_tombstone: bool,
        ) -> Result<Option<crate::db::record::Record>, Error> {
            Ok(self.records.get(&rid).map(|r| r.clone()))
        }

        fn save(
            &self,
            record: &crate::db::record::Record,
            cluster_id: i16,
            _mode: crate::db::SaveMode,
        ) -> Result<crate::db::SaveOutcome, Error> {
            use crate::db::record::{Record, RecordVersion, Rid};
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
            Ok(crate::db::SaveOutcome::Saved {
                rid,
                version,
                bytes: stored.bytes,
            })
        }

        fn delete(
            &self,
            rid: crate::db::record::Rid,
            _version: crate::db::record::RecordVersion,
            _require_exists: bool,
        ) -> Result<crate::db::DeleteOutcome, Error> {
            self.records.remove(&rid);
            Ok(crate::db::DeleteOutcome::Deleted)
        }

        fn clean_out(
            &self,
            rid: crate::db::record::Rid,
            version: crate::db::record::RecordVersion,
        ) -> Result<crate::db::DeleteOutcome, Error> {
            self.delete(rid, version, false)
        }

        fn hide(&self, rid: crate::db::record::Rid) -> Result<(), Error> {
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

    fn dispatcher() -> Dispatcher<MemStorage, AllowAllAuth> {
        let db = Arc::new(Database::new("demo", Arc::new(MemStorage::new()), 16, true));
        db.open(&AllowAllAuth, "admin", "admin", false).unwrap();
        Dispatcher::new(db, Arc::new(AllowAllAuth), DispatcherConfig::default())
    }

    #[tokio::test]
    async fn unknown_opcode_preserves_session_and_writes_error_frame() {
        let dispatcher = dispatcher();
        let session = dispatcher.sessions.create(20);

        let mut buf = Vec::new();
        crate::wire::frame::write_byte(&mut buf, 250).await.unwrap(); // not a real opcode
        crate::wire::frame::write_int(&mut buf, session.id).await.unwrap();

        let mut stream = std::io::Cursor::new(buf);
        let write_lock = WriteLock::new();
        let signal = dispatcher
            .handle_one_request(&mut stream, &write_lock)
            .await
            .unwrap();
        assert!(matches!(signal, ConnectionSignal::Continue));
        assert!(dispatcher.sessions.get(session.id).is_some());
        assert_eq!(dispatcher.stats.snapshot().unknown_opcode_total, 1);
    }

    #[tokio::test]
    async fn unknown_session_on_non_close_opcode_errors() {
        let dispatcher = dispatcher();
        let mut buf = Vec::new();
        crate::wire::frame::write_byte(&mut buf, crate::wire::envelope::OP_RECORD_LOAD)
            .await
            .unwrap();
        crate::wire::frame::write_int(&mut buf, 999).await.unwrap();
        crate::wire::frame::write_rid(&mut buf, crate::db::record::Rid::new(9, 1))
            .await
            .unwrap();
        crate::wire::frame::write_string(&mut buf, None).await.unwrap();
        crate::wire::frame::write_byte(&mut buf, 0).await.unwrap();
        crate::wire::frame::write_byte(&mut buf, 0).await.unwrap();

        let mut stream = std::io::Cursor::new(buf);
        let write_lock = WriteLock::new();
        let result = dispatcher.handle_one_request(&mut stream, &write_lock).await;
        assert!(result.is_err());
    }
}
