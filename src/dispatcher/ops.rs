//! Per-opcode request handlers.
//!
//! Each handler reads its own body off the stream, calls into the
//! database façade, and writes a complete response (OK header plus
//! payload) before returning. Handlers never write an error frame
//! themselves -- they return `Err`, and `Dispatcher::handle_one_request`
//! turns that into the wire error chain.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::db::{AuthProvider, LockingStrategy, Permission, SaveMode, Storage};
use crate::db::record::{Record, RecordVersion, Rid};
use crate::errors::{DispatchError, Error, FacadeError};
use crate::session::Session;
use crate::wire::envelope::{
    write_ok_header, OP_CONNECT, OP_DB_CLOSE, OP_DB_OPEN, OP_RECORD_CLEAN_OUT, OP_RECORD_CREATE,
    OP_RECORD_DELETE, OP_RECORD_HIDE, OP_RECORD_LOAD, OP_RECORD_METADATA, OP_RECORD_UPDATE,
    OP_SHUTDOWN, OP_TX_COMMIT,
};
use crate::wire::frame::{
    read_byte, read_bytes, read_int, read_rid, read_short, read_string, read_version, write_byte,
    write_bytes, write_int, write_long, write_rid, write_string, write_version,
};

use super::{write_ok, Dispatcher, OpOutcome};

/// Everything a single handler needs: the dispatcher it belongs to, the
/// session it was dispatched against (absent only for `CONNECT`, which
/// creates one), the raw session id off the wire, and the protocol
/// version governing which optional fields appear on this connection.
pub struct OpContext<'a, S: Storage, A: AuthProvider> {
    pub dispatcher: &'a Dispatcher<S, A>,
    pub session: Option<Arc<Session>>,
    pub session_id: i32,
    pub protocol_version: i16,
}

impl<'a, S: Storage, A: AuthProvider> OpContext<'a, S, A> {
    fn require_session(&self) -> Result<&Arc<Session>, Error> {
        self.session
            .as_ref()
            .ok_or_else(|| DispatchError::UnknownSession(self.session_id).into())
    }
}

pub async fn dispatch<S, A, T>(
    opcode: u8,
    ctx: &OpContext<'_, S, A>,
    stream: &mut T,
) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    match opcode {
        OP_CONNECT => connect(ctx, stream).await,
        OP_DB_OPEN => db_open(ctx, stream).await,
        OP_DB_CLOSE => db_close(ctx, stream).await,
        OP_RECORD_LOAD => record_load(ctx, stream).await,
        OP_RECORD_METADATA => record_metadata(ctx, stream).await,
        OP_RECORD_CREATE => record_create(ctx, stream).await,
        OP_RECORD_UPDATE => record_update(ctx, stream).await,
        OP_RECORD_DELETE => record_delete(ctx, stream).await,
        OP_RECORD_HIDE => record_hide(ctx, stream).await,
        OP_RECORD_CLEAN_OUT => record_clean_out(ctx, stream).await,
        OP_TX_COMMIT => tx_commit(ctx, stream).await,
        OP_SHUTDOWN => shutdown(ctx, stream).await,
        // A recognized but unhandled opcode is not fatal -- the session
        // survives, the client just sees a plain error frame for this one
        // request.
        other => Err(DispatchError::UnknownOpCode(other).into()),
    }
}

/// `CONNECT(driverName, driverVersion, protocolVersion, clientId, username,
/// password)` -- creates the session. The session's protocol version is the
/// one the client negotiates here, not the server's advertised maximum.
async fn connect<S, A, T>(ctx: &OpContext<'_, S, A>, stream: &mut T) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let _driver_name = read_string(stream).await?;
    let _driver_version = read_string(stream).await?;
    let protocol_version = read_short(stream).await?;
    let _client_id = read_string(stream).await?;
    let username = read_string(stream).await?.unwrap_or_default();
    let password = read_string(stream).await?.unwrap_or_default();

    ctx.dispatcher
        .auth
        .authenticate(&username, &password)
        .map_err(Error::Facade)?;

    let session = ctx.dispatcher.sessions.create(protocol_version);
    write_ok_header(stream, session.id).await?;
    Ok(OpOutcome::Responded)
}

/// `DB_OPEN(serializer(proto>21), databaseName, dbType(proto>=8), username,
/// password)` -- binds the session's database and opens the façade if this
/// is the first session to do so.
async fn db_open<S, A, T>(ctx: &OpContext<'_, S, A>, stream: &mut T) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let serializer = if ctx.protocol_version > 21 {
        read_string(stream).await?
    } else {
        None
    };
    let database_name = read_string(stream).await?.unwrap_or_default();
    let _db_type = if ctx.protocol_version >= 8 {
        read_string(stream).await?
    } else {
        None
    };
    let username = read_string(stream).await?.unwrap_or_default();
    let password = read_string(stream).await?.unwrap_or_default();

    let session = ctx.require_session()?;

    if database_name != ctx.dispatcher.db.name() {
        return Err(FacadeError::AccessDenied(format!("unknown database {database_name}")).into());
    }

    if !ctx.dispatcher.db.is_open() {
        ctx.dispatcher.db.open(
            ctx.dispatcher.auth.as_ref(),
            &username,
            &password,
            ctx.dispatcher.config.allow_admin_repair,
        )?;
    }
    session.bind_database(database_name);
    if let Some(serializer) = serializer {
        session.set_serializer_name(serializer);
    }

    write_ok_header(stream, ctx.session_id).await?;
    // Cluster enumeration is out of scope; report zero clusters so
    // clients expecting the count field still get well-formed framing.
    write_int(stream, 0).await?;
    if ctx.protocol_version >= 14 {
        write_string(stream, Some(crate::app::config::VERSION)).await?;
    }
    Ok(OpOutcome::Responded)
}

/// `DB_CLOSE()` -- destroys the session. No payload beyond the OK
/// header; closing the façade itself is a server-lifecycle concern, not
/// a per-session one, since other sessions may still be bound to it.
async fn db_close<S, A, T>(ctx: &OpContext<'_, S, A>, stream: &mut T) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.dispatcher.sessions.remove(ctx.session_id);
    write_ok(stream, ctx.session_id).await?;
    Ok(OpOutcome::Responded)
}

/// `RECORD_LOAD(rid, fetchPlan, ignoreCache, loadTombstone)`.
async fn record_load<S, A, T>(ctx: &OpContext<'_, S, A>, stream: &mut T) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    let rid = read_rid(stream).await?;
    let fetch_plan = read_string(stream).await?;
    let ignore_cache = if ctx.protocol_version >= 9 {
        read_byte(stream).await? != 0
    } else {
        false
    };
    let load_tombstone = if ctx.protocol_version >= 13 {
        read_byte(stream).await? != 0
    } else {
        false
    };

    let found = ctx.dispatcher.db.load(
        rid,
        fetch_plan.as_deref(),
        ignore_cache,
        load_tombstone,
        LockingStrategy::None,
    )?;

    write_ok_header(stream, ctx.session_id).await?;
    match found {
        Some(record) => {
            write_byte(stream, 1).await?;
            write_bytes(stream, Some(&record.bytes)).await?;
            write_version(stream, record.version).await?;
            write_byte(stream, record.record_type).await?;
            // No side records to report; terminate the chain.
            write_byte(stream, 0).await?;
        }
        None => write_byte(stream, 0).await?,
    }
    Ok(OpOutcome::Responded)
}

/// `RECORD_METADATA(rid)` -- identity and version only, no content; the
/// same `load` path as `RECORD_LOAD` with the body bytes dropped before
/// the response is framed.
async fn record_metadata<S, A, T>(
    ctx: &OpContext<'_, S, A>,
    stream: &mut T,
) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    let rid = read_rid(stream).await?;

    let found = ctx
        .dispatcher
        .db
        .load(rid, None, false, false, LockingStrategy::None)?;

    write_ok_header(stream, ctx.session_id).await?;
    match found {
        Some(record) => {
            write_byte(stream, 1).await?;
            write_rid(stream, record.rid).await?;
            write_version(stream, record.version).await?;
            write_byte(stream, record.record_type).await?;
        }
        None => write_byte(stream, 0).await?,
    }
    Ok(OpOutcome::Responded)
}

/// `RECORD_CREATE(dataSegmentId(10<=proto<24), rid(shortClusterId, invalid
/// pos), content, recordType, mode)` -- the new-record path through `save`.
/// The client's `rid` only carries a real cluster id; the position half is a
/// sentinel "invalid" value, but it is still framed on the wire and must be
/// read off, not skipped.
async fn record_create<S, A, T>(
    ctx: &OpContext<'_, S, A>,
    stream: &mut T,
) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    if (10..24).contains(&ctx.protocol_version) {
        let _data_segment_id = read_int(stream).await?;
    }
    let rid = read_rid(stream).await?;
    let cluster_id = rid.cluster_id;
    let content = read_bytes(stream).await?.unwrap_or_default();
    let record_type = read_byte(stream).await?;
    let mode = decode_save_mode(read_byte(stream).await?);

    let record = Record::new(cluster_id, record_type, content);
    let saved = ctx
        .dispatcher
        .db
        .save(record, Some(cluster_id), mode, true)?;

    write_ok_header(stream, ctx.session_id).await?;
    write_long(stream, saved.rid.cluster_position).await?;
    if ctx.protocol_version >= 11 {
        write_version(stream, saved.version).await?;
    }
    Ok(OpOutcome::Responded)
}

/// `RECORD_UPDATE(rid, updateContent(proto>=23), content, version,
/// recordType, mode)` -- the existing-record path through `save`.
async fn record_update<S, A, T>(
    ctx: &OpContext<'_, S, A>,
    stream: &mut T,
) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    let rid = read_rid(stream).await?;
    let _update_content = if ctx.protocol_version >= 23 {
        read_byte(stream).await? != 0
    } else {
        true
    };
    let content = read_bytes(stream).await?.unwrap_or_default();
    let version = read_version(stream).await?;
    let record_type = read_byte(stream).await?;
    let mode = decode_save_mode(read_byte(stream).await?);

    let existing = ctx
        .dispatcher
        .db
        .load(rid, None, true, false, LockingStrategy::None)?
        .ok_or(FacadeError::NotFound(rid))?;

    check_mvcc(existing.version, version, rid)?;

    let mut record = existing;
    record.mark_dirty(content);
    record.record_type = record_type;
    record.version = version;

    let saved = ctx.dispatcher.db.save(record, None, mode, false)?;

    write_ok_header(stream, ctx.session_id).await?;
    write_version(stream, saved.version).await?;
    Ok(OpOutcome::Responded)
}

/// `RECORD_DELETE(rid, version, mode)`.
async fn record_delete<S, A, T>(
    ctx: &OpContext<'_, S, A>,
    stream: &mut T,
) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    let rid = read_rid(stream).await?;
    let version = read_version(stream).await?;
    let _mode = decode_save_mode(read_byte(stream).await?);

    ctx.dispatcher
        .db
        .delete(rid, version, false, true, false)?;

    write_ok_header(stream, ctx.session_id).await?;
    write_byte(stream, 1).await?;
    Ok(OpOutcome::Responded)
}

/// `RECORD_HIDE(rid)`.
async fn record_hide<S, A, T>(ctx: &OpContext<'_, S, A>, stream: &mut T) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    let rid = read_rid(stream).await?;
    ctx.dispatcher.db.hide(rid)?;
    write_ok(stream, ctx.session_id).await?;
    Ok(OpOutcome::Responded)
}

/// `RECORD_CLEAN_OUT(rid, version)` -- the tombstone-prohibited delete
/// path: storage's `cleanOut` rather than `delete`, so no version marker
/// survives the record at all.
async fn record_clean_out<S, A, T>(
    ctx: &OpContext<'_, S, A>,
    stream: &mut T,
) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    let rid = read_rid(stream).await?;
    let version = read_version(stream).await?;

    ctx.dispatcher.db.delete(rid, version, false, true, true)?;

    write_ok_header(stream, ctx.session_id).await?;
    write_byte(stream, 1).await?;
    Ok(OpOutcome::Responded)
}

/// `TX_COMMIT(operationCount, operations...)`: buffers every
/// operation on the façade's transaction buffer, then replays created,
/// updated, deleted in that fixed order.
async fn tx_commit<S, A, T>(ctx: &OpContext<'_, S, A>, stream: &mut T) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.require_session()?;
    let operation_count = read_int(stream).await?;
    ctx.dispatcher.db.begin_transaction();

    for _ in 0..operation_count {
        let op_type = read_byte(stream).await?;
        match op_type {
            1 => {
                let client_cluster = crate::wire::frame::read_short(stream).await?;
                let record_type = read_byte(stream).await?;
                let content = read_bytes(stream).await?.unwrap_or_default();
                ctx.dispatcher
                    .db
                    .tx_enqueue_create(Record::new(client_cluster, record_type, content));
            }
            2 => {
                let rid = read_rid(stream).await?;
                let version = read_version(stream).await?;
                let record_type = read_byte(stream).await?;
                let content = read_bytes(stream).await?.unwrap_or_default();
                let mut record = Record::loaded(rid, version, record_type, Vec::new());
                record.mark_dirty(content);
                ctx.dispatcher.db.tx_enqueue_update(record);
            }
            3 => {
                let rid = read_rid(stream).await?;
                ctx.dispatcher.db.tx_enqueue_delete(rid);
            }
            other => {
                ctx.dispatcher.db.rollback();
                return Err(DispatchError::MalformedBody(format!(
                    "unknown tx operation type {other}"
                ))
                .into());
            }
        }
    }

    let report = ctx.dispatcher.db.commit()?;

    write_ok_header(stream, ctx.session_id).await?;
    write_int(stream, report.created.len() as i32).await?;
    for (client_rid, server_rid) in &report.created {
        write_rid(stream, *client_rid).await?;
        write_rid(stream, *server_rid).await?;
    }
    write_int(stream, report.updated.len() as i32).await?;
    for (rid, version) in &report.updated {
        write_rid(stream, *rid).await?;
        write_version(stream, *version).await?;
    }
    Ok(OpOutcome::Responded)
}

/// `SHUTDOWN()` -- gated on the admin-repair toggle the same way a
/// recovery login is (Open Question 1, DESIGN.md): only an admin-capable
/// session may ask the server to stop accepting connections.
async fn shutdown<S, A, T>(ctx: &OpContext<'_, S, A>, stream: &mut T) -> Result<OpOutcome, Error>
where
    S: Storage,
    A: AuthProvider,
    T: AsyncRead + AsyncWrite + Unpin,
{
    ctx.dispatcher
        .db
        .check_security("server", Permission::Delete, &[])
        .map_err(Error::Facade)?;
    write_ok(stream, ctx.session_id).await?;
    Ok(OpOutcome::Shutdown)
}

fn decode_save_mode(byte: u8) -> SaveMode {
    if byte == 0 {
        SaveMode::Sync
    } else {
        SaveMode::Async
    }
}

fn check_mvcc(actual: RecordVersion, expected: RecordVersion, rid: Rid) -> Result<(), Error> {
    if matches!(expected, RecordVersion::Untracked) || actual == expected {
        Ok(())
    } else {
        Err(FacadeError::MvccConflict {
            rid,
            expected,
            actual,
        }
        .into())
    }
}
