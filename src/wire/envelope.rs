//! Request/response envelopes, the channel write lock, and the opcode table
//!.

use iota::iota;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard};

use crate::errors::{DispatchError, Error};
use crate::wire::frame::{read_byte, read_int, write_byte, write_int, write_string};

iota! {
    pub const OP_CONNECT: u8 = 1 + iota;
        , OP_DB_OPEN
        , OP_DB_CREATE
        , OP_DB_CLOSE
        , OP_DB_DROP
        , OP_DB_EXIST
        , OP_DB_SIZE
        , OP_DB_COUNTRECORDS
        , OP_DB_RELOAD
        , OP_DATACLUSTER_ADD
        , OP_DATACLUSTER_DROP
        , OP_DATACLUSTER_COUNT
        , OP_DATACLUSTER_DATARANGE
        , OP_DATACLUSTER_FREEZE
        , OP_DATACLUSTER_RELEASE
        , OP_RECORD_LOAD
        , OP_RECORD_METADATA
        , OP_RECORD_CREATE
        , OP_RECORD_UPDATE
        , OP_RECORD_DELETE
        , OP_RECORD_HIDE
        , OP_RECORD_CLEAN_OUT
        , OP_POSITIONS_HIGHER
        , OP_POSITIONS_CEILING
        , OP_POSITIONS_LOWER
        , OP_POSITIONS_FLOOR
        , OP_COMMAND
        , OP_TX_COMMIT
        , OP_CONFIG_GET
        , OP_CONFIG_SET
        , OP_CONFIG_LIST
        , OP_DB_FREEZE
        , OP_DB_RELEASE
        , OP_REPLICATION
        , OP_CLUSTER
        , OP_SHUTDOWN
        , OP_SBTREE_BONSAI_CREATE
        , OP_SBTREE_BONSAI_GET
        , OP_SBTREE_BONSAI_FIRST_KEY
        , OP_SBTREE_BONSAI_GET_ENTRIES_MAJOR
        , OP_RIDBAG_GET_SIZE
}

/// Resolve a raw opcode byte to its stable name, used for dispatch-table
/// lookups and error messages. Unknown opcodes are the caller's problem
///.
pub fn opcode_name(op: u8) -> Option<&'static str> {
    Some(match op {
        OP_CONNECT => "CONNECT",
        OP_DB_OPEN => "DB_OPEN",
        OP_DB_CREATE => "DB_CREATE",
        OP_DB_CLOSE => "DB_CLOSE",
        OP_DB_DROP => "DB_DROP",
        OP_DB_EXIST => "DB_EXIST",
        OP_DB_SIZE => "DB_SIZE",
        OP_DB_COUNTRECORDS => "DB_COUNTRECORDS",
        OP_DB_RELOAD => "DB_RELOAD",
        OP_DATACLUSTER_ADD => "DATACLUSTER_ADD",
        OP_DATACLUSTER_DROP => "DATACLUSTER_DROP",
        OP_DATACLUSTER_COUNT => "DATACLUSTER_COUNT",
        OP_DATACLUSTER_DATARANGE => "DATACLUSTER_DATARANGE",
        OP_DATACLUSTER_FREEZE => "DATACLUSTER_FREEZE",
        OP_DATACLUSTER_RELEASE => "DATACLUSTER_RELEASE",
        OP_RECORD_LOAD => "RECORD_LOAD",
        OP_RECORD_METADATA => "RECORD_METADATA",
        OP_RECORD_CREATE => "RECORD_CREATE",
        OP_RECORD_UPDATE => "RECORD_UPDATE",
        OP_RECORD_DELETE => "RECORD_DELETE",
        OP_RECORD_HIDE => "RECORD_HIDE",
        OP_RECORD_CLEAN_OUT => "RECORD_CLEAN_OUT",
        OP_POSITIONS_HIGHER => "POSITIONS_HIGHER",
        OP_POSITIONS_CEILING => "POSITIONS_CEILING",
        OP_POSITIONS_LOWER => "POSITIONS_LOWER",
        OP_POSITIONS_FLOOR => "POSITIONS_FLOOR",
        OP_COMMAND => "COMMAND",
        OP_TX_COMMIT => "TX_COMMIT",
        OP_CONFIG_GET => "CONFIG_GET",
        OP_CONFIG_SET => "CONFIG_SET",
        OP_CONFIG_LIST => "CONFIG_LIST",
        OP_DB_FREEZE => "DB_FREEZE",
        OP_DB_RELEASE => "DB_RELEASE",
        OP_REPLICATION => "REPLICATION",
        OP_CLUSTER => "CLUSTER",
        OP_SHUTDOWN => "SHUTDOWN",
        OP_SBTREE_BONSAI_CREATE => "SBTREE_BONSAI_CREATE",
        OP_SBTREE_BONSAI_GET => "SBTREE_BONSAI_GET",
        OP_SBTREE_BONSAI_FIRST_KEY => "SBTREE_BONSAI_FIRST_KEY",
        OP_SBTREE_BONSAI_GET_ENTRIES_MAJOR => "SBTREE_BONSAI_GET_ENTRIES_MAJOR",
        OP_RIDBAG_GET_SIZE => "RIDBAG_GET_SIZE",
        _ => return None,
    })
}

/// `[opcode: u8][sessionId: i32][body…]`.
pub struct RequestHeader {
    pub opcode: u8,
    pub session_id: i32,
}

pub async fn read_request_header<S>(stream: &mut S) -> Result<RequestHeader, Error>
where
    S: AsyncRead + Unpin,
{
    let opcode = read_byte(stream).await?;
    let session_id = read_int(stream).await?;
    Ok(RequestHeader { opcode, session_id })
}

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

/// One link of the error chain terminator protocol: `[1][class][message]`
/// pairs followed by a final `[0]`.
pub struct ErrorFrameEntry {
    pub class_name: String,
    pub message: String,
}

/// Writes `[status=ERROR][sessionId][chain...][0]`, then the exception blob
/// placeholder when `protocol_version >= 19`. The blob itself belongs
/// to the (out of scope) serializer; an empty marker preserves the framing.
pub async fn write_error_response<S>(
    stream: &mut S,
    session_id: i32,
    chain: &[ErrorFrameEntry],
    protocol_version: i16,
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    write_byte(stream, STATUS_ERROR).await?;
    write_int(stream, session_id).await?;
    for entry in chain {
        write_byte(stream, 1).await?;
        write_string(stream, Some(&entry.class_name)).await?;
        write_string(stream, Some(&entry.message)).await?;
    }
    write_byte(stream, 0).await?;
    if protocol_version >= 19 {
        // No serialized exception payload beyond the chain above; write a
        // null blob so protocol>=19 readers see a well-formed (absent) one.
        crate::wire::frame::write_bytes(stream, None).await?;
    }
    Ok(())
}

pub async fn write_ok_header<S>(stream: &mut S, session_id: i32) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    write_byte(stream, STATUS_OK).await?;
    write_int(stream, session_id).await?;
    Ok(())
}

impl Error {
    /// Flattens a crate error into the wire's (class name, message) pair,
    /// the leaf of the error chain written by `write_error_response`.
    pub fn to_error_frame_entry(&self) -> ErrorFrameEntry {
        ErrorFrameEntry {
            class_name: self.error_class().to_string(),
            message: self.to_string(),
        }
    }
}

/// Exactly one writer per channel at a time. Acquired before
/// composing a response, released once the response is flushed; modelled
/// as an async mutex rather than a blocking one since the lock is held
/// across `.await` points while writing.
pub struct WriteLock {
    inner: Mutex<()>,
}

impl Default for WriteLock {
    fn default() -> Self {
        WriteLock { inner: Mutex::new(()) }
    }
}

impl WriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

/// Translate an unknown opcode into the "not handled" signal:
/// callers check `.is_none()` and must not treat it as a hard failure by
/// itself -- only an unknown *session* on a non-CLOSE/SHUTDOWN opcode is.
pub fn lookup_opcode(op: u8) -> Result<&'static str, DispatchError> {
    opcode_name(op).ok_or(DispatchError::UnknownOpCode(op))
}
