//! Errors.

use crate::db::record::{Rid, RecordVersion};

/// Crate-wide error type. Each variant wraps a subsystem-specific enum so that
/// call sites can match on the subsystem without losing the wire-level detail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Facade(#[from] FacadeError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Class name sent in the wire error frame's `[1][class:str][msg:str]` pair.
    pub fn error_class(&self) -> &'static str {
        match self {
            Error::Dispatch(e) => e.error_class(),
            Error::Facade(e) => e.error_class(),
            Error::Pool(_) => "PoolException",
            Error::Config(_) => "ConfigurationException",
            Error::Io(_) => "IOException",
        }
    }
}

/// Protocol-level failures: bad opcodes, bad sessions, malformed bodies.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("opcode {0} is not supported")]
    UnknownOpCode(u8),
    #[error("unknown session {0}")]
    UnknownSession(i32),
    #[error("malformed request body: {0}")]
    MalformedBody(String),
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },
}

impl DispatchError {
    fn error_class(&self) -> &'static str {
        match self {
            DispatchError::UnknownOpCode(_) => "CommandNotSupportedException",
            DispatchError::UnknownSession(_) => "TokenSecurityException",
            DispatchError::MalformedBody(_) => "NetworkException",
            DispatchError::TruncatedFrame { .. } => "IOException",
        }
    }
}

/// Database-façade failures.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("record {0} not found")]
    NotFound(Rid),
    #[error("cluster {0} not found")]
    ClusterNotFound(i16),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("concurrent modification of {rid}: expected version {expected:?}, found {actual:?}")]
    MvccConflict {
        rid: Rid,
        expected: RecordVersion,
        actual: RecordVersion,
    },
    #[error("database {0} is already open")]
    AlreadyOpen(String),
    #[error("database {0} is not open")]
    NotOpen(String),
    #[error("internal database error on {rid:?}: {message}")]
    Internal {
        rid: Option<Rid>,
        message: String,
    },
}

impl FacadeError {
    fn error_class(&self) -> &'static str {
        match self {
            FacadeError::NotFound(_) => "ORecordNotFoundException",
            FacadeError::ClusterNotFound(_) => "OStorageException",
            FacadeError::AccessDenied(_) => "OSecurityAccessException",
            FacadeError::MvccConflict { .. } => "OConcurrentModificationException",
            FacadeError::AlreadyOpen(_) | FacadeError::NotOpen(_) => "ODatabaseException",
            FacadeError::Internal { .. } => "OStorageException",
        }
    }
}

/// Client-side connection-pool failures, mirroring the split between
/// the generic engine's own error type (`pool::engine::EngineError`) and the
/// pool-wrapper-level error the rest of the crate deals with.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{0}")]
    Message(String),
    #[error("timed out waiting for a free connection")]
    Timeout,
    #[error("connection failed validation on acquire")]
    BadConnection,
    #[error("pool has been closed")]
    Closed,
    #[error(transparent)]
    Recycle(#[from] RecycleError),
}

/// Possible errors returned by a `Manager::check`/recycle step.
#[derive(Debug, thiserror::Error)]
pub enum RecycleError {
    #[error("{0}")]
    Message(String),
    #[error("backend error during recycle: {0}")]
    Backend(String),
}

pub type RecycleResult = Result<(), RecycleError>;

/// Configuration-file problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Toml(String),
    #[error("YAML parse error: {0}")]
    Yaml(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
