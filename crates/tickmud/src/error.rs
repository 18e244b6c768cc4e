use mudwire::ConnId;
use thiserror::Error;

use crate::attr::AttrType;
use crate::entity::EntityId;
use crate::session::SessionState;

/// An attribute value or kind does not match what was registered for it.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown entity kind {0:?}")]
    UnknownKind(String),
    #[error("kind {0:?} registered twice")]
    DuplicateKind(String),
    #[error("{kind} has no attribute {attr:?}")]
    UnknownAttr { kind: String, attr: String },
    #[error("{attr}: expected {expected}, got {got}")]
    WrongType {
        attr: String,
        expected: AttrType,
        got: AttrType,
    },
    #[error("{attr}: {reason}")]
    Rejected { attr: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error("record version {0} is not supported")]
    UnsupportedVersion(u64),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("bad storage key {0:?}")]
    BadKey(String),
    #[error("backend io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("no session for connection {0}")]
    UnknownConn(ConnId),
    #[error("no shell named {0:?}")]
    UnknownShell(String),
    #[error("account {0} is already playing")]
    AccountInUse(EntityId),
    #[error("session {conn}: cannot go from {from:?} to {to:?}")]
    IllegalTransition {
        conn: ConnId,
        from: SessionState,
        to: SessionState,
    },
}

/// Transport trouble between the core and its gateway.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("gateway sent a bad frame: {0}")]
    Protocol(#[from] mudwire::ProtoError),
    #[error("gateway link: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("fabric closed")]
    Closed,
    #[error("fabric queue full")]
    Full,
    #[error("fabric io: {0}")]
    Io(#[from] std::io::Error),
    #[error("fabric payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("fabric frame: {0}")]
    Protocol(#[from] mudwire::ProtoError),
}

/// Why a command did not complete.
///
/// `Usage` text goes back to the player as-is. `Failed` is logged in full and
/// the player only sees a generic failure line.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl CommandError {
    pub fn usage(text: impl Into<String>) -> Self {
        Self::Usage(text.into())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for CommandError {
    fn from(e: Error) -> Self {
        Self::Failed(e.into())
    }
}

impl From<ValidationError> for CommandError {
    fn from(e: ValidationError) -> Self {
        Self::Failed(e.into())
    }
}

impl From<StorageError> for CommandError {
    fn from(e: StorageError) -> Self {
        Self::Failed(e.into())
    }
}

impl From<SessionError> for CommandError {
    fn from(e: SessionError) -> Self {
        Self::Failed(e.into())
    }
}
