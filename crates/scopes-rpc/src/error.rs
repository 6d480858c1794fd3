//! Error types for the scopes middleware
//!
//! The taxonomy distinguishes configuration errors (fatal at startup),
//! resource errors (user code failed, the process continues), middleware
//! errors (transport/protocol failures, the caller may retry), logic errors
//! (contract violations), and registry errors (scope launch/lookup
//! failures). At the wire boundary an error is flattened into an
//! [`ExceptionInfo`] descriptor and re-materialized on the caller side.

use scopes_wire::{ExceptionInfo, ExceptionKind, WireError};
use thiserror::Error;

/// Middleware error type
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("logic error: {0}")]
    Logic(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("object not found: {0}")]
    ObjectNotExist(String),

    #[error("identity already registered: {0}")]
    DuplicateIdentity(String),

    #[error("operation does not exist: {0}")]
    OperationNotExist(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("adapter is not active")]
    AdapterStopped,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote exception ({kind:?}): {message}")]
    Remote {
        kind: ExceptionKind,
        message: String,
    },
}

impl MiddlewareError {
    /// Flatten this error into a wire exception descriptor.
    ///
    /// Transport-level errors keep their own kinds so the caller can
    /// distinguish them from application failures and decide whether a
    /// retry makes sense.
    pub fn to_exception_info(&self) -> ExceptionInfo {
        let kind = match self {
            MiddlewareError::Config(_) => ExceptionKind::Config,
            MiddlewareError::Resource(_) => ExceptionKind::Resource,
            MiddlewareError::Logic(_) | MiddlewareError::DuplicateIdentity(_) => {
                ExceptionKind::Logic
            }
            MiddlewareError::Registry(_) => ExceptionKind::Registry,
            MiddlewareError::ObjectNotExist(_) => ExceptionKind::ObjectNotExist,
            MiddlewareError::OperationNotExist(_) => ExceptionKind::OperationNotExist,
            MiddlewareError::Timeout => ExceptionKind::Timeout,
            MiddlewareError::Remote { kind, .. } => *kind,
            _ => ExceptionKind::Middleware,
        };
        ExceptionInfo::new(kind, self.to_string())
    }

    /// Re-materialize an error from a wire exception descriptor.
    pub fn from_exception_info(info: ExceptionInfo) -> Self {
        match info.kind {
            ExceptionKind::Config => MiddlewareError::Config(info.message),
            ExceptionKind::Resource => MiddlewareError::Resource(info.message),
            ExceptionKind::Logic => MiddlewareError::Logic(info.message),
            ExceptionKind::Registry => MiddlewareError::Registry(info.message),
            ExceptionKind::ObjectNotExist => MiddlewareError::ObjectNotExist(info.message),
            ExceptionKind::OperationNotExist => MiddlewareError::OperationNotExist(info.message),
            ExceptionKind::Timeout => MiddlewareError::Timeout,
            ExceptionKind::Middleware | ExceptionKind::Unknown => MiddlewareError::Remote {
                kind: info.kind,
                message: info.message,
            },
        }
    }

    /// True for transport-level failures where the caller may retry on a
    /// fresh connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MiddlewareError::Timeout
                | MiddlewareError::ConnectionRefused(_)
                | MiddlewareError::ConnectionClosed
                | MiddlewareError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MiddlewareError>;
