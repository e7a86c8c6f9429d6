//! Portable error taxonomy for failures observed on a worker connection.
//!
//! Vendor error codes are translated exactly once, in
//! [`classify_vendor_code`]; the code itself is kept on the error for logs.

use thiserror::Error;

pub const ER_DUP_KEYNAME: u16 = 1061;
pub const ER_CON_COUNT_ERROR: u16 = 1040;
pub const ER_BAD_DB_ERROR: u16 = 1049;
pub const ER_TABLE_EXISTS_ERROR: u16 = 1050;
pub const ER_NO_SUCH_TABLE: u16 = 1146;
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
pub const ER_LOCK_DEADLOCK: u16 = 1213;
pub const CR_SERVER_GONE_ERROR: u16 = 2006;
pub const CR_SERVER_LOST: u16 = 2013;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The target object is not (yet) visible on this connection. Worth
    /// retrying with a reconnect: the usual cause is DDL committed on another
    /// session that this session's metadata view has not observed.
    ObjectMissing,
    /// Connection-level failure; the statement may succeed after reconnect.
    TransientConnection,
    /// Syntax, constraint, or any other non-recoverable failure.
    Fatal,
    /// A code the operator listed in the ignore set.
    IgnorableByConfig,
    /// A retryable failure that exhausted its retry budget.
    RetryExhausted,
}

/// The single vendor-code classification point.
pub fn classify_vendor_code(code: u16) -> ErrorKind {
    match code {
        ER_NO_SUCH_TABLE | ER_BAD_DB_ERROR => ErrorKind::ObjectMissing,
        ER_CON_COUNT_ERROR
        | ER_LOCK_WAIT_TIMEOUT
        | ER_LOCK_DEADLOCK
        | CR_SERVER_GONE_ERROR
        | CR_SERVER_LOST => ErrorKind::TransientConnection,
        _ => ErrorKind::Fatal,
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} error{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct ClientError {
    pub kind: ErrorKind,
    pub code: Option<u16>,
    pub message: String,
}

impl ClientError {
    pub fn server(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: classify_vendor_code(code),
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransientConnection,
            code: None,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            code: None,
            message: message.into(),
        }
    }

    pub fn retry_exhausted(self) -> Self {
        Self {
            kind: ErrorKind::RetryExhausted,
            ..self
        }
    }

    pub fn is_object_missing(&self) -> bool {
        self.kind == ErrorKind::ObjectMissing
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::TransientConnection
    }
}
