use std::error::Error;
use std::fmt::{Display, Formatter};

/// Canonical status codes shared by the local store, the streams and the public API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::Cancelled => "sync/cancelled",
            SyncErrorCode::Unknown => "sync/unknown",
            SyncErrorCode::InvalidArgument => "sync/invalid-argument",
            SyncErrorCode::DeadlineExceeded => "sync/deadline-exceeded",
            SyncErrorCode::NotFound => "sync/not-found",
            SyncErrorCode::AlreadyExists => "sync/already-exists",
            SyncErrorCode::PermissionDenied => "sync/permission-denied",
            SyncErrorCode::ResourceExhausted => "sync/resource-exhausted",
            SyncErrorCode::FailedPrecondition => "sync/failed-precondition",
            SyncErrorCode::Aborted => "sync/aborted",
            SyncErrorCode::OutOfRange => "sync/out-of-range",
            SyncErrorCode::Unimplemented => "sync/unimplemented",
            SyncErrorCode::Internal => "sync/internal",
            SyncErrorCode::Unavailable => "sync/unavailable",
            SyncErrorCode::DataLoss => "sync/data-loss",
            SyncErrorCode::Unauthenticated => "sync/unauthenticated",
        }
    }

    /// Maps a numeric RPC status code onto a [`SyncErrorCode`].
    pub fn from_rpc_code(code: i32) -> Self {
        match code {
            1 => SyncErrorCode::Cancelled,
            3 => SyncErrorCode::InvalidArgument,
            4 => SyncErrorCode::DeadlineExceeded,
            5 => SyncErrorCode::NotFound,
            6 => SyncErrorCode::AlreadyExists,
            7 => SyncErrorCode::PermissionDenied,
            8 => SyncErrorCode::ResourceExhausted,
            9 => SyncErrorCode::FailedPrecondition,
            10 => SyncErrorCode::Aborted,
            11 => SyncErrorCode::OutOfRange,
            12 => SyncErrorCode::Unimplemented,
            13 => SyncErrorCode::Internal,
            14 => SyncErrorCode::Unavailable,
            15 => SyncErrorCode::DataLoss,
            16 => SyncErrorCode::Unauthenticated,
            _ => SyncErrorCode::Unknown,
        }
    }

    pub fn rpc_code(&self) -> i32 {
        match self {
            SyncErrorCode::Cancelled => 1,
            SyncErrorCode::Unknown => 2,
            SyncErrorCode::InvalidArgument => 3,
            SyncErrorCode::DeadlineExceeded => 4,
            SyncErrorCode::NotFound => 5,
            SyncErrorCode::AlreadyExists => 6,
            SyncErrorCode::PermissionDenied => 7,
            SyncErrorCode::ResourceExhausted => 8,
            SyncErrorCode::FailedPrecondition => 9,
            SyncErrorCode::Aborted => 10,
            SyncErrorCode::OutOfRange => 11,
            SyncErrorCode::Unimplemented => 12,
            SyncErrorCode::Internal => 13,
            SyncErrorCode::Unavailable => 14,
            SyncErrorCode::DataLoss => 15,
            SyncErrorCode::Unauthenticated => 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncError {
    pub code: SyncErrorCode,
    message: String,
}

impl SyncError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::ResourceExhausted, message)
}

pub fn data_loss(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DataLoss, message)
}

/// Whether a stream failure with this code should stop retries of the affected request.
///
/// Anything that can succeed on a later attempt (timeouts, throttling, transient
/// unavailability, expired credentials) is not permanent.
pub fn is_permanent_error(code: SyncErrorCode) -> bool {
    match code {
        SyncErrorCode::Unknown
        | SyncErrorCode::DeadlineExceeded
        | SyncErrorCode::ResourceExhausted
        | SyncErrorCode::Internal
        | SyncErrorCode::Unavailable
        | SyncErrorCode::Unauthenticated => false,
        SyncErrorCode::Cancelled
        | SyncErrorCode::InvalidArgument
        | SyncErrorCode::NotFound
        | SyncErrorCode::AlreadyExists
        | SyncErrorCode::PermissionDenied
        | SyncErrorCode::FailedPrecondition
        | SyncErrorCode::Aborted
        | SyncErrorCode::OutOfRange
        | SyncErrorCode::Unimplemented
        | SyncErrorCode::DataLoss => true,
    }
}

/// Write failures are permanent unless the server aborted the commit, which is retried.
pub fn is_permanent_write_error(code: SyncErrorCode) -> bool {
    is_permanent_error(code) && code != SyncErrorCode::Aborted
}

/// Failures worth retrying in place: the same request may succeed moments later.
pub fn is_transient(code: SyncErrorCode) -> bool {
    matches!(
        code,
        SyncErrorCode::Unavailable
            | SyncErrorCode::DeadlineExceeded
            | SyncErrorCode::ResourceExhausted
            | SyncErrorCode::Aborted
            | SyncErrorCode::Internal
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_code_and_message() {
        let err = invalid_argument("bad path");
        assert_eq!(err.code_str(), "sync/invalid-argument");
        assert_eq!(err.to_string(), "bad path (sync/invalid-argument)");
    }

    #[test]
    fn classifies_permanent_errors() {
        assert!(!is_permanent_error(SyncErrorCode::Unavailable));
        assert!(!is_permanent_error(SyncErrorCode::Unauthenticated));
        assert!(is_permanent_error(SyncErrorCode::PermissionDenied));
        assert!(is_permanent_error(SyncErrorCode::Aborted));
        assert!(!is_permanent_write_error(SyncErrorCode::Aborted));
        assert!(is_permanent_write_error(SyncErrorCode::FailedPrecondition));
        assert!(is_transient(SyncErrorCode::Aborted));
        assert!(!is_transient(SyncErrorCode::PermissionDenied));
    }

    #[test]
    fn rpc_codes_roundtrip_for_known_values() {
        assert_eq!(SyncErrorCode::from_rpc_code(7), SyncErrorCode::PermissionDenied);
        assert_eq!(SyncErrorCode::from_rpc_code(99), SyncErrorCode::Unknown);
        assert_eq!(SyncErrorCode::Unavailable.rpc_code(), 14);
    }
}
