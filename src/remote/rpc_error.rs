use serde::Deserialize;

use crate::error::{SyncError, SyncErrorCode};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<StatusPayload>,
}

/// Status object carried by stream close frames and target-change causes.
#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl StatusPayload {
    pub fn into_error(self) -> SyncError {
        let message = self
            .message
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| "stream error".to_string());
        match (self.status.as_deref(), self.code) {
            (Some(status), _) => map_status(status, &message),
            (None, Some(code)) => SyncError::new(SyncErrorCode::from_rpc_code(code), message),
            (None, None) => SyncError::new(SyncErrorCode::Unknown, message),
        }
    }
}

/// Maps a textual RPC status (`"UNAVAILABLE"`, `"PERMISSION_DENIED"`, ...) onto an error.
pub fn map_status(status: &str, message: &str) -> SyncError {
    let code = match status {
        "CANCELLED" => SyncErrorCode::Cancelled,
        "UNKNOWN" => SyncErrorCode::Unknown,
        "INVALID_ARGUMENT" => SyncErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => SyncErrorCode::DeadlineExceeded,
        "NOT_FOUND" => SyncErrorCode::NotFound,
        "ALREADY_EXISTS" => SyncErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => SyncErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => SyncErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => SyncErrorCode::FailedPrecondition,
        "ABORTED" => SyncErrorCode::Aborted,
        "OUT_OF_RANGE" => SyncErrorCode::OutOfRange,
        "UNIMPLEMENTED" => SyncErrorCode::Unimplemented,
        "INTERNAL" => SyncErrorCode::Internal,
        "UNAVAILABLE" => SyncErrorCode::Unavailable,
        "DATA_LOSS" => SyncErrorCode::DataLoss,
        "UNAUTHENTICATED" => SyncErrorCode::Unauthenticated,
        other => {
            return SyncError::new(
                SyncErrorCode::Unknown,
                format!("Unhandled status {other}: {message}"),
            )
        }
    };
    SyncError::new(code, message.to_string())
}

/// Decodes an `{"error": {...}}` frame, falling back to `Unknown` with the raw text.
pub fn map_error_frame(body: &str) -> SyncError {
    match serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
    {
        Some(payload) => payload.into_error(),
        None => SyncError::new(SyncErrorCode::Unknown, body.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_textual_statuses() {
        assert_eq!(map_status("UNAVAILABLE", "down").code, SyncErrorCode::Unavailable);
        assert_eq!(map_status("ABORTED", "retry").code, SyncErrorCode::Aborted);
        let unknown = map_status("TEAPOT", "brew");
        assert_eq!(unknown.code, SyncErrorCode::Unknown);
        assert!(unknown.message().contains("TEAPOT"));
    }

    #[test]
    fn decodes_error_frames() {
        let err = map_error_frame(r#"{"error":{"code":7,"message":"nope"}}"#);
        assert_eq!(err.code, SyncErrorCode::PermissionDenied);
        assert_eq!(err.message(), "nope");

        let err = map_error_frame(r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#);
        assert_eq!(err.code, SyncErrorCode::ResourceExhausted);

        assert_eq!(map_error_frame("garbage").code, SyncErrorCode::Unknown);
    }
}
