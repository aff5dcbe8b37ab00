//! Error types for convo-sync wire handling.

use thiserror::Error;

/// Errors raised while turning server payloads into typed values.
#[derive(Debug, Error)]
pub enum SyncError {
    /// JSON payload did not match the expected shape
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Hub event name is not one the engine understands
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// A required field was absent under every known alias
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Message failed validation (no sender, no content, bad timestamp)
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::UnknownEvent("GroupAvatarUpdated".into());
        assert_eq!(err.to_string(), "unknown event: GroupAvatarUpdated");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
