//! Error types for storage operations.

use crate::backend::BackendType;
use crate::host::HostError;

/// Errors from facade, registry, and adapter operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeeperError {
    /// Bad backend tag, reconfiguration attempt, or unrecognized option.
    #[error("[kv-keeper] {0}")]
    Validation(String),

    /// The host exposes no backend of the requested concrete type.
    #[error("[kv-keeper] Storage with type \"{0}\" is not supported")]
    Unsupported(BackendType),

    /// Auto resolution found no backend at all.
    #[error("[kv-keeper] This platform does not support any storages")]
    NoSupportedStorage,

    /// A host store request failed.
    #[error("[kv-keeper] {message}: {event}")]
    HostRequest {
        /// What the adapter was doing when the host failed.
        message: String,
        /// The raw host error event.
        event: HostError,
    },

    /// Opening the transactional connection failed.
    #[error("[kv-keeper] Unable to open database: {0}")]
    ConnectionFailed(HostError),

    /// Opening was blocked by another open connection on an older version.
    #[error("[kv-keeper] Unable to open database: blocked by another connection")]
    ConnectionBlocked,

    /// The adapter's connection is not open.
    #[error("[kv-keeper] Storage is closed")]
    Closed,
}

/// Coarse classification of [`KeeperError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer or configuration errors.
    Validation,
    /// No backend of the requested (or any) type is present.
    Unavailable,
    /// A host request failed, or the adapter is closed.
    HostRequest,
    /// Connection open failed or was blocked.
    Connection,
}

impl KeeperError {
    /// Build a [`KeeperError::HostRequest`] from a failed host event.
    pub(crate) fn host_request(message: impl Into<String>, event: HostError) -> Self {
        Self::HostRequest {
            message: message.into(),
            event,
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unsupported(_) | Self::NoSupportedStorage => ErrorKind::Unavailable,
            Self::HostRequest { .. } | Self::Closed => ErrorKind::HostRequest,
            Self::ConnectionFailed(_) | Self::ConnectionBlocked => ErrorKind::Connection,
        }
    }
}

/// Result type for storage operations.
pub type KeeperResult<T> = Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_messages() {
        assert_eq!(
            KeeperError::Unsupported(BackendType::Flat).to_string(),
            "[kv-keeper] Storage with type \"flat\" is not supported"
        );
        assert_eq!(
            KeeperError::NoSupportedStorage.to_string(),
            "[kv-keeper] This platform does not support any storages"
        );
    }

    #[test]
    fn test_host_request_embeds_host_message() {
        let err = KeeperError::host_request(
            "Unable to set item",
            HostError::new("QuotaExceededError", "quota exceeded"),
        );
        let text = err.to_string();
        assert!(text.contains("Unable to set item"));
        assert!(text.contains("quota exceeded"));
        assert_eq!(err.kind(), ErrorKind::HostRequest);
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            KeeperError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(KeeperError::NoSupportedStorage.kind(), ErrorKind::Unavailable);
        assert_eq!(KeeperError::ConnectionBlocked.kind(), ErrorKind::Connection);
        assert_eq!(
            KeeperError::ConnectionFailed(HostError::new("UnknownError", "boom")).kind(),
            ErrorKind::Connection
        );
    }
}
