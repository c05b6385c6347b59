//! Overload errors raised by the backpressure manager.

use std::time::Duration;
use thiserror::Error;

/// Raised when an operation cannot be admitted, or a configuration is unusable.
///
/// Every rejection maps to the same HTTP status and machine code; the variants
/// only differ in their diagnostic message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackpressureError {
    #[error("Server overloaded: {current} active, queue full ({queued}/{max_queue})")]
    QueueFull {
        current: usize,
        queued: usize,
        max_queue: usize,
    },

    #[error("Request timed out after waiting {timeout:?} in queue")]
    QueueTimeout { timeout: Duration },

    #[error("Server is shutting down, queued request rejected")]
    Shutdown,

    #[error("max_concurrent must be greater than zero")]
    InvalidMaxConcurrent,
}

impl BackpressureError {
    /// HTTP status reported for every backpressure rejection.
    pub const STATUS_CODE: u16 = 503;

    /// Machine-readable code reported for every backpressure rejection.
    pub const CODE: &'static str = "SERVICE_OVERLOADED";

    pub fn status_code(&self) -> u16 {
        Self::STATUS_CODE
    }

    pub fn code(&self) -> &'static str {
        Self::CODE
    }

    /// Short name of the rejection reason, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            BackpressureError::QueueFull { .. } => "QUEUE_FULL",
            BackpressureError::QueueTimeout { .. } => "QUEUE_TIMEOUT",
            BackpressureError::Shutdown => "SHUTDOWN",
            BackpressureError::InvalidMaxConcurrent => "INVALID_CONFIG",
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, BackpressureError::Shutdown)
    }

    pub fn is_config(&self) -> bool {
        matches!(self, BackpressureError::InvalidMaxConcurrent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_kinds_share_status_and_code() {
        let errors = [
            BackpressureError::QueueFull {
                current: 4,
                queued: 2,
                max_queue: 2,
            },
            BackpressureError::QueueTimeout {
                timeout: Duration::from_millis(50),
            },
            BackpressureError::Shutdown,
        ];

        for err in &errors {
            assert_eq!(err.status_code(), 503);
            assert_eq!(err.code(), "SERVICE_OVERLOADED");
        }

        assert_eq!(errors[0].kind(), "QUEUE_FULL");
        assert_eq!(errors[1].kind(), "QUEUE_TIMEOUT");
        assert_eq!(errors[2].kind(), "SHUTDOWN");
    }

    #[test]
    fn test_queue_full_message_has_diagnostics() {
        let err = BackpressureError::QueueFull {
            current: 4,
            queued: 2,
            max_queue: 2,
        };
        let message = err.to_string();
        assert!(message.contains("4 active"));
        assert!(message.contains("2/2"));
    }

    #[test]
    fn test_config_error_is_not_a_rejection_kind() {
        let err = BackpressureError::InvalidMaxConcurrent;
        assert!(err.is_config());
        assert!(!err.is_shutdown());
        assert_eq!(err.kind(), "INVALID_CONFIG");
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_shutdown_message() {
        assert!(BackpressureError::Shutdown.to_string().contains("shutting down"));
        assert!(BackpressureError::Shutdown.is_shutdown());
    }
}
