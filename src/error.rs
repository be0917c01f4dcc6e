//! Error types for the stream currency model.

/// Errors from device and stream operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Invalid or contradictory constructor arguments.
    #[error("invalid stream configuration: {0}")]
    Configuration(String),

    /// Device ordinal not resolvable by the native layer.
    #[error("invalid device ordinal {ordinal} (backend reports {count} devices)")]
    InvalidDevice {
        /// The ordinal that failed to resolve.
        ordinal: usize,
        /// Number of devices the backend reports.
        count: usize,
    },

    /// Current-stream resolution impossible for the active thread/device.
    #[error("cannot resolve current stream: {0}")]
    DeviceState(String),

    /// Operation attempted on a stream whose queue was already released.
    #[error("stream queue already released")]
    UseAfterFree,

    /// A scheduled callback panicked during execution.
    #[error("stream callback failed: {0}")]
    Callback(String),

    /// Failure reported by the native queue backend.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::InvalidDevice {
            ordinal: 7,
            count: 2,
        };
        assert_eq!(
            err.to_string(),
            "invalid device ordinal 7 (backend reports 2 devices)"
        );

        let err = StreamError::UseAfterFree;
        assert_eq!(err.to_string(), "stream queue already released");
    }
}
