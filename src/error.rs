//! # Error Types
//!
//! Custom error types for Vehicle Telemetry using `thiserror`.

use thiserror::Error;

/// Main error type for Vehicle Telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The serial port could not be opened, or the channel is closed
    #[error("Serial port unavailable: {0}")]
    PortUnavailable(String),

    /// OS-level serial failure; the channel closes itself afterwards
    #[error("Serial error: {0}")]
    Serial(String),

    /// A line could not be written within the write timeout
    #[error("Serial write timed out")]
    WriteTimeout,

    /// No complete line arrived within the read timeout
    #[error("Serial read timed out")]
    ReadTimeout,

    /// The port reported end-of-stream (dead link)
    #[error("Serial read returned no data")]
    EmptyRead,

    /// Malformed fix line or unexpected handshake reply
    #[error("GPS protocol error: {0}")]
    Protocol(String),

    /// Uplink delivery failed (non-2xx response or transport error)
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelemetryError {
    /// Errors the owning loop retries on its own without escalating.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TelemetryError::ReadTimeout
                | TelemetryError::WriteTimeout
                | TelemetryError::Delivery(_)
        )
    }
}

/// Result type alias for Vehicle Telemetry
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TelemetryError::ReadTimeout.is_transient());
        assert!(TelemetryError::WriteTimeout.is_transient());
        assert!(TelemetryError::Delivery("503".to_string()).is_transient());

        assert!(!TelemetryError::EmptyRead.is_transient());
        assert!(!TelemetryError::PortUnavailable("/dev/ttyUSB2".to_string()).is_transient());
        assert!(!TelemetryError::Protocol("bad ack".to_string()).is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = TelemetryError::PortUnavailable("/dev/ttyUSB2".to_string());
        assert_eq!(err.to_string(), "Serial port unavailable: /dev/ttyUSB2");
        assert_eq!(TelemetryError::EmptyRead.to_string(), "Serial read returned no data");
    }
}
