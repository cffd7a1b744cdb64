//! Error handling for the platform screen door communication engine
//!
//! One error type for the whole engine. Plugin-load and per-point errors are
//! reported and recovered locally; connection faults are recovered by the
//! session reconnect loop (see [`CommError::is_connection_fault`]).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Communication engine error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommError {
    /// Raw I/O attempted while the driver is disconnected
    #[error("Not connected")]
    NotConnected,

    /// Driver could not open its connection; `code` is the native status code
    #[error("Connect failed (code {code}): {message}")]
    ConnectFailed { code: i32, message: String },

    /// Request shape does not match what the protocol accepts
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Bit index outside 0..=7
    #[error("Bit index {bit} out of range (0..=7)")]
    OutOfRange { bit: u8 },

    #[error("Buffer too short: need {needed} bytes, got {actual}")]
    BufferTooShort { needed: usize, actual: usize },

    /// Second driver claiming an already registered protocol key
    #[error("Duplicate protocol key: {0}")]
    DuplicateProtocolKey(String),

    #[error("Plugin load failed for {source_name}: {reason}")]
    PluginLoadFailed { source_name: String, reason: String },

    #[error("Unparsable address '{address}': {reason}")]
    UnparsableAddress { address: String, reason: String },

    /// Inverted forwarding configured on a non-boolean point
    #[error("Inverted sync is invalid for point {point_id} of type {data_type}")]
    SyncModeInvalidForType { point_id: String, data_type: String },

    #[error("Transfer timed out after {0:?}")]
    TransferTimeout(Duration),

    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Method {method} not found on device {device}")]
    MethodNotFound { device: String, method: String },

    /// Device answered with a native error (e.g. a Modbus exception)
    #[error("Transfer failed (code {code}): {message}")]
    TransferFailed { code: i32, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// Malformed or unexpected frame on the wire
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("State error: {0}")]
    StateError(String),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, CommError>;

impl CommError {
    pub fn config(msg: impl Into<String>) -> Self {
        CommError::ConfigError(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        CommError::InvalidRequest(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CommError::ProtocolError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        CommError::IoError(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        CommError::StateError(msg.into())
    }

    pub fn unparsable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        CommError::UnparsableAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn plugin_load(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CommError::PluginLoadFailed {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that mean the connection can no longer be trusted.
    ///
    /// A session receiving one of these leaves `Running` for `Faulted` and
    /// reconnects with backoff. Native device errors (`TransferFailed`) and
    /// request errors keep the session running.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            CommError::NotConnected
                | CommError::ConnectFailed { .. }
                | CommError::TransferTimeout(_)
                | CommError::IoError(_)
                | CommError::ProtocolError(_)
        )
    }
}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CommError {
    fn from(err: serde_yaml::Error) -> Self {
        CommError::ConfigError(format!("YAML: {}", err))
    }
}

impl From<serde_json::Error> for CommError {
    fn from(err: serde_json::Error) -> Self {
        CommError::ConfigError(format!("JSON: {}", err))
    }
}

impl From<csv::Error> for CommError {
    fn from(err: csv::Error) -> Self {
        CommError::ConfigError(format!("CSV: {}", err))
    }
}

impl From<figment::Error> for CommError {
    fn from(err: figment::Error) -> Self {
        CommError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fault_classification() {
        assert!(CommError::NotConnected.is_connection_fault());
        assert!(CommError::TransferTimeout(Duration::from_secs(1)).is_connection_fault());
        assert!(CommError::io("reset by peer").is_connection_fault());

        assert!(!CommError::TransferFailed {
            code: 2,
            message: "illegal data address".into()
        }
        .is_connection_fault());
        assert!(!CommError::invalid_request("odd offset").is_connection_fault());
        assert!(!CommError::OutOfRange { bit: 9 }.is_connection_fault());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: CommError = io.into();
        assert!(matches!(err, CommError::IoError(ref m) if m.contains("pipe closed")));
    }
}
