//! Modbus Master Error Types
//!
//! Every failure surfaces as one `ModbusError` variant so callers can branch on
//! the kind without matching message text.

use thiserror::Error;

/// Result type for modbus-master operations
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Modbus master errors
///
/// `Clone` because one failed connection attempt is handed to every caller
/// waiting on it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Malformed caller input, rejected before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Read past the end of a register buffer
    #[error("Buffer underflow: need {needed} bytes, {available} readable")]
    Underflow { needed: usize, available: usize },

    /// Connection establishment exceeded the connect timeout
    #[error("{0}: connect timed out")]
    ConnectTimeout(String),

    /// No response within the request timeout
    #[error("{0}: request timed out")]
    RequestTimeout(String),

    /// Device answered with an exception response
    #[error("{endpoint}: device error, {description}")]
    Device {
        endpoint: String,
        code: u8,
        description: &'static str,
    },

    /// Socket-level failure (reset, refused, closed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response matched a request but its body was unusable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The master was shut down
    #[error("Modbus master is shut down")]
    Shutdown,

    /// Synchronous call made from inside an async runtime
    #[error("Blocking call inside an async runtime, use the async variant")]
    BlockingInRuntime,
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Transport(err.to_string())
    }
}

impl From<figment::Error> for ModbusError {
    fn from(err: figment::Error) -> Self {
        ModbusError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl ModbusError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ModbusError::InvalidArgument(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ModbusError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    /// Device exception for `endpoint`, described from the exception table
    pub fn device(endpoint: impl Into<String>, code: u8) -> Self {
        ModbusError::Device {
            endpoint: endpoint.into(),
            code,
            description: exception_description(code),
        }
    }

    /// Check if another attempt may succeed
    ///
    /// Argument errors and connect timeouts are terminal; request timeouts,
    /// device exceptions, protocol and transport failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModbusError::RequestTimeout(_)
                | ModbusError::Device { .. }
                | ModbusError::Transport(_)
                | ModbusError::Protocol(_)
        )
    }

    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, ModbusError::ConnectTimeout(_))
    }

    /// Check if this error means the connection is no longer usable
    pub fn tears_down_connection(&self) -> bool {
        matches!(self, ModbusError::Transport(_))
    }
}

/// Get exception description
///
/// Unknown codes map to an empty description.
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "",
    }
}
