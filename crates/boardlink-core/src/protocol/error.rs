//! Protocol errors

use thiserror::Error;

/// Errors that can occur while driving a board
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{device} is already open{}", .owner.map(|p| format!(" by pid {p}")).unwrap_or_default())]
    DeviceBusy {
        device: String,
        owner: Option<i32>,
    },

    #[error("Failed to access {device}")]
    DeviceNotFound { device: String },

    #[error("Unexpected response: expected {expected}, got {:?}", String::from_utf8_lossy(.received))]
    UnexpectedResponse {
        expected: &'static str,
        received: Vec<u8>,
    },

    #[error("Timeout waiting for {waiting_for}")]
    Timeout { waiting_for: &'static str },

    #[error("Board reported an execution error: {}", String::from_utf8_lossy(.stderr))]
    ExecutionFault {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("Not connected to a board")]
    NotConnected,

    #[error("Not in raw REPL mode")]
    NotInRawRepl,

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
