use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid interface name '{0}': only letters, digits and '_' are allowed")]
    InvalidInterface(String),

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Interface '{0}' does not support P2P mode")]
    P2pUnsupported(String),

    #[error("No session record found in {0}")]
    NoSession(String),

    #[error("Malformed session record {path} at line {line}: {reason}")]
    MalformedRecord {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("Value for {0} must not contain a line break")]
    InvalidRecordValue(String),

    #[error("Interrupted by signal {0}")]
    Interrupted(i32),

    #[error("Failed to execute {tool}: {message}")]
    CommandFailed { tool: &'static str, message: String },

    #[error("This operation requires root privileges")]
    NotRoot,
}

/// Stream supervision error codes. `as_i32` gives the negative numeric form
/// printed in status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamErrorCode {
    AlreadyRunning,
    InvalidParams,
    ForkFailed,
    ExecFailed,
    NotRunning,
}

impl StreamErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            StreamErrorCode::AlreadyRunning => -1,
            StreamErrorCode::InvalidParams => -2,
            StreamErrorCode::ForkFailed => -3,
            StreamErrorCode::ExecFailed => -4,
            StreamErrorCode::NotRunning => -5,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct StreamError {
    pub code: StreamErrorCode,
    pub message: String,
}

impl StreamError {
    pub fn new(code: StreamErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
