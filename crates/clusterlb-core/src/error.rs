//! Control-protocol error taxonomy.

use std::fmt;

use thiserror::Error;

/// Result type alias for control-command processing.
pub type McmpResult<T> = Result<T, McmpError>;

/// Class of a control-protocol error, sent back in the `Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed, oversized or missing mandatory field. Always raised
    /// before any table is touched.
    Syntax,
    /// Table full, record not found, or identity conflict.
    Mem,
    /// Anything else.
    General,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SYNTAX",
            ErrorKind::Mem => "MEM",
            ErrorKind::General => "GENERAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error answered to the controller that sent a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct McmpError {
    pub kind: ErrorKind,
    pub message: String,
}

impl McmpError {
    pub fn syntax(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Syntax,
            message: message.into(),
        }
    }

    pub fn mem(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Mem,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::General,
            message: message.into(),
        }
    }

    /// Value for the `Mess` response header.
    pub fn header_message(&self) -> String {
        self.to_string()
    }
}
