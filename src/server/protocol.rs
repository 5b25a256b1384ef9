//! Protocol message definitions
//!
//! Defines the events exchanged between the dashboard terminal and the relay.
//! Events are JSON text frames tagged by `type`. Binary frames from the client
//! carry raw input and have no envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Current protocol version, reported in the `connected` event
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Maximum input length (1MB)
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid terminal size: {0}")]
    InvalidSize(String),

    #[error("Input of {0} bytes exceeds maximum length of {MAX_INPUT_LENGTH} bytes")]
    InputTooLarge(usize),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Reject input payloads over [`MAX_INPUT_LENGTH`]
pub fn check_input_len(len: usize) -> ProtocolResult<()> {
    if len > MAX_INPUT_LENGTH {
        return Err(ProtocolError::InputTooLarge(len));
    }
    Ok(())
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from the browser terminal to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes or pasted text for the shell
    #[serde(alias = "terminal-input")]
    Input {
        /// Bytes written verbatim to the shell
        data: String,
    },

    /// The rendered terminal changed size
    #[serde(alias = "terminal-resize")]
    Resize {
        /// New terminal width in columns
        cols: u16,
        /// New terminal height in rows
        rows: u16,
    },

    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },
}

impl ClientMessage {
    /// Parse and validate a client message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Input { data } => check_input_len(data.len()),

            ClientMessage::Resize { cols, rows } => {
                if *cols == 0 || *cols > MAX_TERMINAL_COLS {
                    return Err(ProtocolError::InvalidSize(format!(
                        "cols must be between 1 and {}",
                        MAX_TERMINAL_COLS
                    )));
                }
                if *rows == 0 || *rows > MAX_TERMINAL_ROWS {
                    return Err(ProtocolError::InvalidSize(format!(
                        "rows must be between 1 and {}",
                        MAX_TERMINAL_ROWS
                    )));
                }
                Ok(())
            }

            ClientMessage::Ping { .. } => Ok(()),
        }
    }

    /// Create an Input message
    #[cfg(test)]
    pub fn input(data: impl Into<String>) -> Self {
        ClientMessage::Input { data: data.into() }
    }

    /// Create a Resize message
    #[cfg(test)]
    pub fn resize(cols: u16, rows: u16) -> Self {
        ClientMessage::Resize { cols, rows }
    }

    /// Create a Ping message
    #[cfg(test)]
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from the relay to the browser terminal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The shell is running; sent once, before any output
    Connected {
        /// Server protocol version
        version: u32,
        /// Session identifier, for correlating logs
        session_id: Uuid,
        /// Program that was launched
        shell: String,
        /// Terminal columns
        cols: u16,
        /// Terminal rows
        rows: u16,
    },

    /// Output from the shell
    Output {
        /// Output data (may contain ANSI escape sequences)
        data: String,
    },

    /// The shell exited on its own
    Exit {
        /// Exit code if available
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<u32>,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unparseable or unknown message
    InvalidMessage,
    /// Resize outside the accepted bounds
    InvalidSize,
    /// Input over the size limit
    InputTooLarge,
    /// The shell can no longer accept input
    SessionClosed,
}

impl ServerMessage {
    /// Create a Connected message
    pub fn connected(session_id: Uuid, shell: impl Into<String>, cols: u16, rows: u16) -> Self {
        ServerMessage::Connected {
            version: PROTOCOL_VERSION,
            session_id,
            shell: shell.into(),
            cols,
            rows,
        }
    }

    /// Create an Output message
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    /// Create an Exit message
    pub fn exit(exit_code: Option<u32>) -> Self {
        ServerMessage::Exit { exit_code }
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Serialize to the JSON text of a frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::Malformed(_) => ErrorCode::InvalidMessage,
            ProtocolError::InvalidSize(_) => ErrorCode::InvalidSize,
            ProtocolError::InputTooLarge(_) => ErrorCode::InputTooLarge,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================
