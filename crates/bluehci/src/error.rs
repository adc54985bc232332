//! Error types for the bluehci library
//!
//! Every fallible operation in the crate returns [`HciError`]. The variants
//! follow the failure classes of the host: transport, protocol, controller,
//! precondition, resource and storage errors.

use thiserror::Error;

/// Errors that can occur while driving an HCI controller
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Failed to open HCI socket: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("Failed to bind to HCI device: {0}")]
    BindError(std::io::Error),

    #[error("Failed to send HCI packet: {0}")]
    SendError(std::io::Error),

    #[error("Failed to receive HCI packet: {0}")]
    ReceiveError(std::io::Error),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Unknown HCI packet type 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("HCI length mismatch: declared {declared}, available {available}")]
    LengthMismatch { declared: usize, available: usize },

    #[error("Command 0x{opcode:04x} failed with status 0x{status:02x}")]
    CommandFailed { opcode: u16, status: u8 },

    #[error("Precondition failed: {0}")]
    Precondition(&'static str),

    #[error("Resource busy: {0}")]
    Busy(&'static str),

    #[error("Timed out waiting for command 0x{0:04x}")]
    Timeout(u16),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Settings storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unsupported operation")]
    Unsupported,
}

impl HciError {
    /// Whether the caller may retry the same request later
    pub fn is_transient(&self) -> bool {
        matches!(self, HciError::Busy(_) | HciError::Timeout(_))
    }

    /// Whether the error was caused by malformed traffic from the controller
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            HciError::InvalidPacketFormat
                | HciError::InvalidParamLength(_)
                | HciError::UnknownPacketType(_)
                | HciError::LengthMismatch { .. }
        )
    }

    /// Status code reported by the controller, if any
    pub fn controller_status(&self) -> Option<u8> {
        match self {
            HciError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, HciError>;
