//! Error types for CAPMT and CI+ message parsing

use thiserror::Error;

/// Errors that can occur while parsing CAM protocol data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is incomplete - need more data
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Unexpected APDU tag
    #[error("invalid tag: expected 0x{expected:06X}, got 0x{actual:06X}")]
    InvalidTag { expected: u32, actual: u32 },

    /// Length field outside the three ASN.1 forms
    #[error("invalid length field: 0x{0:02X}")]
    InvalidLength(u8),

    /// A datatype payload has the wrong size for its ID
    #[error("datatype 0x{id:02X} has length {actual}, expected {expected}")]
    InvalidDatatypeLength {
        id: u8,
        expected: usize,
        actual: usize,
    },

    /// Invalid frame structure
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Unknown CAPMT list management value
    #[error("unknown list management: 0x{0:02X}")]
    UnknownListManagement(u8),

    /// Unknown CAPMT command ID
    #[error("unknown CAPMT command: 0x{0:02X}")]
    UnknownCommand(u8),
}

/// Higher-level protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Message is too large for the length encoding
    #[error("message body of {0} bytes cannot be encoded")]
    Oversized(usize),

    /// Handshake step received out of order
    #[error("unexpected handshake message: {0}")]
    UnexpectedMessage(String),
}
