use std::io;
use thiserror::Error;

/// Error types for NAT discovery operations
#[derive(Debug, Error)]
pub enum NatError {
    /// STUN codec errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Network I/O errors
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// The query was canceled by the caller
    #[error("query canceled")]
    Canceled,

    /// DNS resolution failure
    #[error("failed to resolve {0}")]
    DnsResolution(String),

    /// Invalid construction arguments, detected before any network I/O
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation not available for this client's transport
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// STUN codec errors. These are always local to one message: a message that
/// fails to decode is treated like a missing response, never a crash.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    /// Buffer ends before the declared content
    #[error("message truncated: need {needed} bytes, have {have}")]
    TruncatedMessage { needed: usize, have: usize },

    /// Attribute value ends before its declared layout
    #[error("attribute 0x{type_code:04X} truncated")]
    TruncatedAttribute { type_code: u16 },

    /// Attribute length field runs past the message body
    #[error("attribute 0x{type_code:04X} length {length} overruns message body")]
    LengthOverflow { type_code: u16, length: usize },

    /// Address family byte is neither IPv4 nor IPv6
    #[error("invalid address family: 0x{0:02X}")]
    InvalidFamily(u8),

    /// Message type is not one this client understands
    #[error("unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Encoded attributes do not fit the 16-bit message length field
    #[error("message body of {0} bytes exceeds the 16-bit length field")]
    MessageTooLarge(usize),
}

/// Result type for NAT discovery operations
pub type NatResult<T> = Result<T, NatError>;
