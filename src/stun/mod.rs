//! STUN wire codec: message framing and attribute TLVs
//!
//! Covers the RFC 5389 layout with RFC 3489 backward compatibility: the
//! magic cookie field is carried verbatim, so legacy messages whose cookie
//! is part of a 128-bit transaction identifier still round-trip and match.

pub mod attribute;
pub mod message;

use rand::rngs::OsRng;
use rand::RngCore;

pub use attribute::Attribute;
pub use message::{Message, MessageType};

/// STUN magic cookie as defined in RFC 5389
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Maximum STUN message size this client will buffer
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a new random transaction ID with a cryptographically secure RNG
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}
