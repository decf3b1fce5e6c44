//! STUN message codec: 20-byte header plus an ordered attribute sequence
//!
//! The header is 2-byte type, 2-byte attribute-region length, 4-byte magic
//! cookie, 12-byte transaction ID. RFC 3489 peers put random bytes where
//! the cookie lives; those bytes are kept and compared as part of the
//! transaction identifier, and they key the XOR transform of any XOR'd
//! attribute in the same message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::attribute::{
    Attribute, ATTR_CHANGED_ADDRESS, ATTR_MAPPED_ADDRESS, ATTR_OTHER_ADDRESS, ATTR_SOURCE_ADDRESS,
    ATTR_XOR_MAPPED_ADDRESS,
};
use super::{TransactionId, HEADER_SIZE, MAGIC_COOKIE};
use crate::error::StunError;
use std::net::SocketAddr;

/// STUN message types used by NAT discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingErrorResponse = 0x0111,
}

impl MessageType {
    /// Interpret a raw wire value. The top two bits are masked to zero for
    /// RFC 3489 compatibility before matching.
    pub fn from_raw(raw: u16) -> Result<Self, StunError> {
        match raw & 0x3FFF {
            0x0001 => Ok(MessageType::BindingRequest),
            0x0101 => Ok(MessageType::BindingResponse),
            0x0111 => Ok(MessageType::BindingErrorResponse),
            _ => Err(StunError::UnknownMessageType(raw)),
        }
    }
}

/// A STUN protocol data unit
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub magic_cookie: u32,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// Create a message with an explicit cookie and transaction ID
    pub fn new(message_type: MessageType, magic_cookie: u32, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            magic_cookie,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a Binding Request with the RFC 5389 cookie and a fresh
    /// random transaction ID
    pub fn binding_request() -> Self {
        Self::new(MessageType::BindingRequest, MAGIC_COOKIE, TransactionId::new())
    }

    /// Append an attribute, keeping insertion order for the wire layout
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Result<Bytes, StunError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode into `buf`, returning the number of bytes written. The
    /// length field is backpatched once all attributes are in place.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<usize, StunError> {
        let start = buf.len();
        buf.put_u16(self.message_type as u16);
        buf.put_u16(0); // backpatched below
        buf.put_u32(self.magic_cookie);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            attr.encode(buf, self.magic_cookie, &self.transaction_id);
        }

        let body_len = buf.len() - start - HEADER_SIZE;
        if body_len > u16::MAX as usize {
            return Err(StunError::MessageTooLarge(body_len));
        }
        buf[start + 2..start + 4].copy_from_slice(&(body_len as u16).to_be_bytes());
        Ok(buf.len() - start)
    }

    /// Total frame size (header + declared attribute region) once at least
    /// the length field is buffered. Used by the TCP reader to know when a
    /// streamed message is complete.
    pub fn frame_length(data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        Some(HEADER_SIZE + body_len)
    }

    /// Parse a datagram or a fully buffered stream frame.
    ///
    /// The attribute loop is bounded by the declared message length, not
    /// the buffer end: trailing bytes beyond the declared region are
    /// ignored, while a region longer than the buffer fails closed.
    pub fn parse(data: &[u8]) -> Result<Message, StunError> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::TruncatedMessage {
                needed: HEADER_SIZE,
                have: data.len(),
            });
        }

        let mut header = &data[..HEADER_SIZE];
        let message_type = MessageType::from_raw(header.get_u16())?;
        let body_len = header.get_u16() as usize;
        let magic_cookie = header.get_u32();
        let mut tid = [0u8; 12];
        header.copy_to_slice(&mut tid);
        let transaction_id = TransactionId::from_bytes(tid);

        let body = &data[HEADER_SIZE..];
        if body.len() < body_len {
            return Err(StunError::TruncatedMessage {
                needed: HEADER_SIZE + body_len,
                have: data.len(),
            });
        }

        let mut attributes = Vec::new();
        let mut offset = 0usize;
        while offset < body_len {
            if body_len - offset < 4 {
                return Err(StunError::TruncatedMessage {
                    needed: HEADER_SIZE + offset + 4,
                    have: HEADER_SIZE + body_len,
                });
            }
            let type_code = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let length = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            let value_start = offset + 4;
            if value_start + length > body_len {
                return Err(StunError::LengthOverflow { type_code, length });
            }

            let value = &body[value_start..value_start + length];
            attributes.push(Attribute::decode(
                type_code,
                value,
                magic_cookie,
                &transaction_id,
            )?);

            // Step over the value and its padding; a final attribute whose
            // padding the sender omitted still parses.
            let padded = length + (4 - length % 4) % 4;
            offset = (value_start + padded).min(body_len);
        }

        Ok(Message {
            message_type,
            magic_cookie,
            transaction_id,
            attributes,
        })
    }

    /// Whether `other` answers this message. The full cookie‖transaction-id
    /// identifier is compared, which covers both the RFC 5389 96-bit and
    /// the legacy 128-bit forms; it is the only correlation token STUN
    /// provides.
    pub fn is_same_transaction(&self, other: &Message) -> bool {
        self.magic_cookie == other.magic_cookie && self.transaction_id == other.transaction_id
    }

    fn first_address(&self, type_code: u16) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::MappedAddress(a) if type_code == ATTR_MAPPED_ADDRESS => Some(*a),
            Attribute::XorMappedAddress(a) if type_code == ATTR_XOR_MAPPED_ADDRESS => Some(*a),
            Attribute::ChangedAddress(a) if type_code == ATTR_CHANGED_ADDRESS => Some(*a),
            Attribute::OtherAddress(a) if type_code == ATTR_OTHER_ADDRESS => Some(*a),
            Attribute::SourceAddress(a) if type_code == ATTR_SOURCE_ADDRESS => Some(*a),
            _ => None,
        })
    }

    /// First MAPPED-ADDRESS, if any
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.first_address(ATTR_MAPPED_ADDRESS)
    }

    /// First XOR-MAPPED-ADDRESS (already de-obfuscated), if any
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.first_address(ATTR_XOR_MAPPED_ADDRESS)
    }

    /// First CHANGED-ADDRESS, if any
    pub fn changed_address(&self) -> Option<SocketAddr> {
        self.first_address(ATTR_CHANGED_ADDRESS)
    }

    /// First OTHER-ADDRESS, if any
    pub fn other_address(&self) -> Option<SocketAddr> {
        self.first_address(ATTR_OTHER_ADDRESS)
    }

    /// First SOURCE-ADDRESS, if any
    pub fn source_address(&self) -> Option<SocketAddr> {
        self.first_address(ATTR_SOURCE_ADDRESS)
    }

    /// First ERROR-CODE as (numeric code, reason phrase), if any
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tid() -> TransactionId {
        TransactionId::from_bytes([
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ])
    }

    #[test]
    fn buffers_shorter_than_a_header_fail_to_parse() {
        for len in 0..HEADER_SIZE {
            let data = vec![0u8; len];
            assert!(matches!(
                Message::parse(&data),
                Err(StunError::TruncatedMessage { .. })
            ));
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::ChangeRequest { change_ip: true, change_port: false });
        msg.add_attribute(Attribute::XorMappedAddress("192.0.2.1:32853".parse().unwrap()));
        msg.add_attribute(Attribute::ServerName("stunprobe test".to_string()));

        let bytes = msg.encode().unwrap();
        let parsed = Message::parse(&bytes).unwrap();

        assert_eq!(parsed.message_type, MessageType::BindingRequest);
        assert!(msg.is_same_transaction(&parsed));
        assert_eq!(parsed.attributes, msg.attributes);
    }

    #[test]
    fn trailing_bytes_beyond_declared_length_are_ignored() {
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::MappedAddress("203.0.113.9:3478".parse().unwrap()));
        let mut bytes = msg.encode().unwrap().to_vec();
        bytes.extend_from_slice(&[0xFF; 7]); // datagram padding

        let parsed = Message::parse(&bytes).unwrap();
        assert_eq!(parsed.attributes.len(), 1);
        assert_eq!(parsed.mapped_address(), Some("203.0.113.9:3478".parse().unwrap()));
    }

    #[test]
    fn declared_length_longer_than_buffer_fails_closed() {
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::MappedAddress("203.0.113.9:3478".parse().unwrap()));
        let mut bytes = msg.encode().unwrap().to_vec();
        bytes[3] += 8; // claim more attribute bytes than present

        assert!(matches!(
            Message::parse(&bytes),
            Err(StunError::TruncatedMessage { .. })
        ));
    }

    #[test]
    fn attribute_overrunning_the_body_fails_closed() {
        let mut bytes = Message::binding_request().encode().unwrap().to_vec();
        // Hand-append an attribute header claiming 64 value bytes with none present.
        bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x40]);
        bytes[2..4].copy_from_slice(&4u16.to_be_bytes());

        assert!(matches!(
            Message::parse(&bytes),
            Err(StunError::LengthOverflow { type_code: 0x0001, length: 64 })
        ));
    }

    #[test]
    fn transaction_matching_requires_cookie_and_id() {
        let a = Message::new(MessageType::BindingRequest, MAGIC_COOKIE, sample_tid());
        let mut b = Message::new(MessageType::BindingResponse, MAGIC_COOKIE, sample_tid());
        assert!(a.is_same_transaction(&b));

        b.transaction_id = TransactionId::from_bytes([0u8; 12]);
        assert!(!a.is_same_transaction(&b));

        // Legacy 128-bit identifiers: same 96-bit tail, different cookie.
        let c = Message::new(MessageType::BindingResponse, 0x01020304, sample_tid());
        assert!(!a.is_same_transaction(&c));
    }

    #[test]
    fn legacy_cookie_keys_the_xor_transform() {
        let addr: SocketAddr = "198.51.100.23:1234".parse().unwrap();
        let mut msg = Message::new(MessageType::BindingResponse, 0xCAFEF00D, sample_tid());
        msg.add_attribute(Attribute::XorMappedAddress(addr));

        let parsed = Message::parse(&msg.encode().unwrap()).unwrap();
        assert_eq!(parsed.magic_cookie, 0xCAFEF00D);
        assert_eq!(parsed.xor_mapped_address(), Some(addr));
    }

    #[test]
    fn top_two_type_bits_are_masked_for_legacy_peers() {
        let mut bytes = Message::binding_request().encode().unwrap().to_vec();
        bytes[0] |= 0x40;
        let parsed = Message::parse(&bytes).unwrap();
        assert_eq!(parsed.message_type, MessageType::BindingRequest);
    }

    #[test]
    fn unknown_message_types_are_rejected() {
        let mut bytes = Message::binding_request().encode().unwrap().to_vec();
        bytes[1] = 0x09;
        assert!(matches!(
            Message::parse(&bytes),
            Err(StunError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn first_occurrence_wins_for_duplicate_attributes() {
        let first: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        let second: SocketAddr = "192.0.2.2:2000".parse().unwrap();
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::MappedAddress(first));
        msg.add_attribute(Attribute::MappedAddress(second));

        let parsed = Message::parse(&msg.encode().unwrap()).unwrap();
        assert_eq!(parsed.mapped_address(), Some(first));
    }

    #[test]
    fn frame_length_reports_declared_size() {
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::ChangeRequest { change_ip: true, change_port: true });
        let bytes = msg.encode().unwrap();

        assert_eq!(Message::frame_length(&bytes[..2]), None);
        assert_eq!(Message::frame_length(&bytes[..4]), Some(bytes.len()));
    }
}
