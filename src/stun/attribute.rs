//! Attribute TLV codec
//!
//! Each attribute is a 2-byte type, 2-byte length, and a value padded to a
//! 4-byte boundary. Address attributes come in two layouts: the legacy
//! plain family/port/address form and the XOR form keyed by the owning
//! message's magic cookie and transaction ID. Both ends must derive the
//! same mask, so the cookie/tid of the message are threaded through here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use super::TransactionId;
use crate::error::StunError;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_RESPONSE_ADDRESS: u16 = 0x0002;
pub const ATTR_CHANGE_REQUEST: u16 = 0x0003;
pub const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
pub const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_PASSWORD: u16 = 0x0007;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_REFLECTED_FROM: u16 = 0x000B;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_SERVER: u16 = 0x8022;
pub const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

/// A decoded STUN attribute.
///
/// XOR-MAPPED-ADDRESS is stored already de-obfuscated; encoding re-applies
/// the mask. Types outside the NAT-discovery set (MESSAGE-INTEGRITY,
/// FINGERPRINT, ...) are carried as `Unknown` so a message can be
/// re-serialized faithfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    ResponseAddress(SocketAddr),
    ChangeRequest { change_ip: bool, change_port: bool },
    SourceAddress(SocketAddr),
    ChangedAddress(SocketAddr),
    Username(String),
    Password(String),
    ErrorCode { code: u16, reason: String },
    ReflectedFrom(SocketAddr),
    XorMappedAddress(SocketAddr),
    ServerName(String),
    OtherAddress(SocketAddr),
    Unknown { type_code: u16, data: Vec<u8> },
}

impl Attribute {
    /// Wire type code of this attribute
    pub fn type_code(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Attribute::ResponseAddress(_) => ATTR_RESPONSE_ADDRESS,
            Attribute::ChangeRequest { .. } => ATTR_CHANGE_REQUEST,
            Attribute::SourceAddress(_) => ATTR_SOURCE_ADDRESS,
            Attribute::ChangedAddress(_) => ATTR_CHANGED_ADDRESS,
            Attribute::Username(_) => ATTR_USERNAME,
            Attribute::Password(_) => ATTR_PASSWORD,
            Attribute::ErrorCode { .. } => ATTR_ERROR_CODE,
            Attribute::ReflectedFrom(_) => ATTR_REFLECTED_FROM,
            Attribute::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Attribute::ServerName(_) => ATTR_SERVER,
            Attribute::OtherAddress(_) => ATTR_OTHER_ADDRESS,
            Attribute::Unknown { type_code, .. } => *type_code,
        }
    }

    /// Encode this attribute into `buf`, padding the value to a 4-byte
    /// boundary. The cookie/tid key the XOR transform.
    pub fn encode(&self, buf: &mut BytesMut, magic_cookie: u32, tid: &TransactionId) {
        buf.put_u16(self.type_code());
        let len_pos = buf.len();
        buf.put_u16(0); // backpatched below

        match self {
            Attribute::MappedAddress(addr)
            | Attribute::ResponseAddress(addr)
            | Attribute::SourceAddress(addr)
            | Attribute::ChangedAddress(addr)
            | Attribute::ReflectedFrom(addr) => {
                encode_address(buf, addr, None);
            }
            Attribute::XorMappedAddress(addr) => {
                encode_address(buf, addr, Some((magic_cookie, tid)));
            }
            Attribute::OtherAddress(addr) => {
                encode_address(buf, addr, None);
            }
            Attribute::ChangeRequest { change_ip, change_port } => {
                let mut flags = 0u32;
                if *change_ip {
                    flags |= CHANGE_IP_FLAG;
                }
                if *change_port {
                    flags |= CHANGE_PORT_FLAG;
                }
                buf.put_u32(flags);
            }
            Attribute::Username(text)
            | Attribute::Password(text)
            | Attribute::ServerName(text) => {
                buf.put_slice(text.as_bytes());
            }
            Attribute::ErrorCode { code, reason } => {
                buf.put_u16(0); // reserved
                buf.put_u8((code / 100) as u8 & 0x07);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            Attribute::Unknown { data, .. } => {
                buf.put_slice(data);
            }
        }

        let value_len = buf.len() - len_pos - 2;
        buf[len_pos..len_pos + 2].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - value_len % 4) % 4;
        for _ in 0..padding {
            buf.put_u8(0);
        }
    }

    /// Decode one attribute value. `value` holds exactly the declared
    /// length; padding bytes stay outside it. Unknown type codes are kept
    /// verbatim, malformed known ones fail the whole message decode.
    pub fn decode(
        type_code: u16,
        value: &[u8],
        magic_cookie: u32,
        tid: &TransactionId,
    ) -> Result<Attribute, StunError> {
        let attr = match type_code {
            ATTR_MAPPED_ADDRESS => {
                Attribute::MappedAddress(decode_address(type_code, value, None)?)
            }
            ATTR_RESPONSE_ADDRESS => {
                Attribute::ResponseAddress(decode_address(type_code, value, None)?)
            }
            ATTR_SOURCE_ADDRESS => {
                Attribute::SourceAddress(decode_address(type_code, value, None)?)
            }
            ATTR_CHANGED_ADDRESS => {
                Attribute::ChangedAddress(decode_address(type_code, value, None)?)
            }
            ATTR_REFLECTED_FROM => {
                Attribute::ReflectedFrom(decode_address(type_code, value, None)?)
            }
            ATTR_XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(decode_address(
                type_code,
                value,
                Some((magic_cookie, tid)),
            )?),
            ATTR_OTHER_ADDRESS => {
                Attribute::OtherAddress(decode_address(type_code, value, None)?)
            }
            ATTR_CHANGE_REQUEST => {
                if value.len() < 4 {
                    return Err(StunError::TruncatedAttribute { type_code });
                }
                let flags = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                Attribute::ChangeRequest {
                    change_ip: flags & CHANGE_IP_FLAG != 0,
                    change_port: flags & CHANGE_PORT_FLAG != 0,
                }
            }
            ATTR_USERNAME => Attribute::Username(String::from_utf8_lossy(value).into_owned()),
            ATTR_PASSWORD => Attribute::Password(String::from_utf8_lossy(value).into_owned()),
            ATTR_SERVER => Attribute::ServerName(String::from_utf8_lossy(value).into_owned()),
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::TruncatedAttribute { type_code });
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                Attribute::ErrorCode {
                    code: class * 100 + number,
                    reason: String::from_utf8_lossy(&value[4..]).into_owned(),
                }
            }
            _ => Attribute::Unknown {
                type_code,
                data: value.to_vec(),
            },
        };
        Ok(attr)
    }
}

/// Write the family/port/address layout: 1 reserved byte, 1 family byte,
/// 2-byte port, then 4 or 16 address bytes. `xor_key` switches to the
/// obfuscated form.
fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor_key: Option<(u32, &TransactionId)>) {
    buf.put_u8(0); // reserved
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_IPV4);
            let mut port = addr.port();
            let mut octets = ip.octets();
            if let Some((cookie, _)) = xor_key {
                port ^= (cookie >> 16) as u16;
                let mask = cookie.to_be_bytes();
                for (b, m) in octets.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
            }
            buf.put_u16(port);
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_IPV6);
            let mut port = addr.port();
            let mut octets = ip.octets();
            if let Some((cookie, tid)) = xor_key {
                port ^= (cookie >> 16) as u16;
                let mask = cookie.to_be_bytes();
                for (b, m) in octets[..4].iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
                for (b, m) in octets[4..].iter_mut().zip(tid.as_bytes().iter()) {
                    *b ^= m;
                }
            }
            buf.put_u16(port);
            buf.put_slice(&octets);
        }
    }
}

fn decode_address(
    type_code: u16,
    value: &[u8],
    xor_key: Option<(u32, &TransactionId)>,
) -> Result<SocketAddr, StunError> {
    let mut cur = value;
    if cur.remaining() < 4 {
        return Err(StunError::TruncatedAttribute { type_code });
    }
    cur.advance(1); // reserved
    let family = cur.get_u8();
    let mut port = cur.get_u16();
    if let Some((cookie, _)) = xor_key {
        port ^= (cookie >> 16) as u16;
    }

    let ip = match family {
        FAMILY_IPV4 => {
            if cur.remaining() < 4 {
                return Err(StunError::TruncatedAttribute { type_code });
            }
            let mut octets = [0u8; 4];
            cur.copy_to_slice(&mut octets);
            if let Some((cookie, _)) = xor_key {
                let mask = cookie.to_be_bytes();
                for (b, m) in octets.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            if cur.remaining() < 16 {
                return Err(StunError::TruncatedAttribute { type_code });
            }
            let mut octets = [0u8; 16];
            cur.copy_to_slice(&mut octets);
            if let Some((cookie, tid)) = xor_key {
                let mask = cookie.to_be_bytes();
                for (b, m) in octets[..4].iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
                for (b, m) in octets[4..].iter_mut().zip(tid.as_bytes().iter()) {
                    *b ^= m;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(StunError::InvalidFamily(other)),
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::MAGIC_COOKIE;

    // RFC 5769 sample transaction ID
    fn sample_tid() -> TransactionId {
        TransactionId::from_bytes([
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ])
    }

    #[test]
    fn xor_mapped_address_matches_rfc5769_ipv4_sample() {
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let attr = Attribute::XorMappedAddress(addr);

        let mut buf = BytesMut::new();
        attr.encode(&mut buf, MAGIC_COOKIE, &sample_tid());

        let expected_value = [0x00, 0x01, 0xA1, 0x47, 0xE1, 0x12, 0xA6, 0x43];
        assert_eq!(&buf[..4], &[0x00, 0x20, 0x00, 0x08]);
        assert_eq!(&buf[4..], &expected_value);

        let decoded = Attribute::decode(
            ATTR_XOR_MAPPED_ADDRESS,
            &expected_value,
            MAGIC_COOKIE,
            &sample_tid(),
        )
        .unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn xor_mapped_address_matches_rfc5769_ipv6_sample() {
        let addr: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853".parse().unwrap();
        let attr = Attribute::XorMappedAddress(addr);

        let mut buf = BytesMut::new();
        attr.encode(&mut buf, MAGIC_COOKIE, &sample_tid());

        let expected_value = [
            0x00, 0x02, 0xA1, 0x47, 0x01, 0x13, 0xA9, 0xFA, 0xA5, 0xD3, 0xF1, 0x79, 0xBC, 0x25,
            0xF4, 0xB5, 0xBE, 0xD2, 0xB9, 0xD9,
        ];
        assert_eq!(&buf[..4], &[0x00, 0x20, 0x00, 0x14]);
        assert_eq!(&buf[4..], &expected_value);

        let decoded = Attribute::decode(
            ATTR_XOR_MAPPED_ADDRESS,
            &expected_value,
            MAGIC_COOKIE,
            &sample_tid(),
        )
        .unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn xor_transform_follows_message_cookie_not_the_fixed_one() {
        // A legacy message may carry an arbitrary cookie; the mask must use it.
        let addr: SocketAddr = "198.51.100.7:4242".parse().unwrap();
        let attr = Attribute::XorMappedAddress(addr);
        let cookie = 0xDEADBEEF;
        let tid = sample_tid();

        let mut buf = BytesMut::new();
        attr.encode(&mut buf, cookie, &tid);
        let decoded = Attribute::decode(ATTR_XOR_MAPPED_ADDRESS, &buf[4..], cookie, &tid).unwrap();
        assert_eq!(decoded, attr);

        // Decoding with the wrong cookie yields a different address.
        let wrong = Attribute::decode(ATTR_XOR_MAPPED_ADDRESS, &buf[4..], MAGIC_COOKIE, &tid).unwrap();
        assert_ne!(wrong, attr);
    }

    #[test]
    fn change_request_flags_round_trip() {
        for (change_ip, change_port, flags) in [
            (true, true, 0x06u8),
            (true, false, 0x04),
            (false, true, 0x02),
            (false, false, 0x00),
        ] {
            let attr = Attribute::ChangeRequest { change_ip, change_port };
            let mut buf = BytesMut::new();
            attr.encode(&mut buf, MAGIC_COOKIE, &sample_tid());
            assert_eq!(&buf[..], &[0x00, 0x03, 0x00, 0x04, 0, 0, 0, flags]);

            let decoded =
                Attribute::decode(ATTR_CHANGE_REQUEST, &buf[4..], MAGIC_COOKIE, &sample_tid())
                    .unwrap();
            assert_eq!(decoded, attr);
        }
    }

    #[test]
    fn error_code_layout() {
        let attr = Attribute::ErrorCode {
            code: 420,
            reason: "Unknown Attribute".to_string(),
        };
        let mut buf = BytesMut::new();
        attr.encode(&mut buf, MAGIC_COOKIE, &sample_tid());

        // reserved, reserved, class 4, number 20
        assert_eq!(&buf[4..8], &[0x00, 0x00, 0x04, 0x14]);

        let decoded =
            Attribute::decode(ATTR_ERROR_CODE, &buf[4..4 + 4 + 17], MAGIC_COOKIE, &sample_tid())
                .unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn mapped_address_uses_plain_layout() {
        let addr: SocketAddr = "203.0.113.9:3478".parse().unwrap();
        let attr = Attribute::MappedAddress(addr);
        let mut buf = BytesMut::new();
        attr.encode(&mut buf, MAGIC_COOKIE, &sample_tid());

        // No obfuscation: port and address appear verbatim.
        assert_eq!(&buf[6..8], &3478u16.to_be_bytes());
        assert_eq!(&buf[8..12], &[203, 0, 113, 9]);

        let decoded =
            Attribute::decode(ATTR_MAPPED_ADDRESS, &buf[4..], MAGIC_COOKIE, &sample_tid()).unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn invalid_family_is_rejected() {
        let value = [0x00, 0x03, 0x0D, 0x96, 1, 2, 3, 4];
        let err =
            Attribute::decode(ATTR_MAPPED_ADDRESS, &value, MAGIC_COOKIE, &sample_tid()).unwrap_err();
        assert_eq!(err, StunError::InvalidFamily(0x03));
    }

    #[test]
    fn truncated_address_is_rejected() {
        let value = [0x00, 0x01, 0x0D];
        let err =
            Attribute::decode(ATTR_MAPPED_ADDRESS, &value, MAGIC_COOKIE, &sample_tid()).unwrap_err();
        assert!(matches!(err, StunError::TruncatedAttribute { .. }));
    }

    #[test]
    fn unknown_attribute_preserves_raw_bytes() {
        // MESSAGE-INTEGRITY is pass-through: kept raw, re-encoded verbatim.
        let data = vec![0xAB; 20];
        let decoded = Attribute::decode(0x0008, &data, MAGIC_COOKIE, &sample_tid()).unwrap();
        assert_eq!(
            decoded,
            Attribute::Unknown { type_code: 0x0008, data: data.clone() }
        );

        let mut buf = BytesMut::new();
        decoded.encode(&mut buf, MAGIC_COOKIE, &sample_tid());
        assert_eq!(&buf[..4], &[0x00, 0x08, 0x00, 0x14]);
        assert_eq!(&buf[4..], &data[..]);
    }

    #[test]
    fn padding_is_zeroed_to_four_byte_boundary() {
        let attr = Attribute::ServerName("abcde".to_string());
        let mut buf = BytesMut::new();
        attr.encode(&mut buf, MAGIC_COOKIE, &sample_tid());
        assert_eq!(buf.len(), 4 + 8); // 5 value bytes padded to 8
        assert_eq!(&buf[2..4], &5u16.to_be_bytes());
        assert_eq!(&buf[9..], &[0, 0, 0]);
    }
}
