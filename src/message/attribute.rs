//! TLV attribute registry and per-kind value codecs, including the
//! XOR-obfuscated address math shared by the three XOR address attributes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use super::header::{TransactionId, MAGIC_COOKIE};
use crate::error::{Result, StunError};

/// Longest reason phrase an ERROR-CODE attribute may carry.
pub const MAX_REASON_LEN: usize = 763;

/// REQUESTED-TRANSPORT protocol number for UDP.
pub const TRANSPORT_UDP: u8 = 17;

/// Registered attribute type codes understood by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AttributeType {
    /// MAPPED-ADDRESS (RFC 5389).
    MappedAddress = 0x0001,
    /// USERNAME.
    Username = 0x0006,
    /// MESSAGE-INTEGRITY (HMAC-SHA1).
    MessageIntegrity = 0x0008,
    /// ERROR-CODE.
    ErrorCode = 0x0009,
    /// UNKNOWN-ATTRIBUTES.
    UnknownAttributes = 0x000A,
    /// LIFETIME (RFC 5766).
    Lifetime = 0x000D,
    /// XOR-PEER-ADDRESS (RFC 5766).
    XorPeerAddress = 0x0012,
    /// DATA (RFC 5766).
    Data = 0x0013,
    /// REALM.
    Realm = 0x0014,
    /// NONCE.
    Nonce = 0x0015,
    /// XOR-RELAYED-ADDRESS (RFC 5766).
    XorRelayedAddress = 0x0016,
    /// EVEN-PORT (RFC 5766).
    EvenPort = 0x0018,
    /// REQUESTED-TRANSPORT (RFC 5766).
    RequestedTransport = 0x0019,
    /// DONT-FRAGMENT (RFC 5766).
    DontFragment = 0x001A,
    /// XOR-MAPPED-ADDRESS (RFC 5389).
    XorMappedAddress = 0x0020,
    /// RESERVATION-TOKEN (RFC 5766).
    ReservationToken = 0x0022,
    /// SOFTWARE.
    Software = 0x8022,
    /// FINGERPRINT (CRC32).
    Fingerprint = 0x8028,
}

impl AttributeType {
    /// Wire type code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a registered code. Unregistered codes are format errors: the
    /// codec aborts the whole message rather than skipping the attribute.
    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            0x0001 => Ok(Self::MappedAddress),
            0x0006 => Ok(Self::Username),
            0x0008 => Ok(Self::MessageIntegrity),
            0x0009 => Ok(Self::ErrorCode),
            0x000A => Ok(Self::UnknownAttributes),
            0x000D => Ok(Self::Lifetime),
            0x0012 => Ok(Self::XorPeerAddress),
            0x0013 => Ok(Self::Data),
            0x0014 => Ok(Self::Realm),
            0x0015 => Ok(Self::Nonce),
            0x0016 => Ok(Self::XorRelayedAddress),
            0x0018 => Ok(Self::EvenPort),
            0x0019 => Ok(Self::RequestedTransport),
            0x001A => Ok(Self::DontFragment),
            0x0020 => Ok(Self::XorMappedAddress),
            0x0022 => Ok(Self::ReservationToken),
            0x8022 => Ok(Self::Software),
            0x8028 => Ok(Self::Fingerprint),
            other => Err(StunError::UnknownAttribute(other)),
        }
    }
}

/// Decoded attribute value, one variant per registered kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Plain transport address.
    MappedAddress(SocketAddr),
    /// XOR-obfuscated reflexive address.
    XorMappedAddress(SocketAddr),
    /// Credential username.
    Username(String),
    /// Authentication realm.
    Realm(String),
    /// Server nonce.
    Nonce(Vec<u8>),
    /// Error code and reason phrase.
    ErrorCode {
        /// class * 100 + number, class in [3,6], number in [0,99].
        code: u16,
        /// UTF-8 reason phrase, at most 763 bytes.
        reason: String,
    },
    /// HMAC-SHA1 digest over the preceding message bytes.
    MessageIntegrity([u8; 20]),
    /// CRC32 checksum over the preceding message bytes, XORed with 0x5354554E.
    Fingerprint(u32),
    /// Software description string.
    Software(String),
    /// Type codes of comprehension-required attributes the peer rejected.
    UnknownAttributes(Vec<u16>),
    /// Allocation lifetime in seconds.
    Lifetime(u32),
    /// XOR-obfuscated peer transport address.
    XorPeerAddress(SocketAddr),
    /// Opaque application payload.
    Data(Vec<u8>),
    /// XOR-obfuscated relayed transport address.
    XorRelayedAddress(SocketAddr),
    /// Relay transport protocol requested by the client.
    RequestedTransport(u8),
    /// Don't-fragment flag, zero-length value.
    DontFragment,
    /// Even-port request; `true` also reserves the next port.
    EvenPort(bool),
    /// Token identifying a reserved relayed address.
    ReservationToken([u8; 8]),
}

impl Attribute {
    /// The registered type this value encodes as.
    pub fn attr_type(&self) -> AttributeType {
        match self {
            Self::MappedAddress(_) => AttributeType::MappedAddress,
            Self::XorMappedAddress(_) => AttributeType::XorMappedAddress,
            Self::Username(_) => AttributeType::Username,
            Self::Realm(_) => AttributeType::Realm,
            Self::Nonce(_) => AttributeType::Nonce,
            Self::ErrorCode { .. } => AttributeType::ErrorCode,
            Self::MessageIntegrity(_) => AttributeType::MessageIntegrity,
            Self::Fingerprint(_) => AttributeType::Fingerprint,
            Self::Software(_) => AttributeType::Software,
            Self::UnknownAttributes(_) => AttributeType::UnknownAttributes,
            Self::Lifetime(_) => AttributeType::Lifetime,
            Self::XorPeerAddress(_) => AttributeType::XorPeerAddress,
            Self::Data(_) => AttributeType::Data,
            Self::XorRelayedAddress(_) => AttributeType::XorRelayedAddress,
            Self::RequestedTransport(_) => AttributeType::RequestedTransport,
            Self::DontFragment => AttributeType::DontFragment,
            Self::EvenPort(_) => AttributeType::EvenPort,
            Self::ReservationToken(_) => AttributeType::ReservationToken,
        }
    }

    /// Encode the unpadded value bytes into `buf`.
    pub fn encode_value(&self, buf: &mut BytesMut, tid: &TransactionId) -> Result<()> {
        match self {
            Self::MappedAddress(addr) => encode_address(buf, addr, false, tid),
            Self::XorMappedAddress(addr)
            | Self::XorPeerAddress(addr)
            | Self::XorRelayedAddress(addr) => encode_address(buf, addr, true, tid),
            Self::Username(s) => buf.put_slice(s.as_bytes()),
            Self::Realm(s) => buf.put_slice(s.as_bytes()),
            Self::Software(s) => buf.put_slice(s.as_bytes()),
            Self::Nonce(n) => buf.put_slice(n),
            Self::ErrorCode { code, reason } => {
                let class = code / 100;
                let number = code % 100;
                if !(3..=6).contains(&class) {
                    return Err(StunError::BadErrorCode {
                        class: class as u8,
                        number: number as u8,
                    });
                }
                if reason.len() > MAX_REASON_LEN {
                    return Err(StunError::OversizeField {
                        field: "ERROR-CODE reason",
                        max: MAX_REASON_LEN,
                    });
                }
                buf.put_u16(0);
                buf.put_u8(class as u8);
                buf.put_u8(number as u8);
                buf.put_slice(reason.as_bytes());
            }
            Self::MessageIntegrity(digest) => buf.put_slice(digest),
            Self::Fingerprint(crc) => buf.put_u32(*crc),
            Self::UnknownAttributes(codes) => {
                for code in codes {
                    buf.put_u16(*code);
                }
            }
            Self::Lifetime(secs) => buf.put_u32(*secs),
            Self::Data(payload) => buf.put_slice(payload),
            Self::RequestedTransport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_slice(&[0u8; 3]);
            }
            Self::DontFragment => {}
            Self::EvenPort(reserve) => buf.put_u8(if *reserve { 0x80 } else { 0x00 }),
            Self::ReservationToken(token) => buf.put_slice(token),
        }
        Ok(())
    }

    /// Decode the value bytes of one attribute. `value` is the exact slice
    /// declared by the TLV length field, padding excluded.
    pub fn decode_value(
        attr_type: AttributeType,
        value: &[u8],
        tid: &TransactionId,
    ) -> Result<Self> {
        let code = attr_type.code();
        match attr_type {
            AttributeType::MappedAddress => {
                Ok(Self::MappedAddress(decode_address(value, false, tid)?))
            }
            AttributeType::XorMappedAddress => {
                Ok(Self::XorMappedAddress(decode_address(value, true, tid)?))
            }
            AttributeType::XorPeerAddress => {
                Ok(Self::XorPeerAddress(decode_address(value, true, tid)?))
            }
            AttributeType::XorRelayedAddress => {
                Ok(Self::XorRelayedAddress(decode_address(value, true, tid)?))
            }
            AttributeType::Username => Ok(Self::Username(decode_utf8(value, "USERNAME")?)),
            AttributeType::Realm => Ok(Self::Realm(decode_utf8(value, "REALM")?)),
            AttributeType::Software => Ok(Self::Software(decode_utf8(value, "SOFTWARE")?)),
            AttributeType::Nonce => Ok(Self::Nonce(value.to_vec())),
            AttributeType::ErrorCode => {
                if value.len() < 4 {
                    return Err(StunError::TruncatedAttribute {
                        attr_type: code,
                        declared: 4,
                        remaining: value.len(),
                    });
                }
                let class = value[2];
                let number = value[3];
                if !(3..=6).contains(&class) || number > 99 {
                    return Err(StunError::BadErrorCode { class, number });
                }
                let reason_bytes = &value[4..];
                if reason_bytes.len() > MAX_REASON_LEN {
                    return Err(StunError::OversizeField {
                        field: "ERROR-CODE reason",
                        max: MAX_REASON_LEN,
                    });
                }
                let reason = decode_utf8(reason_bytes, "ERROR-CODE reason")?;
                Ok(Self::ErrorCode { code: class as u16 * 100 + number as u16, reason })
            }
            AttributeType::MessageIntegrity => {
                let digest: [u8; 20] =
                    value.try_into().map_err(|_| StunError::TruncatedAttribute {
                        attr_type: code,
                        declared: 20,
                        remaining: value.len(),
                    })?;
                Ok(Self::MessageIntegrity(digest))
            }
            AttributeType::Fingerprint => {
                let crc: [u8; 4] = value.try_into().map_err(|_| StunError::TruncatedAttribute {
                    attr_type: code,
                    declared: 4,
                    remaining: value.len(),
                })?;
                Ok(Self::Fingerprint(u32::from_be_bytes(crc)))
            }
            AttributeType::UnknownAttributes => {
                if value.len() % 2 != 0 {
                    return Err(StunError::TruncatedAttribute {
                        attr_type: code,
                        declared: value.len() + 1,
                        remaining: value.len(),
                    });
                }
                let codes = value
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(Self::UnknownAttributes(codes))
            }
            AttributeType::Lifetime => {
                let secs: [u8; 4] = value.try_into().map_err(|_| StunError::TruncatedAttribute {
                    attr_type: code,
                    declared: 4,
                    remaining: value.len(),
                })?;
                Ok(Self::Lifetime(u32::from_be_bytes(secs)))
            }
            AttributeType::Data => Ok(Self::Data(value.to_vec())),
            AttributeType::RequestedTransport => {
                if value.len() != 4 {
                    return Err(StunError::TruncatedAttribute {
                        attr_type: code,
                        declared: 4,
                        remaining: value.len(),
                    });
                }
                Ok(Self::RequestedTransport(value[0]))
            }
            AttributeType::DontFragment => {
                if !value.is_empty() {
                    return Err(StunError::TruncatedAttribute {
                        attr_type: code,
                        declared: 0,
                        remaining: value.len(),
                    });
                }
                Ok(Self::DontFragment)
            }
            AttributeType::EvenPort => {
                if value.len() != 1 {
                    return Err(StunError::TruncatedAttribute {
                        attr_type: code,
                        declared: 1,
                        remaining: value.len(),
                    });
                }
                Ok(Self::EvenPort(value[0] & 0x80 != 0))
            }
            AttributeType::ReservationToken => {
                let token: [u8; 8] =
                    value.try_into().map_err(|_| StunError::TruncatedAttribute {
                        attr_type: code,
                        declared: 8,
                        remaining: value.len(),
                    })?;
                Ok(Self::ReservationToken(token))
            }
        }
    }
}

fn decode_utf8(bytes: &[u8], field: &'static str) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| StunError::BadUtf8(field))
}

/// Encode a transport address value, XOR-obfuscating it when `xor` is set.
/// The port is XORed with the top half of the magic cookie; IPv4 addresses
/// with the cookie, IPv6 addresses with cookie-then-transaction-id.
fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor: bool, tid: &TransactionId) {
    buf.put_u8(0);
    let port = if xor { addr.port() ^ (MAGIC_COOKIE >> 16) as u16 } else { addr.port() };
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                for (o, m) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                    *o ^= m;
                }
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                let pad = xor_pad_v6(tid);
                for (o, p) in octets.iter_mut().zip(pad) {
                    *o ^= p;
                }
            }
            buf.put_slice(&octets);
        }
    }
}

/// Decode a transport address value, reversing the XOR when `xor` is set.
fn decode_address(value: &[u8], xor: bool, tid: &TransactionId) -> Result<SocketAddr> {
    if value.len() < 4 {
        return Err(StunError::Truncated { needed: 4, have: value.len() });
    }
    let family = value[1];
    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = if xor { raw_port ^ (MAGIC_COOKIE >> 16) as u16 } else { raw_port };

    match family {
        0x01 => {
            let mut octets: [u8; 4] =
                value.get(4..8).and_then(|s| s.try_into().ok()).ok_or(StunError::Truncated {
                    needed: 8,
                    have: value.len(),
                })?;
            if xor {
                for (o, m) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                    *o ^= m;
                }
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            let mut octets: [u8; 16] =
                value.get(4..20).and_then(|s| s.try_into().ok()).ok_or(StunError::Truncated {
                    needed: 20,
                    have: value.len(),
                })?;
            if xor {
                let pad = xor_pad_v6(tid);
                for (o, p) in octets.iter_mut().zip(pad) {
                    *o ^= p;
                }
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(StunError::BadAddressFamily(other)),
    }
}

/// 16-byte XOR pad for IPv6 addresses: magic cookie followed by the
/// transaction ID.
fn xor_pad_v6(tid: &TransactionId) -> [u8; 16] {
    let mut pad = [0u8; 16];
    pad[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    pad[4..].copy_from_slice(tid.as_bytes());
    pad
}
