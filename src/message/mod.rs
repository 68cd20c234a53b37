//! STUN message codec: header bit-packing, TLV attribute encode/decode,
//! XOR address obfuscation, MESSAGE-INTEGRITY and FINGERPRINT.

pub mod attribute;
pub mod builder;
pub mod header;
pub mod integrity;

use std::net::SocketAddr;

use bytes::Bytes;

pub use attribute::{Attribute, AttributeType, MAX_REASON_LEN, TRANSPORT_UDP};
pub use builder::MessageBuilder;
pub use header::{
    validate_wire, MessageClass, MessageHeader, Method, TransactionId, HEADER_SIZE, MAGIC_COOKIE,
};
pub use integrity::{
    compute_fingerprint, compute_integrity, long_term_key, short_term_key, verify_fingerprint,
    verify_integrity, FINGERPRINT_XOR, INTEGRITY_LEN,
};

use crate::error::{Result, StunError};

/// Largest message this stack will decode or buffer.
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// A decoded STUN message.
///
/// Constructed in one shot by [`StunMessage::decode`] or a
/// [`MessageBuilder`]; immutable afterwards, so `raw` and `attrs` always
/// describe the same wire bytes. The attribute list preserves wire order and
/// holds at most one attribute per kind.
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Decoded header with the final attribute-section length.
    pub header: MessageHeader,
    /// Attributes in wire order, duplicate-free.
    pub attrs: Vec<Attribute>,
    /// Exact wire bytes.
    pub raw: Bytes,
}

impl StunMessage {
    /// Decode a complete message.
    ///
    /// Any malformed, unknown or truncated attribute aborts decoding of the
    /// whole message; no partial attribute list is ever returned.
    pub fn decode(raw: Bytes) -> Result<Self> {
        let header = MessageHeader::decode(&raw)?;
        let expected = HEADER_SIZE + header.length as usize;
        if raw.len() < expected {
            return Err(StunError::Truncated { needed: expected, have: raw.len() });
        }
        if raw.len() > expected {
            return Err(StunError::BadLength(header.length));
        }

        let mut attrs: Vec<Attribute> = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset + 4 <= raw.len() {
            let code = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
            let declared = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
            let attr_type = AttributeType::from_code(code)?;

            let value_start = offset + 4;
            if raw.len() - value_start < declared {
                return Err(StunError::TruncatedAttribute {
                    attr_type: code,
                    declared,
                    remaining: raw.len() - value_start,
                });
            }

            // No attribute may follow FINGERPRINT, and MESSAGE-INTEGRITY
            // must already be in place when FINGERPRINT arrives.
            if attrs.last().map(Attribute::attr_type) == Some(AttributeType::Fingerprint) {
                return Err(StunError::FingerprintNotLast);
            }
            if attrs.iter().any(|a| a.attr_type() == attr_type) {
                return Err(StunError::DuplicateAttribute(code));
            }

            let value = &raw[value_start..value_start + declared];
            attrs.push(Attribute::decode_value(attr_type, value, &header.transaction_id)?);

            // The declared length excludes padding; consumption rounds the
            // value up to the next 4-byte boundary.
            offset = value_start + declared + (4 - declared % 4) % 4;
        }

        if offset != raw.len() {
            return Err(StunError::Truncated { needed: offset, have: raw.len() });
        }

        Ok(Self { header, attrs, raw })
    }

    /// First attribute of the given kind, if present.
    pub fn get(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.attr_type() == attr_type)
    }

    /// USERNAME value.
    pub fn username(&self) -> Option<&str> {
        match self.get(AttributeType::Username)? {
            Attribute::Username(u) => Some(u),
            _ => None,
        }
    }

    /// REALM value.
    pub fn realm(&self) -> Option<&str> {
        match self.get(AttributeType::Realm)? {
            Attribute::Realm(r) => Some(r),
            _ => None,
        }
    }

    /// NONCE value.
    pub fn nonce(&self) -> Option<&[u8]> {
        match self.get(AttributeType::Nonce)? {
            Attribute::Nonce(n) => Some(n),
            _ => None,
        }
    }

    /// DATA payload.
    pub fn data(&self) -> Option<&[u8]> {
        match self.get(AttributeType::Data)? {
            Attribute::Data(d) => Some(d),
            _ => None,
        }
    }

    /// XOR-PEER-ADDRESS value.
    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::XorPeerAddress)? {
            Attribute::XorPeerAddress(a) => Some(*a),
            _ => None,
        }
    }

    /// XOR-MAPPED-ADDRESS value.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::XorMappedAddress)? {
            Attribute::XorMappedAddress(a) => Some(*a),
            _ => None,
        }
    }

    /// XOR-RELAYED-ADDRESS value.
    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::XorRelayedAddress)? {
            Attribute::XorRelayedAddress(a) => Some(*a),
            _ => None,
        }
    }

    /// LIFETIME value in seconds.
    pub fn lifetime(&self) -> Option<u32> {
        match self.get(AttributeType::Lifetime)? {
            Attribute::Lifetime(secs) => Some(*secs),
            _ => None,
        }
    }

    /// REQUESTED-TRANSPORT protocol number.
    pub fn requested_transport(&self) -> Option<u8> {
        match self.get(AttributeType::RequestedTransport)? {
            Attribute::RequestedTransport(p) => Some(*p),
            _ => None,
        }
    }

    /// MESSAGE-INTEGRITY digest.
    pub fn message_integrity(&self) -> Option<&[u8; 20]> {
        match self.get(AttributeType::MessageIntegrity)? {
            Attribute::MessageIntegrity(d) => Some(d),
            _ => None,
        }
    }

    /// ERROR-CODE value.
    pub fn error_code(&self) -> Option<(u16, &str)> {
        match self.get(AttributeType::ErrorCode)? {
            Attribute::ErrorCode { code, reason } => Some((*code, reason)),
            _ => None,
        }
    }

    /// True when this is a request of the given method.
    pub fn is_request(&self, method: Method) -> bool {
        self.header.class == MessageClass::Request && self.header.method == method
    }

    /// True when this is an indication of the given method.
    pub fn is_indication(&self, method: Method) -> bool {
        self.header.class == MessageClass::Indication && self.header.method == method
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn build_sample() -> StunMessage {
        let mut b = MessageBuilder::new(
            MessageClass::Request,
            Method::Allocate,
            TransactionId::from_bytes([0xAB; 12]),
        );
        b.add_attr(Attribute::Software("turnpike test".into())).unwrap();
        b.add_attr(Attribute::RequestedTransport(TRANSPORT_UDP)).unwrap();
        b.add_attr(Attribute::Lifetime(600)).unwrap();
        b.add_attr(Attribute::XorPeerAddress("198.51.100.7:4321".parse().unwrap())).unwrap();
        b.build()
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = build_sample();
        let decoded = StunMessage::decode(msg.raw.clone()).unwrap();
        assert_eq!(decoded.header, msg.header);
        assert_eq!(decoded.attrs, msg.attrs);
        assert_eq!(decoded.raw, msg.raw);
        assert_eq!(decoded.header.length as usize, msg.raw.len() - HEADER_SIZE);
    }

    #[test]
    fn decode_rejects_unknown_attribute_entirely() {
        let msg = build_sample();
        let mut raw = BytesMut::from(msg.raw.as_ref());
        // Overwrite the SOFTWARE type code with an unregistered one.
        raw[20] = 0x7F;
        raw[21] = 0xFF;
        assert!(matches!(
            StunMessage::decode(raw.freeze()).unwrap_err(),
            StunError::UnknownAttribute(0x7FFF)
        ));
    }

    #[test]
    fn decode_rejects_truncated_value() {
        let msg = build_sample();
        let mut raw = BytesMut::from(msg.raw.as_ref());
        let len = raw.len();
        // Inflate the declared length of the final attribute past the buffer.
        let last_attr = len - 12; // XOR-PEER-ADDRESS TLV start (8-byte value)
        raw[last_attr + 2..last_attr + 4].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            StunMessage::decode(raw.freeze()).unwrap_err(),
            StunError::TruncatedAttribute { .. }
        ));
    }

    #[test]
    fn decode_rejects_fingerprint_not_last() {
        let mut b = MessageBuilder::new(
            MessageClass::Request,
            Method::Binding,
            TransactionId::from_bytes([1; 12]),
        );
        b.add_fingerprint().unwrap();
        let msg = b.build();
        // Splice another attribute after FINGERPRINT by hand.
        let mut raw = BytesMut::from(msg.raw.as_ref());
        raw.extend_from_slice(&[0x00, 0x0D, 0x00, 0x04, 0, 0, 0, 60]);
        let total = (raw.len() - HEADER_SIZE) as u16;
        raw[2..4].copy_from_slice(&total.to_be_bytes());
        assert!(matches!(
            StunMessage::decode(raw.freeze()).unwrap_err(),
            StunError::FingerprintNotLast
        ));
    }

    #[test]
    fn decodes_known_binding_request_vector() {
        let raw: Vec<u8> = [
            // header: binding request, length 12
            &[0x00, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42][..],
            // transaction id
            &[0x81, 0x4c, 0x72, 0x09, 0xa7, 0x68, 0xf9, 0x89, 0xf8, 0x0b, 0x73, 0xbd][..],
            // XOR-MAPPED-ADDRESS
            &[0x00, 0x20, 0x00, 0x08, 0x00, 0x01, 0x11, 0x2b, 0xe8, 0xd5, 0x61, 0x1b][..],
        ]
        .concat();

        let msg = StunMessage::decode(Bytes::from(raw)).unwrap();
        assert_eq!(msg.header.class, MessageClass::Request);
        assert_eq!(msg.header.method, Method::Binding);
        assert_eq!(msg.header.length, 12);

        let addr = msg.xor_mapped_address().unwrap();
        assert_eq!(addr.port(), 12345);
        assert_eq!(addr.ip().to_string(), "201.199.197.89");
    }

    #[test]
    fn padding_is_consumed_by_length_accounting() {
        let mut b = MessageBuilder::new(
            MessageClass::SuccessResponse,
            Method::Binding,
            TransactionId::from_bytes([2; 12]),
        );
        // 5-byte value forces 3 padding bytes before the next attribute.
        b.add_attr(Attribute::Software("hello".into())).unwrap();
        b.add_attr(Attribute::Lifetime(1)).unwrap();
        let msg = b.build();

        let decoded = StunMessage::decode(msg.raw).unwrap();
        assert_eq!(decoded.attrs.len(), 2);
        assert_eq!(decoded.lifetime(), Some(1));
    }
}
