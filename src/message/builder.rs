//! Incremental raw-byte message assembly.
//!
//! The builder writes a zero-length header up front, then appends one TLV at
//! a time, padding each value to a 4-byte boundary and rewriting the header
//! length field after every append. Integrity and fingerprint attributes are
//! computed over the running prefix and appended last, in that order.

use bytes::{BufMut, BytesMut};

use super::attribute::{Attribute, AttributeType};
use super::header::{MessageClass, MessageHeader, Method, TransactionId, HEADER_SIZE};
use super::integrity::{compute_fingerprint, compute_integrity};
use super::StunMessage;
use crate::error::{Result, StunError};

/// Incremental builder for a [`StunMessage`].
#[derive(Debug)]
pub struct MessageBuilder {
    header: MessageHeader,
    buf: BytesMut,
    attrs: Vec<Attribute>,
    has_integrity: bool,
    has_fingerprint: bool,
}

impl MessageBuilder {
    /// Start a message: writes the 20-byte header with a zero length field.
    pub fn new(class: MessageClass, method: Method, transaction_id: TransactionId) -> Self {
        let header = MessageHeader::new(class, method, transaction_id);
        let mut buf = BytesMut::with_capacity(256);
        header.encode(&mut buf);
        Self { header, buf, attrs: Vec::new(), has_integrity: false, has_fingerprint: false }
    }

    /// Append one attribute.
    ///
    /// Rejects duplicates, anything after FINGERPRINT, and anything other
    /// than FINGERPRINT after MESSAGE-INTEGRITY.
    pub fn add_attr(&mut self, attr: Attribute) -> Result<&mut Self> {
        let attr_type = attr.attr_type();
        if self.has_fingerprint {
            return Err(StunError::FingerprintNotLast);
        }
        if self.has_integrity && attr_type != AttributeType::Fingerprint {
            return Err(StunError::IntegrityAfterFingerprint);
        }
        if self.attrs.iter().any(|a| a.attr_type() == attr_type) {
            return Err(StunError::DuplicateAttribute(attr_type.code()));
        }

        self.append_tlv(&attr)?;
        match attr_type {
            AttributeType::MessageIntegrity => self.has_integrity = true,
            AttributeType::Fingerprint => self.has_fingerprint = true,
            _ => {}
        }
        self.attrs.push(attr);
        Ok(self)
    }

    /// Compute HMAC-SHA1 over the current prefix and append the
    /// MESSAGE-INTEGRITY attribute.
    pub fn add_message_integrity(&mut self, key: &[u8]) -> Result<&mut Self> {
        let digest = compute_integrity(&self.buf, key)?;
        self.add_attr(Attribute::MessageIntegrity(digest))
    }

    /// Compute CRC32 over the current prefix and append the FINGERPRINT
    /// attribute. Must be the last append.
    pub fn add_fingerprint(&mut self) -> Result<&mut Self> {
        let crc = compute_fingerprint(&self.buf)?;
        self.add_attr(Attribute::Fingerprint(crc))
    }

    /// Wire bytes assembled so far (length field up to date).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finish building. The raw bytes and the attribute list were
    /// constructed together and always agree.
    pub fn build(mut self) -> StunMessage {
        self.header.length = (self.buf.len() - HEADER_SIZE) as u16;
        StunMessage { header: self.header, attrs: self.attrs, raw: self.buf.freeze() }
    }

    fn append_tlv(&mut self, attr: &Attribute) -> Result<()> {
        let start = self.buf.len();
        self.buf.put_u16(attr.attr_type().code());
        self.buf.put_u16(0);
        attr.encode_value(&mut self.buf, &self.header.transaction_id)?;

        // Length counts only the unpadded value.
        let value_len = self.buf.len() - start - 4;
        self.buf[start + 2..start + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - value_len % 4) % 4;
        for _ in 0..padding {
            self.buf.put_u8(0);
        }

        // Header length counts the padding.
        let section_len = (self.buf.len() - HEADER_SIZE) as u16;
        self.buf[2..4].copy_from_slice(&section_len.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::integrity::{verify_fingerprint, verify_integrity};

    #[test]
    fn running_length_field_counts_padding() {
        let mut b = MessageBuilder::new(MessageClass::Request, Method::Binding, TransactionId::new());
        assert_eq!(u16::from_be_bytes([b.as_bytes()[2], b.as_bytes()[3]]), 0);

        b.add_attr(Attribute::Software("ab".into())).unwrap();
        // 4-byte TLV header + 2 value bytes + 2 padding.
        assert_eq!(u16::from_be_bytes([b.as_bytes()[2], b.as_bytes()[3]]), 8);
        // Declared attribute length stays unpadded.
        assert_eq!(u16::from_be_bytes([b.as_bytes()[22], b.as_bytes()[23]]), 2);

        b.add_attr(Attribute::Lifetime(600)).unwrap();
        assert_eq!(u16::from_be_bytes([b.as_bytes()[2], b.as_bytes()[3]]), 16);
    }

    #[test]
    fn fingerprint_must_be_last() {
        let mut b = MessageBuilder::new(MessageClass::Request, Method::Binding, TransactionId::new());
        b.add_fingerprint().unwrap();
        assert!(matches!(
            b.add_attr(Attribute::Software("late".into())).unwrap_err(),
            StunError::FingerprintNotLast
        ));
    }

    #[test]
    fn only_fingerprint_may_follow_integrity() {
        let key = b"key-bytes";
        let mut b = MessageBuilder::new(MessageClass::Request, Method::Allocate, TransactionId::new());
        b.add_attr(Attribute::Username("alice".into())).unwrap();
        b.add_message_integrity(key).unwrap();
        assert!(matches!(
            b.add_attr(Attribute::Software("late".into())).unwrap_err(),
            StunError::IntegrityAfterFingerprint
        ));
        b.add_fingerprint().unwrap();

        let msg = b.build();
        assert!(verify_integrity(&msg.raw, key).unwrap());
        assert!(verify_fingerprint(&msg.raw).unwrap());
        assert!(!verify_integrity(&msg.raw, b"wrong-key").unwrap());
    }

    #[test]
    fn duplicate_attributes_rejected() {
        let mut b = MessageBuilder::new(MessageClass::Request, Method::Binding, TransactionId::new());
        b.add_attr(Attribute::Software("one".into())).unwrap();
        assert!(matches!(
            b.add_attr(Attribute::Software("two".into())).unwrap_err(),
            StunError::DuplicateAttribute(0x8022)
        ));
    }

    #[test]
    fn tampering_with_covered_bytes_breaks_integrity() {
        let key = b"secret";
        let mut b = MessageBuilder::new(MessageClass::Request, Method::Allocate, TransactionId::new());
        b.add_attr(Attribute::Username("alice".into())).unwrap();
        b.add_message_integrity(key).unwrap();
        let msg = b.build();

        let mut tampered = msg.raw.to_vec();
        tampered[8] ^= 0x01; // flip a transaction-id bit
        assert!(!verify_integrity(&tampered, key).unwrap());
    }
}
