//! 20-byte STUN message header: class/method bit packing, magic cookie and
//! transaction ID handling (RFC 5389 Section 6).

use bytes::{Buf, BufMut, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Result, StunError};

/// STUN magic cookie identifying STUN-format messages.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Message class, carried in two bits interleaved into the type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Request expecting a response.
    Request,
    /// Fire-and-forget indication.
    Indication,
    /// Success response to a request.
    SuccessResponse,
    /// Error response to a request.
    ErrorResponse,
}

impl MessageClass {
    /// Class bits at their wire positions (bit 4 = low, bit 8 = high).
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0x0000,
            Self::Indication => 0x0010,
            Self::SuccessResponse => 0x0100,
            Self::ErrorResponse => 0x0110,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0x0110 {
            0x0000 => Self::Request,
            0x0010 => Self::Indication,
            0x0100 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }
}

/// STUN/TURN methods supported by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Binding discovery (RFC 5389).
    Binding,
    /// Relay allocation (RFC 5766).
    Allocate,
    /// Allocation lifetime refresh.
    Refresh,
    /// Client-to-peer data indication.
    Send,
    /// Peer-to-client data indication.
    Data,
    /// Permission installation.
    CreatePermission,
}

impl Method {
    /// 12-bit registered method number.
    pub fn code(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Allocate => 0x003,
            Self::Refresh => 0x004,
            Self::Send => 0x006,
            Self::Data => 0x007,
            Self::CreatePermission => 0x008,
        }
    }

    /// Look up a method by its registered number.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x001 => Some(Self::Binding),
            0x003 => Some(Self::Allocate),
            0x004 => Some(Self::Refresh),
            0x006 => Some(Self::Send),
            0x007 => Some(Self::Data),
            0x008 => Some(Self::CreatePermission),
            _ => None,
        }
    }
}

/// 96-bit transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a fresh ID from the OS RNG.
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Wrap existing bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded STUN message header.
///
/// `length` is the exact byte length of the encoded attribute section,
/// padding included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message class.
    pub class: MessageClass,
    /// Message method.
    pub method: Method,
    /// Attribute section length in bytes.
    pub length: u16,
    /// Transaction ID.
    pub transaction_id: TransactionId,
}

impl MessageHeader {
    /// Build a header with a zero attribute-section length.
    pub fn new(class: MessageClass, method: Method, transaction_id: TransactionId) -> Self {
        Self { class, method, length: 0, transaction_id }
    }

    /// Pack class and method into the 14-bit type field. Method bits 0-3
    /// stay in place, bits 4-6 shift past the class-low bit and bits 7-11
    /// past the class-high bit.
    pub fn type_field(&self) -> u16 {
        let m = self.method.code();
        (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | self.class.bits()
    }

    /// Append the 20 header bytes to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.type_field());
        buf.put_u16(self.length);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Fails when the buffer is shorter than 20 bytes, the top two bits of
    /// the first word are set, the length is not a multiple of 4, the magic
    /// cookie is wrong, or the method is not one this stack supports.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StunError::Truncated { needed: HEADER_SIZE, have: buf.len() });
        }

        let mut cursor = &buf[..HEADER_SIZE];
        let type_field = cursor.get_u16();
        if type_field & 0xC000 != 0 {
            return Err(StunError::NotStun(type_field));
        }

        let length = cursor.get_u16();
        if length % 4 != 0 {
            return Err(StunError::BadLength(length));
        }

        let magic = cursor.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::BadMagicCookie(magic));
        }

        let mut tid = [0u8; 12];
        cursor.copy_to_slice(&mut tid);

        let method_code =
            (type_field & 0x000F) | ((type_field & 0x00E0) >> 1) | ((type_field & 0x3E00) >> 2);
        let method = Method::from_code(method_code)
            .ok_or(StunError::UnknownMessageType(type_field))?;

        Ok(Self {
            class: MessageClass::from_bits(type_field),
            method,
            length,
            transaction_id: TransactionId::from_bytes(tid),
        })
    }
}

/// Syntactic well-formedness check for a raw buffer claiming to be STUN:
/// at least 20 bytes, top bits clear, length a multiple of 4 and the magic
/// cookie in place. Used by the agents before handing bytes to the caller.
pub fn validate_wire(buf: &[u8]) -> Result<()> {
    if buf.len() < HEADER_SIZE {
        return Err(StunError::Truncated { needed: HEADER_SIZE, have: buf.len() });
    }
    let type_field = u16::from_be_bytes([buf[0], buf[1]]);
    if type_field & 0xC000 != 0 {
        return Err(StunError::NotStun(type_field));
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]);
    if length % 4 != 0 {
        return Err(StunError::BadLength(length));
    }
    let magic = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if magic != MAGIC_COOKIE {
        return Err(StunError::BadMagicCookie(magic));
    }
    Ok(())
}
