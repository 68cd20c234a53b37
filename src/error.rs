use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the codec, the transport agents and the relay engine.
///
/// Three families share one enum so that `?` composes across layers:
/// format errors abort decoding of a single message, protocol errors map to
/// wire error responses, transport errors surface from agent calls.
#[derive(Debug, Error)]
pub enum StunError {
    // ---- Format errors (codec) ----
    /// Buffer ended before the structure it should contain.
    #[error("message truncated: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes required by the structure being decoded.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// Header length field is not a multiple of 4.
    #[error("message length {0} is not a multiple of 4")]
    BadLength(u16),

    /// Top two bits of the first 16-bit word are set; not a STUN message.
    #[error("first word 0x{0:04X} has the top two bits set")]
    NotStun(u16),

    /// Magic cookie mismatch.
    #[error("invalid magic cookie: expected 0x2112A442, got 0x{0:08X}")]
    BadMagicCookie(u32),

    /// Class/method combination outside the supported set.
    #[error("unknown message type 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Attribute type code not in the registry.
    #[error("unknown attribute type 0x{0:04X}")]
    UnknownAttribute(u16),

    /// Attribute declares more value bytes than the buffer holds.
    #[error("attribute 0x{attr_type:04X} truncated: declared {declared}, remaining {remaining}")]
    TruncatedAttribute {
        /// Raw attribute type code.
        attr_type: u16,
        /// Declared value length.
        declared: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Same attribute kind appeared twice in one message.
    #[error("duplicate attribute 0x{0:04X}")]
    DuplicateAttribute(u16),

    /// ERROR-CODE class outside [3,6] or number outside [0,99].
    #[error("malformed ERROR-CODE: class {class}, number {number}")]
    BadErrorCode {
        /// Hundreds digit as carried on the wire.
        class: u8,
        /// Remainder as carried on the wire.
        number: u8,
    },

    /// String field longer than the wire format allows.
    #[error("{field} exceeds {max} bytes")]
    OversizeField {
        /// Field name.
        field: &'static str,
        /// Maximum allowed byte length.
        max: usize,
    },

    /// Address attribute with a family byte that is neither IPv4 nor IPv6.
    #[error("invalid address family 0x{0:02X}")]
    BadAddressFamily(u8),

    /// Text attribute holding invalid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    BadUtf8(&'static str),

    /// FINGERPRINT seen or placed anywhere but last.
    #[error("FINGERPRINT must be the last attribute")]
    FingerprintNotLast,

    /// MESSAGE-INTEGRITY placed after FINGERPRINT.
    #[error("MESSAGE-INTEGRITY must precede FINGERPRINT")]
    IntegrityAfterFingerprint,

    // ---- Protocol errors (handlers) ----
    /// Handler-level failure carrying a STUN error code and reason phrase.
    ///
    /// For request/response transactions this is serialized into an
    /// errorResponse; for indications it is logged and the message dropped.
    #[error("protocol error {code}: {reason}")]
    Protocol {
        /// Registered STUN error code (400, 401, 437, 442, ...).
        code: u16,
        /// Reason phrase.
        reason: String,
    },

    // ---- Transport errors (agents) ----
    /// Overall request deadline (RTO * Rm, or Ti for TCP) elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Retransmission attempt cap (Rc) exhausted before a response arrived.
    #[error("maximum send attempts ({0}) exhausted without a response")]
    MaxAttemptsExceeded(u32),

    /// The owning agent was closed while the call was in flight.
    #[error("agent closed")]
    AgentClosed,

    /// Low-level socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StunError {
    /// 400 Bad Request.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::Protocol { code: 400, reason: reason.into() }
    }

    /// 401 Unauthorized.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Protocol { code: 401, reason: reason.into() }
    }

    /// 437 Allocation Mismatch.
    pub fn allocation_mismatch(reason: impl Into<String>) -> Self {
        Self::Protocol { code: 437, reason: reason.into() }
    }

    /// 442 Unsupported Transport Protocol.
    pub fn unsupported_transport(reason: impl Into<String>) -> Self {
        Self::Protocol { code: 442, reason: reason.into() }
    }

    /// Numeric code and reason when this is a protocol error.
    pub fn protocol_code(&self) -> Option<(u16, &str)> {
        match self {
            Self::Protocol { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StunError>;
