//! MESSAGE-INTEGRITY (HMAC-SHA1) and FINGERPRINT (CRC32) computation.
//!
//! Both attributes cover only the message bytes preceding themselves, with
//! the header length field set as if the attribute were already appended.
//! The helpers here take the running message prefix and do that length
//! adjustment internally, so the builder can compute-then-append.

use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

use super::header::HEADER_SIZE;
use crate::error::{Result, StunError};

/// MESSAGE-INTEGRITY digest length.
pub const INTEGRITY_LEN: usize = 20;

/// Constant XORed into the CRC32 checksum of FINGERPRINT.
pub const FINGERPRINT_XOR: u32 = 0x5354554E;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

type HmacSha1 = Hmac<Sha1>;

/// Long-term credential key: MD5 of `username:realm:password`.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Short-term credential key: MD5 of the password.
pub fn short_term_key(password: &str) -> [u8; 16] {
    Md5::digest(password.as_bytes()).into()
}

/// HMAC-SHA1 over `prefix` (a message up to but excluding the
/// MESSAGE-INTEGRITY attribute) with the header length field set as if the
/// 24-byte attribute were already appended.
pub fn compute_integrity(prefix: &[u8], key: &[u8]) -> Result<[u8; 20]> {
    if prefix.len() < HEADER_SIZE {
        return Err(StunError::Truncated { needed: HEADER_SIZE, have: prefix.len() });
    }
    let mut covered = prefix.to_vec();
    let adjusted = (prefix.len() - HEADER_SIZE + 4 + INTEGRITY_LEN) as u16;
    covered[2..4].copy_from_slice(&adjusted.to_be_bytes());

    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|_| StunError::OversizeField { field: "integrity key", max: usize::MAX })?;
    mac.update(&covered);
    Ok(mac.finalize().into_bytes().into())
}

/// CRC32 over `prefix` XORed with the STUN constant, with the header length
/// set as if the 8-byte FINGERPRINT attribute were already appended.
pub fn compute_fingerprint(prefix: &[u8]) -> Result<u32> {
    if prefix.len() < HEADER_SIZE {
        return Err(StunError::Truncated { needed: HEADER_SIZE, have: prefix.len() });
    }
    let mut covered = prefix.to_vec();
    let adjusted = (prefix.len() - HEADER_SIZE + 8) as u16;
    covered[2..4].copy_from_slice(&adjusted.to_be_bytes());
    Ok(CRC32.checksum(&covered) ^ FINGERPRINT_XOR)
}

/// Byte offset of the first TLV with the given type code, walking the
/// attribute section of a raw message.
pub fn find_attribute(raw: &[u8], type_code: u16) -> Option<usize> {
    let mut pos = HEADER_SIZE;
    while pos + 4 <= raw.len() {
        let code = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
        if code == type_code {
            return Some(pos);
        }
        pos += 4 + len;
        pos += (4 - len % 4) % 4;
    }
    None
}

/// Recompute the MESSAGE-INTEGRITY digest of a raw message and compare it
/// byte-for-byte with the attribute's value.
pub fn verify_integrity(raw: &[u8], key: &[u8]) -> Result<bool> {
    let pos = find_attribute(raw, 0x0008).ok_or(StunError::UnknownAttribute(0x0008))?;
    if raw.len() < pos + 4 + INTEGRITY_LEN {
        return Err(StunError::Truncated { needed: pos + 4 + INTEGRITY_LEN, have: raw.len() });
    }
    let expected = &raw[pos + 4..pos + 4 + INTEGRITY_LEN];
    let computed = compute_integrity(&raw[..pos], key)?;
    Ok(computed == expected)
}

/// Recompute the FINGERPRINT checksum of a raw message and compare it with
/// the attribute's value.
pub fn verify_fingerprint(raw: &[u8]) -> Result<bool> {
    let pos = find_attribute(raw, 0x8028).ok_or(StunError::UnknownAttribute(0x8028))?;
    if raw.len() < pos + 8 {
        return Err(StunError::Truncated { needed: pos + 8, have: raw.len() });
    }
    let expected = u32::from_be_bytes([raw[pos + 4], raw[pos + 5], raw[pos + 6], raw[pos + 7]]);
    let computed = compute_fingerprint(&raw[..pos])?;
    Ok(computed == expected)
}
