// src/stun/auth.rs
//! Credential key derivation and message signing
//!
//! Long-term credentials (RFC 5389 Section 15.4): the key is
//! MD5(username ":" realm ":" password) and MESSAGE-INTEGRITY is
//! HMAC-SHA1 over the message up to (and covering the length of) the
//! integrity attribute. FINGERPRINT is CRC-32 XORed with 0x5354554e.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::{RelayResult, StunError};

type HmacSha1 = Hmac<Sha1>;

/// FINGERPRINT XOR constant ("STUN")
const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// MESSAGE-INTEGRITY attribute wire type
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;

/// Derive the long-term credential key for response signing
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// HMAC-SHA1 over the message prefix
pub fn message_integrity(data: &[u8], key: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify the MESSAGE-INTEGRITY attribute of an encoded packet.
///
/// Scans the attribute list for MESSAGE-INTEGRITY, recomputes the HMAC over
/// the preceding bytes with the length field adjusted to cover the
/// integrity attribute, and compares.
pub fn verify_integrity(packet: &[u8], key: &[u8]) -> RelayResult<bool> {
    let integrity_pos = find_attribute(packet, ATTR_MESSAGE_INTEGRITY)?
        .ok_or(StunError::MissingAttribute("MESSAGE-INTEGRITY"))?;

    if packet.len() < integrity_pos + 24 {
        return Err(StunError::InvalidMessage("MESSAGE-INTEGRITY truncated".into()).into());
    }

    let mut prefix = packet[..integrity_pos].to_vec();
    let adjusted_length = (integrity_pos - 20 + 24) as u16;
    prefix[2..4].copy_from_slice(&adjusted_length.to_be_bytes());

    let expected = message_integrity(&prefix, key);
    let found = &packet[integrity_pos + 4..integrity_pos + 24];
    Ok(expected[..] == *found)
}

/// Append a MESSAGE-INTEGRITY attribute to an already-encoded packet,
/// adjusting the header length to cover it
pub fn append_integrity(packet: &[u8], key: &[u8]) -> RelayResult<Vec<u8>> {
    if packet.len() < 20 {
        return Err(StunError::InvalidMessage("Packet too short".into()).into());
    }
    let mut buf = packet.to_vec();
    let length = (buf.len() - 20 + 24) as u16;
    buf[2..4].copy_from_slice(&length.to_be_bytes());

    let hmac = message_integrity(&buf, key);
    buf.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
    buf.extend_from_slice(&20u16.to_be_bytes());
    buf.extend_from_slice(&hmac);
    Ok(buf)
}

/// CRC-32 fingerprint value for an encoded message prefix
pub fn fingerprint_value(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize() ^ FINGERPRINT_XOR
}

/// Byte offset of the first attribute of the given type, walking the
/// attribute list after the 20-byte header
fn find_attribute(packet: &[u8], attr_type: u16) -> RelayResult<Option<usize>> {
    if packet.len() < 20 {
        return Err(StunError::InvalidMessage("Packet too short".into()).into());
    }
    let mut pos = 20;
    while pos + 4 <= packet.len() {
        let a_type = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let a_len = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]) as usize;
        if a_type == attr_type {
            return Ok(Some(pos));
        }
        let padded = (a_len + 3) & !3;
        pos += 4 + padded;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_term_key_matches_rfc_shape() {
        // MD5("user:realm:pass") is deterministic and 16 bytes
        let key = long_term_key("user", "realm", "pass");
        assert_eq!(key, long_term_key("user", "realm", "pass"));
        assert_ne!(key, long_term_key("user", "realm", "other"));
    }

    #[test]
    fn test_integrity_is_keyed() {
        let data = b"some stun message prefix";
        let a = message_integrity(data, b"key-a");
        let b = message_integrity(data, b"key-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_xor() {
        let raw = crc32fast::hash(b"abc");
        assert_eq!(fingerprint_value(b"abc"), raw ^ 0x5354_554e);
    }

    #[test]
    fn test_verify_rejects_missing_attribute() {
        // Header-only packet, no attributes
        let mut packet = vec![0u8; 20];
        packet[0] = 0x01;
        assert!(verify_integrity(&packet, b"key").is_err());
    }
}
