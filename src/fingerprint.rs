//! Canonical binary encoding for stable fingerprints and cache keys.
//!
//! Combo fingerprints, dataset signatures, and evaluation cache keys must be
//! identical across runs, platforms, and serde versions. Hashing JSON text
//! does not give that guarantee: float formatting, key ordering, and optional
//! field omission can all shift between encoders. Instead, everything that
//! feeds a hash implements [`CanonicalBytes`]:
//!
//! - first byte is [`FINGERPRINT_ENCODING_VERSION`] (bump on rule changes)
//! - fields are encoded in struct-declaration order
//! - integers are little-endian fixed-width
//! - `f64` is encoded as its IEEE-754 bit pattern (little-endian)
//! - bools are a single 0/1 byte
//! - strings are u32-length-prefixed UTF-8
//! - sequences are a u32 count followed by their elements
//!
//! The resulting bytes are hashed with SHA-256 and rendered as lowercase hex.

use sha2::{Digest, Sha256};

/// Encoding version byte. Bump when any encoding rule changes so stale
/// fingerprints can never collide with new ones.
pub const FINGERPRINT_ENCODING_VERSION: u8 = 0x01;

/// Deterministic binary encoding of a value, suitable for hashing.
pub trait CanonicalBytes {
    /// Encode to canonical bytes. The first byte MUST be
    /// [`FINGERPRINT_ENCODING_VERSION`].
    fn canonical_bytes(&self) -> Vec<u8>;
}

/// SHA-256 over the canonical bytes, as lowercase hex.
pub fn canonical_hash<T: CanonicalBytes>(value: &T) -> String {
    let digest = Sha256::digest(value.canonical_bytes());
    hex::encode(digest)
}

/// Stable hash of an arbitrary JSON value.
///
/// `serde_json` maps are backed by `BTreeMap` (the `preserve_order` feature
/// is not enabled), so compact serialization already has sorted keys and a
/// deterministic float rendering. Used where the input is free-form JSON
/// (the stripped base configuration) rather than a known struct.
pub fn stable_json_hash(value: &serde_json::Value) -> String {
    let encoded = value.to_string();
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

/// SHA-256 of raw bytes, as lowercase hex. Fallback for unparseable content.
pub fn raw_bytes_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[inline]
pub fn encode_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

#[inline]
pub fn encode_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn encode_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn encode_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// `f64` is encoded via `to_bits`, not decimal text, so every representable
/// value has exactly one encoding.
#[inline]
pub fn encode_f64(buf: &mut Vec<u8>, value: f64) {
    buf.extend_from_slice(&value.to_bits().to_le_bytes());
}

#[inline]
pub fn encode_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

/// Length-prefixed UTF-8 string.
#[inline]
pub fn encode_string(buf: &mut Vec<u8>, value: &str) {
    encode_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

/// Count-prefixed sequence of strings.
pub fn encode_string_seq<S: AsRef<str>>(buf: &mut Vec<u8>, values: &[S]) {
    encode_u32(buf, values.len() as u32);
    for v in values {
        encode_string(buf, v.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample {
        floor: f64,
        count: u32,
        strict: bool,
        label: String,
    }

    impl CanonicalBytes for Sample {
        fn canonical_bytes(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            encode_u8(&mut buf, FINGERPRINT_ENCODING_VERSION);
            encode_f64(&mut buf, self.floor);
            encode_u32(&mut buf, self.count);
            encode_bool(&mut buf, self.strict);
            encode_string(&mut buf, &self.label);
            buf
        }
    }

    fn sample() -> Sample {
        Sample {
            floor: 1.25,
            count: 30,
            strict: true,
            label: "core".into(),
        }
    }

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(canonical_hash(&sample()), canonical_hash(&sample()));
    }

    #[test]
    fn test_version_byte_leads() {
        assert_eq!(sample().canonical_bytes()[0], FINGERPRINT_ENCODING_VERSION);
    }

    #[test]
    fn test_field_change_changes_hash() {
        let mut other = sample();
        other.floor = 1.2500001;
        assert_ne!(canonical_hash(&sample()), canonical_hash(&other));
    }

    #[test]
    fn test_f64_bit_exact() {
        // 0.1 + 0.2 != 0.3 in IEEE-754; the encoding must see them apart.
        let mut a = Vec::new();
        let mut b = Vec::new();
        encode_f64(&mut a, 0.1 + 0.2);
        encode_f64(&mut b, 0.3);
        assert_ne!(a, b);
    }

    #[test]
    fn test_string_seq_length_prefixed() {
        // ["ab"] must not collide with ["a", "b"].
        let mut a = Vec::new();
        let mut b = Vec::new();
        encode_string_seq(&mut a, &["ab"]);
        encode_string_seq(&mut b, &["a", "b"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stable_json_hash_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(stable_json_hash(&a), stable_json_hash(&b));
    }
}
