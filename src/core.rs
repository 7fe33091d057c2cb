use std::fmt::Debug;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 32-byte BLAKE3 hash used for content fingerprints.
///
/// Two purposes:
/// 1. It decides compile cache hits: a source file whose fingerprint (and the
///    fingerprints of its recorded dependencies) did not change is not fed
///    through the transform chain again.
/// 2. It names artifact blobs inside the cache directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hash a sequence of byte slices as if they were one buffer, with each
    /// part length-prefixed so that `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hex digest: {0}")]
pub struct ParseHashError(String);

impl FromStr for Hash32 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ParseHashError(s.to_string()));
        }

        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParseHashError(s.to_string()))?;
            out[i] = u8::from_str_radix(hex, 16).map_err(|_| ParseHashError(s.to_string()))?;
        }

        Ok(Hash32(out))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash32::hash(b"component");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Hash32>().unwrap(), hash);
    }

    #[test]
    fn test_parts_are_length_prefixed() {
        let a = Hash32::hash_parts([b"ab".as_slice(), b"c".as_slice()]);
        let b = Hash32::hash_parts([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!("zz".parse::<Hash32>().is_err());
        assert!("g".repeat(64).parse::<Hash32>().is_err());
    }
}
