//! Content digests for layers.
//!
//! A layer is identified by the SHA-256 of its bytes, rendered as 64 lowercase hex
//! characters on disk, in logs and in JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// SHA-256 digest of a layer blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerDigest([u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestParseError {
    #[error("digest must be exactly 64 hexadecimal digits, got {0}")]
    WrongLength(usize),

    #[error("digest contains a non-hexadecimal character")]
    NotHex,

    #[error("digest must be 32 bytes, got {0}")]
    WrongByteLength(usize),
}

impl LayerDigest {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash `data` and return its digest.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Decode the raw 32-byte wire form.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DigestParseError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DigestParseError::WrongByteLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl From<u64> for LayerDigest {
    fn from(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }
}

impl fmt::Display for LayerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for LayerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerDigest({})", self)
    }
}

impl FromStr for LayerDigest {
    type Err = DigestParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != 64 {
            return Err(DigestParseError::WrongLength(value.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in value.as_bytes().chunks(2).enumerate() {
            let hi = hex_value(chunk[0]).ok_or(DigestParseError::NotHex)?;
            let lo = hex_value(chunk[1]).ok_or(DigestParseError::NotHex)?;
            bytes[i] = hi << 4 | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Serialize for LayerDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LayerDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_vector() {
        // sha256("abc")
        assert_eq!(
            LayerDigest::compute(b"abc").to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn parse_and_display_agree() {
        let text = "101112131415161718191a1b1c1d1e1f202122232425262728292a2b2c2d2e2f";
        let digest: LayerDigest = text.parse().unwrap();
        assert_eq!(digest.as_bytes()[0], 0x10);
        assert_eq!(digest.as_bytes()[31], 0x2f);
        assert_eq!(digest.to_string(), text);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(
            "abc".parse::<LayerDigest>(),
            Err(DigestParseError::WrongLength(3))
        );
        let not_hex = "z".repeat(64);
        assert_eq!(
            not_hex.parse::<LayerDigest>(),
            Err(DigestParseError::NotHex)
        );
    }

    #[test]
    fn from_slice_requires_32_bytes() {
        assert!(LayerDigest::from_slice(&[0u8; 31]).is_err());
        let digest = LayerDigest::from_slice(&[7u8; 32]).unwrap();
        assert_eq!(digest.to_vec(), vec![7u8; 32]);
    }

    #[test]
    fn from_u64_is_big_endian_in_tail() {
        let digest = LayerDigest::from(0x0102u64);
        assert_eq!(digest.as_bytes()[30], 0x01);
        assert_eq!(digest.as_bytes()[31], 0x02);
    }

    #[test]
    fn serde_uses_hex_string() {
        let digest = LayerDigest::compute(b"layer");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest));
        let back: LayerDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
