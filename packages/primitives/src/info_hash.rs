//! A `BitTorrent` info-hash: the 20-byte SHA-1 of the bencoded `info` value
//! from a metainfo file.
//!
//! See [BEP 3](https://www.bittorrent.org/beps/bep_0003.html). Only v1
//! info-hashes are supported.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const INFO_HASH_BYTES_LEN: usize = 20;

/// `BitTorrent` Info Hash v1.
///
/// Displayed and serialized as a 40-character lowercase hex string, stored
/// as the raw 20-byte array.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord, Default)]
pub struct InfoHash(pub [u8; INFO_HASH_BYTES_LEN]);

impl InfoHash {
    /// Create a new `InfoHash` from a byte slice.
    ///
    /// # Panics
    ///
    /// Will panic if the slice is not exactly 20 bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), INFO_HASH_BYTES_LEN);
        let mut data = [0u8; INFO_HASH_BYTES_LEN];
        data.copy_from_slice(bytes);
        Self(data)
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; INFO_HASH_BYTES_LEN] {
        self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseInfoHashError {
    #[error("info-hash must be 40 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("info-hash contains a non-hex character")]
    InvalidCharacter,
}

impl FromStr for InfoHash {
    type Err = ParseInfoHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * INFO_HASH_BYTES_LEN {
            return Err(ParseInfoHashError::InvalidLength(s.len()));
        }

        let mut data = [0u8; INFO_HASH_BYTES_LEN];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParseInfoHashError::InvalidCharacter)?;
            data[i] = u8::from_str_radix(hex, 16).map_err(|_| ParseInfoHashError::InvalidCharacter)?;
        }

        Ok(Self(data))
    }
}

impl From<[u8; INFO_HASH_BYTES_LEN]> for InfoHash {
    fn from(data: [u8; INFO_HASH_BYTES_LEN]) -> Self {
        Self(data)
    }
}

impl serde::Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for InfoHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{InfoHash, ParseInfoHashError};

    #[test]
    fn display_is_lowercase_hex() {
        let hash = InfoHash::from_bytes(&[0xAB; 20]);
        assert_eq!(hash.to_string(), "ab".repeat(20));
    }

    #[test]
    fn parses_back_from_hex() {
        let hash = InfoHash::from_bytes(&[0x5a; 20]);
        assert_eq!(InfoHash::from_str(&hash.to_string()), Ok(hash));
    }

    #[test]
    fn rejects_wrong_length_and_bad_characters() {
        assert_eq!(
            InfoHash::from_str("abcd"),
            Err(ParseInfoHashError::InvalidLength(4))
        );
        assert_eq!(
            InfoHash::from_str(&"zz".repeat(20)),
            Err(ParseInfoHashError::InvalidCharacter)
        );
    }

    #[test]
    fn serializes_as_a_hex_string() {
        let hash = InfoHash::from_bytes(&[0x01; 20]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(20)));
        assert_eq!(serde_json::from_str::<InfoHash>(&json).unwrap(), hash);
    }
}
