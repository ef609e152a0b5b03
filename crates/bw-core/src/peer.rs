//! Peer identities.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a compressed public key identifying a peer.
pub const PEER_ID_LEN: usize = 33;

/// A peer's node key (33-byte compressed public key).
///
/// Equality and hashing are byte-wise. The all-zero key is a sentinel
/// reserved for the default limit; it never identifies a real node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Sentinel key under which the default limit is stored.
    pub const DEFAULT: Self = Self([0; PEER_ID_LEN]);

    #[must_use]
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a peer id from a byte slice, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let bytes: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| PeerIdError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Whether this is the default-limit sentinel.
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Failure to parse a peer id.
#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("peer id must be {PEER_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[0] = 0x02;
        bytes[32] = 0xff;
        let peer = PeerId::new(bytes);

        let hex = peer.to_string();
        assert_eq!(hex.len(), 66);
        assert_eq!(hex.parse::<PeerId>().unwrap(), peer);
    }

    #[test]
    fn rejects_bad_input() {
        assert!("02abcd".parse::<PeerId>().is_err());
        assert!("zz".repeat(33).parse::<PeerId>().is_err());
    }

    #[test]
    fn default_sentinel() {
        assert!(PeerId::DEFAULT.is_default());
        assert_eq!(PeerId::DEFAULT.to_string(), "00".repeat(33));

        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[5] = 1;
        assert!(!PeerId::new(bytes).is_default());
    }

    #[test]
    fn serde_as_hex_string() {
        let peer: PeerId = "02".repeat(33).parse().unwrap();
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, format!("\"{}\"", "02".repeat(33)));
        assert_eq!(serde_json::from_str::<PeerId>(&json).unwrap(), peer);
    }
}
