//! Limits and operating modes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PeerId;

/// What to do with an HTLC that exceeds a peer's limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Reject when over limit.
    #[default]
    Fail,

    /// Hold in a FIFO queue until capacity frees up.
    Queue,

    /// Queue only on channels the peer opened; otherwise behave as [`Mode::Fail`].
    QueuePeerInitiated,

    /// Reject unconditionally, without consulting the limits.
    Block,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fail => "FAIL",
            Self::Queue => "QUEUE",
            Self::QueuePeerInitiated => "QUEUE_PEER_INITIATED",
            Self::Block => "BLOCK",
        };
        f.write_str(s)
    }
}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAIL" => Ok(Self::Fail),
            "QUEUE" => Ok(Self::Queue),
            "QUEUE_PEER_INITIATED" => Ok(Self::QueuePeerInitiated),
            "BLOCK" => Ok(Self::Block),
            other => Err(ModeParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown mode: {0}")]
pub struct ModeParseError(pub String);

/// Admission limit for a peer. Zero on a numeric field means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Maximum forwards per hour, enforced by a token bucket.
    pub max_hourly_rate: i64,

    /// Maximum simultaneously pending HTLCs.
    pub max_pending: i64,

    pub mode: Mode,
}

/// The default limit plus per-peer overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Limits {
    pub default: Limit,
    pub per_peer: HashMap<PeerId, Limit>,
}

impl Limits {
    /// The effective limit for a peer: its override if present, else the
    /// default.
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Limit {
        self.per_peer.get(peer).copied().unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_string_round_trip() {
        for mode in [Mode::Fail, Mode::Queue, Mode::QueuePeerInitiated, Mode::Block] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!("fail".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&Mode::QueuePeerInitiated).unwrap(),
            "\"QUEUE_PEER_INITIATED\""
        );
        assert_eq!(
            serde_json::from_str::<Mode>("\"BLOCK\"").unwrap(),
            Mode::Block
        );
    }

    #[test]
    fn lookup_falls_back_to_default() {
        let peer = PeerId::new([2; 33]);
        let other = PeerId::new([3; 33]);
        let override_limit = Limit {
            max_hourly_rate: 10,
            max_pending: 1,
            mode: Mode::Queue,
        };

        let mut limits = Limits {
            default: Limit {
                max_hourly_rate: 3600,
                max_pending: 5,
                mode: Mode::Fail,
            },
            per_peer: HashMap::new(),
        };
        limits.per_peer.insert(peer, override_limit);

        assert_eq!(limits.get(&peer), override_limit);
        assert_eq!(limits.get(&other), limits.default);
    }
}
