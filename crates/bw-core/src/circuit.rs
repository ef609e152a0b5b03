//! Circuit keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one HTLC on one side of a forward: the channel it travels
/// over and its per-channel index.
///
/// The incoming circuit key is the primary key for deduplication; the
/// outgoing key only appears in forwarding history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitKey {
    pub channel: u64,
    pub htlc: u64,
}

impl CircuitKey {
    #[must_use]
    pub const fn new(channel: u64, htlc: u64) -> Self {
        Self { channel, htlc }
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.htlc)
    }
}
