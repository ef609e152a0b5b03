//! In-flight and resolved HTLC records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CircuitKey, PeerId};

/// An HTLC that has been admitted but not yet resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InFlightHtlc {
    /// When the HTLC was admitted. `None` for HTLCs inherited from the host
    /// at startup; those are not recorded on resolution because their timing
    /// and amounts are unknown.
    pub add_time: Option<DateTime<Utc>>,

    pub incoming_msat: u64,
    pub outgoing_msat: u64,
}

/// One row of forwarding history: a fully resolved HTLC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcInfo {
    pub add_time: DateTime<Utc>,
    pub resolve_time: DateTime<Utc>,
    pub settled: bool,
    pub incoming_msat: u64,
    pub outgoing_msat: u64,
    pub incoming_peer: PeerId,
    /// `None` when the HTLC failed before an outgoing channel was attributed.
    pub outgoing_peer: Option<PeerId>,
    pub incoming_circuit: CircuitKey,
    pub outgoing_circuit: CircuitKey,
}
