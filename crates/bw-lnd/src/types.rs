//! Wire types shared by host-client implementations.

use chrono::{DateTime, Utc};

use bw_core::{CircuitKey, PeerId};

/// The host node's identity.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub node_key: PeerId,
    pub alias: String,
    pub version: String,
}

/// One channel to a peer, as the host reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Channel {
    pub peer: PeerId,

    /// Whether *we* funded the channel. For closed channels this is
    /// best-effort; unknown counts as true so that peer-initiated queueing
    /// never triggers on our own channels by mistake.
    pub initiator: bool,
}

/// An HTLC awaiting an admission decision.
#[derive(Clone, Copy, Debug)]
pub struct InterceptedHtlc {
    pub incoming_circuit: CircuitKey,
    pub incoming_msat: u64,
    pub outgoing_msat: u64,
}

/// The admission decision for one intercepted HTLC. The circuit key must
/// echo the intercepted event's key exactly.
#[derive(Clone, Copy, Debug)]
pub struct InterceptResponse {
    pub incoming_circuit: CircuitKey,
    pub resume: bool,
}

/// A terminal outcome reported on the HTLC event stream.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedHtlc {
    pub incoming_circuit: CircuitKey,
    pub outgoing_circuit: CircuitKey,
    pub settled: bool,
    pub timestamp: DateTime<Utc>,
}
