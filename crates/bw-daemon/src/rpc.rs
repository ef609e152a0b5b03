//! Wire types for the management API, shared by the server and the CLI.

use serde::{Deserialize, Serialize};

use bw_core::{HtlcInfo, Limit};
use bw_ratelimit::RateCounts;

/// `GET /api/info`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub node_key: String,
    pub node_alias: String,
    pub node_version: String,

    /// Daemon version.
    pub version: String,
}

/// One row in `GET /api/limits`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeLimit {
    /// 66-char hex node key.
    pub node: String,
    pub alias: String,

    /// The effective limit: the peer's override if set, else the default.
    pub limit: Limit,

    pub counter_1h: RateCounts,
    pub counter_24h: RateCounts,
    pub queue_len: usize,
    pub pending_htlc_count: usize,
}

/// `GET /api/limits`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListLimitsResponse {
    pub default_limit: Limit,
    pub limits: Vec<NodeLimit>,
}

/// One resolved forward in `GET /api/history`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Forward {
    pub add_time_ns: i64,
    pub resolve_time_ns: i64,
    pub settled: bool,
    pub incoming_msat: u64,
    pub outgoing_msat: u64,
    pub incoming_peer: String,
    pub outgoing_peer: Option<String>,
    pub incoming_channel: u64,
    pub incoming_htlc_index: u64,
    pub outgoing_channel: u64,
    pub outgoing_htlc_index: u64,
}

impl From<HtlcInfo> for Forward {
    fn from(htlc: HtlcInfo) -> Self {
        Self {
            add_time_ns: htlc.add_time.timestamp_nanos_opt().unwrap_or(i64::MAX),
            resolve_time_ns: htlc.resolve_time.timestamp_nanos_opt().unwrap_or(i64::MAX),
            settled: htlc.settled,
            incoming_msat: htlc.incoming_msat,
            outgoing_msat: htlc.outgoing_msat,
            incoming_peer: htlc.incoming_peer.to_string(),
            outgoing_peer: htlc.outgoing_peer.map(|p| p.to_string()),
            incoming_channel: htlc.incoming_circuit.channel,
            incoming_htlc_index: htlc.incoming_circuit.htlc,
            outgoing_channel: htlc.outgoing_circuit.channel,
            outgoing_htlc_index: htlc.outgoing_circuit.htlc,
        }
    }
}

/// `GET /api/history`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub forwards: Vec<Forward>,
}

/// Error body returned by the management API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
