//! The host-node client contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use bw_core::{CircuitKey, InFlightHtlc, PeerId};

use crate::{Channel, InterceptResponse, InterceptedHtlc, NodeInfo, ResolvedHtlc};

/// Deadline for unary host calls.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Both ends of the interceptor stream: decisions go out on `responses`,
/// HTLCs awaiting a decision arrive on `requests`.
pub struct InterceptorChannels {
    pub requests: mpsc::Receiver<InterceptedHtlc>,
    pub responses: mpsc::Sender<InterceptResponse>,
}

/// Contract with the host Lightning node.
#[async_trait]
pub trait LndClient: Send + Sync {
    /// Identity, alias, and version of the connected node.
    async fn get_info(&self) -> Result<NodeInfo, LndError>;

    /// Open channels, keyed by channel id.
    async fn list_channels(&self) -> Result<HashMap<u64, Channel>, LndError>;

    /// Closed channels, keyed by channel id. Initiator is best-effort.
    async fn list_closed_channels(&self) -> Result<HashMap<u64, Channel>, LndError>;

    /// A node's alias, or `None` if the host does not know the node. The
    /// latter is not an error.
    async fn get_node_alias(&self, peer: PeerId) -> Result<Option<String>, LndError>;

    /// Stream of terminal HTLC outcomes. Only forward-type settle,
    /// forward-fail, and link-fail events are delivered; everything else is
    /// filtered out. The channel closing means the host stream ended.
    async fn subscribe_htlc_events(&self) -> Result<mpsc::Receiver<ResolvedHtlc>, LndError>;

    /// The bidirectional interceptor stream.
    async fn htlc_interceptor(&self) -> Result<InterceptorChannels, LndError>;

    /// All HTLCs currently pending on the incoming side, grouped by peer,
    /// optionally restricted to one peer. Returned entries always have
    /// `add_time = None`.
    async fn pending_incoming_htlcs(
        &self,
        peer: Option<PeerId>,
    ) -> Result<HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>>, LndError>;
}

/// Host-client failures.
#[derive(Debug, Error)]
pub enum LndError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("websocket error: {0}")]
    Websocket(String),

    #[error("stream already subscribed")]
    StreamTaken,
}

impl From<reqwest::Error> for LndError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
