//! Daemon errors.

use thiserror::Error;

use bw_lnd::LndError;
use bw_store::StoreError;

/// Errors from the dispatcher, peer controllers, and their supporting tasks.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// An event referenced a channel the host does not know. Fatal: every
    /// event must be attributable to a peer.
    #[error("channel {0} not found")]
    ChannelNotFound(u64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lnd(#[from] LndError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("htlc event stream closed by host")]
    EventStreamClosed,

    #[error("interceptor stream closed by host")]
    InterceptorStreamClosed,

    #[error("dispatcher is gone")]
    DispatcherGone,

    #[error("peer controller is gone")]
    ControllerGone,

    #[error("task failed: {0}")]
    Task(String),

    #[error("management api error: {0}")]
    Api(String),
}
