//! Channel-driven mock of the host node.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use async_trait::async_trait;

use bw_core::{CircuitKey, InFlightHtlc, PeerId};
use bw_lnd::{
    Channel, InterceptResponse, InterceptedHtlc, InterceptorChannels, LndClient, LndError,
    NodeInfo, ResolvedHtlc,
};

const CHANNEL_BUFFER: usize = 64;

/// Build a peer id whose first byte is `byte` and the rest zero. Matches
/// the keys used by the mock's fixed channel topology.
#[must_use]
pub fn peer_from_byte(byte: u8) -> PeerId {
    let mut bytes = [0u8; 33];
    bytes[0] = byte;
    PeerId::new(bytes)
}

/// Test-side handles for driving a [`MockLndClient`].
pub struct MockLndHandles {
    /// Inject an HTLC awaiting an admission decision.
    pub intercepts: mpsc::Sender<InterceptedHtlc>,

    /// Inject a resolution event.
    pub events: mpsc::Sender<ResolvedHtlc>,

    /// The daemon's admission decisions, in response order.
    pub responses: mpsc::Receiver<InterceptResponse>,
}

/// Mock host with a fixed topology: channel 2 was opened by its peer
/// (peer-initiated), channel 3 by us, and channel 7 serves as the outgoing
/// side of forwards.
pub struct MockLndClient {
    identity: PeerId,
    channels: HashMap<u64, Channel>,
    pending: HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>>,

    events_rx: Mutex<Option<mpsc::Receiver<ResolvedHtlc>>>,
    requests_rx: Mutex<Option<mpsc::Receiver<InterceptedHtlc>>>,
    responses_tx: mpsc::Sender<InterceptResponse>,
}

impl MockLndClient {
    #[must_use]
    pub fn new() -> (Self, MockLndHandles) {
        let (intercept_tx, intercept_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (response_tx, response_rx) = mpsc::channel(CHANNEL_BUFFER);

        let mut channels = HashMap::new();
        channels.insert(
            2,
            Channel {
                peer: peer_from_byte(2),
                initiator: false,
            },
        );
        channels.insert(
            3,
            Channel {
                peer: peer_from_byte(3),
                initiator: true,
            },
        );
        channels.insert(
            7,
            Channel {
                peer: peer_from_byte(7),
                initiator: true,
            },
        );

        let client = Self {
            identity: peer_from_byte(1),
            channels,
            pending: HashMap::new(),
            events_rx: Mutex::new(Some(event_rx)),
            requests_rx: Mutex::new(Some(intercept_rx)),
            responses_tx: response_tx,
        };

        let handles = MockLndHandles {
            intercepts: intercept_tx,
            events: event_tx,
            responses: response_rx,
        };

        (client, handles)
    }

    /// Seed HTLCs reported as already pending on the incoming side, as if
    /// they were admitted before a restart.
    #[must_use]
    pub fn with_pending(mut self, peer: PeerId, keys: &[CircuitKey]) -> Self {
        let htlcs = self.pending.entry(peer).or_default();
        for key in keys {
            htlcs.insert(
                *key,
                InFlightHtlc {
                    add_time: None,
                    incoming_msat: 0,
                    outgoing_msat: 0,
                },
            );
        }
        self
    }
}

#[async_trait]
impl LndClient for MockLndClient {
    async fn get_info(&self) -> Result<NodeInfo, LndError> {
        Ok(NodeInfo {
            node_key: self.identity,
            alias: "mock".to_string(),
            version: "v1.0.0".to_string(),
        })
    }

    async fn list_channels(&self) -> Result<HashMap<u64, Channel>, LndError> {
        Ok(self.channels.clone())
    }

    async fn list_closed_channels(&self) -> Result<HashMap<u64, Channel>, LndError> {
        Ok(HashMap::new())
    }

    async fn get_node_alias(&self, peer: PeerId) -> Result<Option<String>, LndError> {
        Ok(Some(format!("alias-{}", &peer.to_string()[..6])))
    }

    async fn subscribe_htlc_events(&self) -> Result<mpsc::Receiver<ResolvedHtlc>, LndError> {
        self.events_rx.lock().take().ok_or(LndError::StreamTaken)
    }

    async fn htlc_interceptor(&self) -> Result<InterceptorChannels, LndError> {
        let requests = self.requests_rx.lock().take().ok_or(LndError::StreamTaken)?;
        Ok(InterceptorChannels {
            requests,
            responses: self.responses_tx.clone(),
        })
    }

    async fn pending_incoming_htlcs(
        &self,
        peer: Option<PeerId>,
    ) -> Result<HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>>, LndError> {
        match peer {
            None => Ok(self.pending.clone()),
            Some(peer) => Ok(self
                .pending
                .get(&peer)
                .map(|htlcs| HashMap::from([(peer, htlcs.clone())]))
                .unwrap_or_default()),
        }
    }
}
