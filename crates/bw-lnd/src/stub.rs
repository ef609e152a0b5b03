//! Synthetic host for demo and development runs.
//!
//! Builds a fixed population of peers with derived keys and channels, then
//! generates random HTLC traffic against the interceptor. Accepted HTLCs
//! resolve after a per-peer delay profile with a per-peer settlement
//! probability, so the daemon sees realistic mixes of successes and
//! failures without a node attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use async_trait::async_trait;

use bw_core::{CircuitKey, InFlightHtlc, PeerId, PEER_ID_LEN};

use crate::{
    Channel, InterceptResponse, InterceptedHtlc, InterceptorChannels, LndClient, LndError,
    NodeInfo, ResolvedHtlc,
};

const STUB_ALIASES: [&str; 21] = [
    "SatStream",
    "ThunderPath",
    "⚡ free routing ⚡",
    "nodemaster.io",
    "RoutingRanch",
    "zero-base-fee",
    "LiquidityLlama",
    "plebnode",
    "StackingSats24",
    "channel.surf",
    "HighFeeHenry",
    "windmill",
    "relay-one",
    "Magma",
    "TorOnlyNode",
    "YieldNode",
    "Ursa",
    "peppermint",
    "",
    "",
    "",
];

const STREAM_BUFFER: usize = 256;

struct StubPeer {
    alias: String,
    /// channel id → we are the initiator.
    channels: HashMap<u64, bool>,
}

struct StubInFlight {
    incoming_peer: PeerId,
    outgoing_circuit: CircuitKey,
    incoming_msat: u64,
    outgoing_msat: u64,
}

/// In-process fake of the host node.
pub struct StubLndClient {
    identity: PeerId,
    peers: HashMap<PeerId, StubPeer>,
    chan_map: HashMap<u64, PeerId>,
    pending: Arc<Mutex<HashMap<CircuitKey, StubInFlight>>>,

    event_tx: mpsc::Sender<ResolvedHtlc>,
    event_rx: Mutex<Option<mpsc::Receiver<ResolvedHtlc>>>,
    request_rx: Mutex<Option<mpsc::Receiver<InterceptedHtlc>>>,
}

impl StubLndClient {
    /// Build the synthetic topology and start the traffic generators.
    #[must_use]
    pub fn new() -> Self {
        let mut peers = HashMap::new();
        let mut chan_map = HashMap::new();

        let mut chan_id: u64 = 1;
        for (index, alias) in STUB_ALIASES.iter().enumerate() {
            let key = derive_peer_key(index as u8);

            let channel_count = usize::from(key.as_bytes()[5] % 5) + 1;
            let mut channels = HashMap::new();
            for offset in 0..channel_count {
                let initiator = key.as_bytes()[6 + offset] % 2 == 0;
                channels.insert(chan_id, initiator);
                chan_map.insert(chan_id, key);
                chan_id += 1;
            }

            peers.insert(
                key,
                StubPeer {
                    alias: (*alias).to_string(),
                    channels,
                },
            );
        }

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(STREAM_BUFFER);
        let (request_tx, request_rx) = mpsc::channel(STREAM_BUFFER);

        let outgoing_index = Arc::new(AtomicU64::new(0));

        // Every peer except the first generates traffic; the quiet one shows
        // up in listings with idle counters.
        for (peer_key, peer) in peers.iter().skip(1) {
            let own_channels: Vec<u64> = peer.channels.keys().copied().collect();
            let outgoing_channels: Vec<u64> = chan_map
                .iter()
                .filter(|(_, owner)| *owner != peer_key)
                .map(|(channel, _)| *channel)
                .collect();

            tokio::spawn(generate_htlcs(
                *peer_key,
                own_channels,
                outgoing_channels,
                Arc::clone(&pending),
                Arc::clone(&outgoing_index),
                request_tx.clone(),
            ));
        }

        Self {
            identity: derive_peer_key(0xff),
            peers,
            chan_map,
            pending,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            request_rx: Mutex::new(Some(request_rx)),
        }
    }
}

impl Default for StubLndClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LndClient for StubLndClient {
    async fn get_info(&self) -> Result<NodeInfo, LndError> {
        Ok(NodeInfo {
            node_key: self.identity,
            alias: "stub".to_string(),
            version: "v1.0.0".to_string(),
        })
    }

    async fn list_channels(&self) -> Result<HashMap<u64, Channel>, LndError> {
        let mut channels = HashMap::new();
        for (key, peer) in &self.peers {
            for (channel, initiator) in &peer.channels {
                channels.insert(
                    *channel,
                    Channel {
                        peer: *key,
                        initiator: *initiator,
                    },
                );
            }
        }
        Ok(channels)
    }

    async fn list_closed_channels(&self) -> Result<HashMap<u64, Channel>, LndError> {
        Ok(HashMap::new())
    }

    async fn get_node_alias(&self, peer: PeerId) -> Result<Option<String>, LndError> {
        Ok(self.peers.get(&peer).map(|p| p.alias.clone()))
    }

    async fn subscribe_htlc_events(&self) -> Result<mpsc::Receiver<ResolvedHtlc>, LndError> {
        self.event_rx.lock().take().ok_or(LndError::StreamTaken)
    }

    async fn htlc_interceptor(&self) -> Result<InterceptorChannels, LndError> {
        let requests = self.request_rx.lock().take().ok_or(LndError::StreamTaken)?;

        let (response_tx, mut response_rx) = mpsc::channel::<InterceptResponse>(STREAM_BUFFER);
        let pending = Arc::clone(&self.pending);
        let event_tx = self.event_tx.clone();
        let chan_map = self.chan_map.clone();

        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                tokio::spawn(resolve_htlc(
                    response,
                    Arc::clone(&pending),
                    event_tx.clone(),
                    chan_map.clone(),
                ));
            }
        });

        Ok(InterceptorChannels {
            requests,
            responses: response_tx,
        })
    }

    async fn pending_incoming_htlcs(
        &self,
        peer: Option<PeerId>,
    ) -> Result<HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>>, LndError> {
        let mut all: HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>> = HashMap::new();

        for (key, in_flight) in self.pending.lock().iter() {
            if peer.is_some_and(|p| p != in_flight.incoming_peer) {
                continue;
            }

            all.entry(in_flight.incoming_peer).or_default().insert(
                *key,
                InFlightHtlc {
                    add_time: None,
                    incoming_msat: in_flight.incoming_msat,
                    outgoing_msat: in_flight.outgoing_msat,
                },
            );
        }

        Ok(all)
    }
}

fn derive_peer_key(index: u8) -> PeerId {
    let digest = Sha256::digest([index]);
    let mut bytes = [0u8; PEER_ID_LEN];
    bytes[0] = 0x02;
    bytes[1..].copy_from_slice(&digest);
    PeerId::new(bytes)
}

/// Delay range in milliseconds for a peer's traffic and resolution profile.
fn delay_range(profile: u8) -> (u64, u64) {
    match profile % 3 {
        0 => (100, 1_000),
        1 => (1_000, 5_000),
        _ => (5_000, 30_000),
    }
}

fn random_delay(profile: u8) -> Duration {
    let (min_ms, max_ms) = delay_range(profile);
    let millis = rand::thread_rng().gen_range(min_ms..max_ms);
    Duration::from_millis(millis)
}

async fn generate_htlcs(
    peer: PeerId,
    own_channels: Vec<u64>,
    outgoing_channels: Vec<u64>,
    pending: Arc<Mutex<HashMap<CircuitKey, StubInFlight>>>,
    outgoing_index: Arc<AtomicU64>,
    request_tx: mpsc::Sender<InterceptedHtlc>,
) {
    let profile = peer.as_bytes()[5];
    let mut htlc_id: u64 = 0;

    loop {
        let (incoming_circuit, outgoing_circuit, incoming_msat, outgoing_msat) = {
            let mut rng = rand::thread_rng();

            let channel_in = own_channels[rng.gen_range(0..own_channels.len())];
            let channel_out = outgoing_channels[rng.gen_range(0..outgoing_channels.len())];

            // Non-zero incoming amount; the outgoing amount keeps a fee margin
            // but never drops to zero.
            let incoming_msat: u64 = rng.gen_range(1..100_000_000);
            let mut outgoing_msat = incoming_msat / 2;
            if outgoing_msat == 0 {
                outgoing_msat = incoming_msat;
            }

            (
                CircuitKey::new(channel_in, htlc_id),
                CircuitKey::new(channel_out, outgoing_index.fetch_add(1, Ordering::Relaxed)),
                incoming_msat,
                outgoing_msat,
            )
        };

        pending.lock().insert(
            incoming_circuit,
            StubInFlight {
                incoming_peer: peer,
                outgoing_circuit,
                incoming_msat,
                outgoing_msat,
            },
        );

        let request = InterceptedHtlc {
            incoming_circuit,
            incoming_msat,
            outgoing_msat,
        };
        if request_tx.send(request).await.is_err() {
            return;
        }

        htlc_id += 1;
        tokio::time::sleep(random_delay(profile)).await;
    }
}

async fn resolve_htlc(
    response: InterceptResponse,
    pending: Arc<Mutex<HashMap<CircuitKey, StubInFlight>>>,
    event_tx: mpsc::Sender<ResolvedHtlc>,
    chan_map: HashMap<u64, PeerId>,
) {
    let key = response.incoming_circuit;

    if !response.resume {
        let outgoing_circuit = pending
            .lock()
            .remove(&key)
            .map_or(CircuitKey::new(0, 0), |h| h.outgoing_circuit);

        let _ = event_tx
            .send(ResolvedHtlc {
                incoming_circuit: key,
                outgoing_circuit,
                settled: false,
                timestamp: Utc::now(),
            })
            .await;
        return;
    }

    let Some(owner) = chan_map.get(&key.channel).copied() else {
        debug!(channel = key.channel, "response for unknown stub channel");
        return;
    };

    tokio::time::sleep(random_delay(owner.as_bytes()[6])).await;

    // Settlement probability by peer profile.
    let settled_percent: u64 = match owner.as_bytes()[7] % 3 {
        0 => 5,
        1 => 50,
        _ => 90,
    };
    let settled = rand::thread_rng().gen_range(0..100) < settled_percent;

    let outgoing_circuit = pending
        .lock()
        .remove(&key)
        .map_or(CircuitKey::new(0, 0), |h| h.outgoing_circuit);

    let _ = event_tx
        .send(ResolvedHtlc {
            incoming_circuit: key,
            outgoing_circuit,
            settled,
            timestamp: Utc::now(),
        })
        .await;
}
