//! The dispatcher: event routing and configuration fan-out.
//!
//! A single task owns the channel and alias caches, the limits snapshot,
//! and the registry of peer controllers. Host stream pumps, the peer
//! refresh loop, and all controller tasks are spawned into one `JoinSet`
//! so the first failure tears the whole group down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use bw_core::{CircuitKey, InFlightHtlc, Limit, Limits, PeerId};
use bw_lnd::{Channel, InterceptResponse, InterceptedHtlc, InterceptorChannels, LndClient, ResolvedHtlc};
use bw_store::{Store, StoreError};

use crate::peer_controller::{
    PeerController, PeerHandle, PeerInterceptEvent, PeerResolvedEvent, PeerState,
    DEFAULT_BURST_SIZE,
};
use crate::DaemonError;

/// How often the host's channel list is polled for unseen peers.
const PEER_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const MAILBOX_SIZE: usize = 64;

enum DispatcherEvent {
    Intercept(InterceptedHtlc, oneshot::Sender<bool>),
    Resolved(ResolvedHtlc),
    UpdateLimit {
        peer: Option<PeerId>,
        limit: Option<Limit>,
        reply: oneshot::Sender<Result<(), DaemonError>>,
    },
    QueryState {
        reply: oneshot::Sender<HashMap<PeerId, PeerState>>,
    },
    NewPeer(PeerId),
}

/// Mailbox handle to the dispatcher, shared by the management API.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatcherEvent>,
}

impl DispatcherHandle {
    /// Change a limit. `peer = None` addresses the default; `limit = None`
    /// clears. Clearing the default is rejected. The store is written before
    /// this returns success.
    pub async fn update_limit(
        &self,
        peer: Option<PeerId>,
        limit: Option<Limit>,
    ) -> Result<(), DaemonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatcherEvent::UpdateLimit {
                peer,
                limit,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DaemonError::DispatcherGone)?;
        reply_rx.await.map_err(|_| DaemonError::DispatcherGone)?
    }

    /// Live state of every peer controller.
    pub async fn query_state(&self) -> Result<HashMap<PeerId, PeerState>, DaemonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatcherEvent::QueryState { reply: reply_tx })
            .await
            .map_err(|_| DaemonError::DispatcherGone)?;
        reply_rx.await.map_err(|_| DaemonError::DispatcherGone)
    }
}

/// Routes host events to peer controllers and serialises configuration.
pub struct Dispatcher {
    client: Arc<dyn LndClient>,
    store: Store,
    limits: Limits,
    burst_size: u32,

    chan_map: HashMap<u64, Channel>,
    alias_map: HashMap<PeerId, String>,
    peer_ctrls: HashMap<PeerId, PeerHandle>,

    tx: mpsc::Sender<DispatcherEvent>,
    rx: mpsc::Receiver<DispatcherEvent>,
    shutdown: watch::Receiver<bool>,
    tasks: JoinSet<Result<(), DaemonError>>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn LndClient>,
        store: Store,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);

        let dispatcher = Self {
            client,
            store,
            limits: Limits::default(),
            burst_size: DEFAULT_BURST_SIZE,
            chan_map: HashMap::new(),
            alias_map: HashMap::new(),
            peer_ctrls: HashMap::new(),
            tx: tx.clone(),
            rx,
            shutdown,
            tasks: JoinSet::new(),
        };

        (dispatcher, DispatcherHandle { tx })
    }

    /// Override the token bucket burst size. Used by tests to tighten rate
    /// limit behavior.
    #[must_use]
    pub fn with_burst(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }

    pub async fn run(mut self) -> Result<(), DaemonError> {
        self.limits = self.store.get_limits().await?;

        let identity = self.client.get_info().await?;
        info!(node = %identity.node_key, alias = %identity.alias, "connected to host node");

        let events = self.client.subscribe_htlc_events().await?;
        let interceptor = self.client.htlc_interceptor().await?;
        info!("interceptor and event streams registered");

        self.tasks
            .spawn(pump_events(events, self.tx.clone(), self.shutdown.clone()));
        self.tasks.spawn(pump_interceptor(
            interceptor,
            self.tx.clone(),
            self.shutdown.clone(),
        ));
        self.tasks.spawn(refresh_peers(
            Arc::clone(&self.client),
            self.tx.clone(),
            self.shutdown.clone(),
        ));

        // Take over HTLCs that were already pending before we attached, so
        // capacity accounting starts out correct.
        let pending = self.client.pending_incoming_htlcs(None).await?;
        let mut pending_per_peer: HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>> =
            HashMap::new();
        for (peer, htlcs) in pending {
            // Resolve through the channel cache so unknown channels fail
            // loudly here rather than on the first event.
            for key in htlcs.keys() {
                self.channel_info(key.channel).await?;
            }
            pending_per_peer.entry(peer).or_default().extend(htlcs);
        }
        for (peer, htlcs) in pending_per_peer {
            self.create_controller(peer, htlcs).await;
        }

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => return Ok(()),
                },

                Some(result) = self.tasks.join_next() => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return Err(err),
                        Err(err) => return Err(DaemonError::Task(err.to_string())),
                    }
                }

                _ = self.shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn handle_event(&mut self, event: DispatcherEvent) -> Result<(), DaemonError> {
        match event {
            DispatcherEvent::Intercept(request, response) => {
                let channel = self.channel_info(request.incoming_circuit.channel).await?;
                let ctrl = self.get_or_create_controller(channel.peer).await;

                ctrl.intercept(PeerInterceptEvent {
                    circuit: request.incoming_circuit,
                    incoming_msat: request.incoming_msat,
                    outgoing_msat: request.outgoing_msat,
                    peer_initiated: !channel.initiator,
                    response,
                })
                .await?;
            }

            DispatcherEvent::Resolved(resolved) => {
                let channel = self.channel_info(resolved.incoming_circuit.channel).await?;

                // A zero outgoing channel means the htlc never made it to an
                // outgoing link; history records the peer as unknown.
                let outgoing_peer = if resolved.outgoing_circuit.channel == 0 {
                    None
                } else {
                    Some(
                        self.channel_info(resolved.outgoing_circuit.channel)
                            .await?
                            .peer,
                    )
                };

                let ctrl = self.get_or_create_controller(channel.peer).await;
                ctrl.resolved(PeerResolvedEvent {
                    incoming_circuit: resolved.incoming_circuit,
                    outgoing_circuit: resolved.outgoing_circuit,
                    settled: resolved.settled,
                    timestamp: resolved.timestamp,
                    outgoing_peer,
                })
                .await?;
            }

            DispatcherEvent::UpdateLimit { peer, limit, reply } => {
                let result = self.apply_limit_update(peer, limit).await;
                let _ = reply.send(result);
            }

            DispatcherEvent::QueryState { reply } => {
                let mut states = HashMap::new();
                for (peer, ctrl) in &self.peer_ctrls {
                    if let Ok(state) = ctrl.query().await {
                        states.insert(*peer, state);
                    }
                }
                let _ = reply.send(states);
            }

            DispatcherEvent::NewPeer(peer) => {
                self.get_or_create_controller(peer).await;
            }
        }

        Ok(())
    }

    async fn apply_limit_update(
        &mut self,
        peer: Option<PeerId>,
        limit: Option<Limit>,
    ) -> Result<(), DaemonError> {
        match (peer, limit) {
            // Replace the default and push it to every peer without an
            // override.
            (None, Some(limit)) => {
                self.store.update_limit(PeerId::DEFAULT, limit).await?;
                self.limits.default = limit;

                for (node, ctrl) in &self.peer_ctrls {
                    if self.limits.per_peer.contains_key(node) {
                        continue;
                    }
                    ctrl.update_limit(limit).await?;
                }
            }

            (Some(peer), Some(limit)) => {
                if peer.is_default() {
                    return Err(DaemonError::InvalidRequest(
                        "the default limit has its own endpoint".to_string(),
                    ));
                }

                self.store.update_limit(peer, limit).await?;
                self.limits.per_peer.insert(peer, limit);

                if let Some(ctrl) = self.peer_ctrls.get(&peer) {
                    ctrl.update_limit(limit).await?;
                }
            }

            // Clearing drops the override; the controller falls back to the
            // default.
            (Some(peer), None) => {
                self.store.clear_limit(peer).await?;
                self.limits.per_peer.remove(&peer);

                if let Some(ctrl) = self.peer_ctrls.get(&peer) {
                    ctrl.update_limit(self.limits.default).await?;
                }
            }

            (None, None) => return Err(DaemonError::Store(StoreError::DefaultLimitProtected)),
        }

        Ok(())
    }

    /// Channel lookup with cache-miss refresh from open and closed channels.
    /// A channel that stays unknown is fatal: the event cannot be attributed
    /// to any peer.
    async fn channel_info(&mut self, channel: u64) -> Result<Channel, DaemonError> {
        if let Some(info) = self.chan_map.get(&channel) {
            return Ok(*info);
        }

        let open = self.client.list_channels().await?;
        self.chan_map.extend(open);

        if !self.chan_map.contains_key(&channel) {
            let closed = self.client.list_closed_channels().await?;
            self.chan_map.extend(closed);
        }

        self.chan_map
            .get(&channel)
            .copied()
            .ok_or(DaemonError::ChannelNotFound(channel))
    }

    async fn get_or_create_controller(&mut self, peer: PeerId) -> PeerHandle {
        if let Some(ctrl) = self.peer_ctrls.get(&peer) {
            return ctrl.clone();
        }
        self.create_controller(peer, HashMap::new()).await
    }

    async fn create_controller(
        &mut self,
        peer: PeerId,
        pending: HashMap<CircuitKey, InFlightHtlc>,
    ) -> PeerHandle {
        let limit = self.limits.get(&peer);
        let alias = self.node_alias(peer).await;

        let (controller, handle) = PeerController::new(
            peer,
            limit,
            pending,
            self.burst_size,
            self.store.clone(),
            Arc::clone(&self.client),
            self.shutdown.clone(),
        );

        let span = tracing::info_span!("peer", peer = %peer, alias = %alias);
        self.tasks.spawn(controller.run().instrument(span));
        self.peer_ctrls.insert(peer, handle.clone());

        handle
    }

    async fn node_alias(&mut self, peer: PeerId) -> String {
        if let Some(alias) = self.alias_map.get(&peer) {
            return alias.clone();
        }

        let alias = match self.client.get_node_alias(peer).await {
            Ok(Some(alias)) => alias,
            Ok(None) => String::new(),
            Err(err) => {
                // Transient lookup failures are not cached.
                warn!(error = %err, "cannot fetch node alias");
                return String::new();
            }
        };

        self.alias_map.insert(peer, alias.clone());
        alias
    }
}

async fn pump_events(
    mut events: mpsc::Receiver<ResolvedHtlc>,
    tx: mpsc::Sender<DispatcherEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if tx.send(DispatcherEvent::Resolved(event)).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Err(DaemonError::EventStreamClosed),
            },

            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn pump_interceptor(
    mut interceptor: InterceptorChannels,
    tx: mpsc::Sender<DispatcherEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            request = interceptor.requests.recv() => match request {
                Some(request) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if tx
                        .send(DispatcherEvent::Intercept(request, reply_tx))
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }

                    // Each request gets exactly one response, sent when its
                    // sink fires. A dropped sink means shutdown: the stream
                    // closes unanswered and the host fails the htlc.
                    let responses = interceptor.responses.clone();
                    tokio::spawn(async move {
                        if let Ok(resume) = reply_rx.await {
                            let _ = responses
                                .send(InterceptResponse {
                                    incoming_circuit: request.incoming_circuit,
                                    resume,
                                })
                                .await;
                        }
                    });
                }
                None => return Err(DaemonError::InterceptorStreamClosed),
            },

            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Poll the channel list so idle peers get controllers and show up in
/// management listings.
async fn refresh_peers(
    client: Arc<dyn LndClient>,
    tx: mpsc::Sender<DispatcherEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DaemonError> {
    let mut ticker = tokio::time::interval(PEER_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let channels = match client.list_channels().await {
                    Ok(channels) => channels,
                    Err(err) => {
                        warn!(error = %err, "peer refresh failed");
                        continue;
                    }
                };

                for channel in channels.values() {
                    if tx.send(DispatcherEvent::NewPeer(channel.peer)).await.is_err() {
                        return Ok(());
                    }
                }
            }

            _ = shutdown.changed() => return Ok(()),
        }
    }
}
