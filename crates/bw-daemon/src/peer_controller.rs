//! Per-peer admission state machine.
//!
//! One controller task runs per peer. It owns the peer's token bucket,
//! pending-HTLC set, FIFO hold queue, and counters, and is driven entirely
//! through its mailbox plus the reservation timer for the queue head.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use bw_core::{CircuitKey, HtlcInfo, InFlightHtlc, Limit, Mode, PeerId};
use bw_lnd::LndClient;
use bw_ratelimit::{CounterKind, EventCounters, RateCounts, Reservation, TokenBucket};
use bw_store::Store;

use crate::DaemonError;

/// Counter windows kept per peer.
pub const COUNTER_INTERVALS: [Duration; 2] = [
    Duration::from_secs(3600),
    Duration::from_secs(24 * 3600),
];

/// Token bucket capacity.
pub const DEFAULT_BURST_SIZE: u32 = 10;

/// Minimum time between capacity resyncs against the host.
const SYNC_INTERVAL: Duration = Duration::from_secs(60);

const MAILBOX_SIZE: usize = 64;

/// An intercepted HTLC routed to its peer's controller. The response sink
/// must be fired exactly once; while the HTLC is held it travels inside the
/// queue entry.
pub struct PeerInterceptEvent {
    pub circuit: CircuitKey,
    pub incoming_msat: u64,
    pub outgoing_msat: u64,

    /// The peer opened the incoming channel.
    pub peer_initiated: bool,

    pub response: oneshot::Sender<bool>,
}

/// A resolution routed to the incoming peer's controller.
pub struct PeerResolvedEvent {
    pub incoming_circuit: CircuitKey,
    pub outgoing_circuit: CircuitKey,
    pub settled: bool,
    pub timestamp: DateTime<Utc>,

    /// Peer on the outgoing side, when attributable; recorded in history.
    pub outgoing_peer: Option<PeerId>,
}

/// Point-in-time controller state for management listings.
#[derive(Clone, Debug, Default)]
pub struct PeerState {
    /// One entry per [`COUNTER_INTERVALS`] window.
    pub counts: Vec<RateCounts>,
    pub queue_len: usize,
    pub pending_count: usize,
}

enum PeerEvent {
    Intercept(PeerInterceptEvent),
    Resolved(PeerResolvedEvent),
    UpdateLimit(Limit),
    Query(oneshot::Sender<PeerState>),
}

/// Mailbox handle to a running peer controller.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<PeerEvent>,
}

impl PeerHandle {
    pub async fn intercept(&self, event: PeerInterceptEvent) -> Result<(), DaemonError> {
        self.tx
            .send(PeerEvent::Intercept(event))
            .await
            .map_err(|_| DaemonError::ControllerGone)
    }

    pub async fn resolved(&self, event: PeerResolvedEvent) -> Result<(), DaemonError> {
        self.tx
            .send(PeerEvent::Resolved(event))
            .await
            .map_err(|_| DaemonError::ControllerGone)
    }

    pub async fn update_limit(&self, limit: Limit) -> Result<(), DaemonError> {
        self.tx
            .send(PeerEvent::UpdateLimit(limit))
            .await
            .map_err(|_| DaemonError::ControllerGone)
    }

    pub async fn query(&self) -> Result<PeerState, DaemonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PeerEvent::Query(reply_tx))
            .await
            .map_err(|_| DaemonError::ControllerGone)?;
        reply_rx.await.map_err(|_| DaemonError::ControllerGone)
    }
}

/// The admission state machine for one peer.
pub struct PeerController {
    peer: PeerId,
    limit: Limit,
    bucket: TokenBucket,
    pending: HashMap<CircuitKey, InFlightHtlc>,
    queue: VecDeque<PeerInterceptEvent>,
    counters: Vec<EventCounters>,
    last_sync: Instant,

    store: Store,
    client: Arc<dyn LndClient>,
    rx: mpsc::Receiver<PeerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl PeerController {
    pub fn new(
        peer: PeerId,
        limit: Limit,
        pending: HashMap<CircuitKey, InFlightHtlc>,
        burst_size: u32,
        store: Store,
        client: Arc<dyn LndClient>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, PeerHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);

        info!(
            max_hourly_rate = limit.max_hourly_rate,
            max_pending = limit.max_pending,
            mode = %limit.mode,
            pending = pending.len(),
            "peer controller initialized"
        );

        let controller = Self {
            peer,
            limit,
            bucket: TokenBucket::per_hour(limit.max_hourly_rate, burst_size),
            pending,
            queue: VecDeque::new(),
            counters: COUNTER_INTERVALS
                .iter()
                .map(|interval| EventCounters::new(*interval))
                .collect(),
            last_sync: Instant::now(),
            store,
            client,
            rx,
            shutdown,
        };

        (controller, PeerHandle { tx })
    }

    pub async fn run(mut self) -> Result<(), DaemonError> {
        // Reservation for the queue head; present only while the queue is
        // non-empty and a pending slot is free.
        let mut reservation: Option<Reservation> = None;

        loop {
            let mut new_htlc_allowed = self.new_htlc_allowed();

            // When stuck at capacity for a while, check with the host in
            // case a resolution was missed.
            if !new_htlc_allowed && self.last_sync.elapsed() > SYNC_INTERVAL {
                self.resync().await?;
                new_htlc_allowed = self.new_htlc_allowed();
            }

            if !self.queue.is_empty() && new_htlc_allowed && reservation.is_none() {
                reservation = Some(self.bucket.reserve());
            }

            let dequeue_at = reservation.as_ref().map_or_else(
                tokio::time::Instant::now,
                |r| tokio::time::Instant::from_std(r.ready_at()),
            );

            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(PeerEvent::Intercept(intercept)) => self.handle_intercept(intercept),
                    Some(PeerEvent::Resolved(resolved)) => self.handle_resolved(resolved).await?,
                    Some(PeerEvent::UpdateLimit(limit)) => self.apply_limit(limit),
                    Some(PeerEvent::Query(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => return Ok(()),
                },

                () = tokio::time::sleep_until(dequeue_at), if reservation.is_some() => {
                    self.dequeue();
                    reservation = None;
                }

                _ = self.shutdown.changed() => return Ok(()),
            }
        }
    }

    fn new_htlc_allowed(&self) -> bool {
        self.limit.max_pending == 0 || (self.pending.len() as i64) < self.limit.max_pending
    }

    fn handle_intercept(&mut self, event: PeerInterceptEvent) {
        let circuit = event.circuit;

        // Startup rehydration seeds pending HTLCs whose intercepts may still
        // arrive; an idempotent resume keeps counters and the bucket intact.
        if self.pending.contains_key(&circuit) {
            debug!(channel = circuit.channel, htlc = circuit.htlc, "replayed intercept");
            respond(event.response, true);
            return;
        }

        if self.limit.mode == Mode::Block {
            info!(channel = circuit.channel, htlc = circuit.htlc, "htlc blocked");
            respond(event.response, false);
            self.incr_counters(CounterKind::Reject);
            return;
        }

        let over_limit = !self.queue.is_empty() || !self.new_htlc_allowed();
        if over_limit || !self.bucket.allow() {
            let queue_eligible = self.limit.mode == Mode::Queue
                || (self.limit.mode == Mode::QueuePeerInitiated && event.peer_initiated);

            if queue_eligible {
                self.queue.push_back(event);
                info!(
                    channel = circuit.channel,
                    htlc = circuit.htlc,
                    queue_len = self.queue.len(),
                    "htlc queued"
                );
            } else {
                info!(
                    channel = circuit.channel,
                    htlc = circuit.htlc,
                    pending = self.pending.len(),
                    "htlc rejected"
                );
                respond(event.response, false);
                self.incr_counters(CounterKind::Reject);
            }
            return;
        }

        // Capacity and a token are available; allow() already consumed it.
        self.forward(event);
    }

    fn dequeue(&mut self) {
        if let Some(event) = self.queue.pop_front() {
            self.forward(event);
        }
    }

    fn forward(&mut self, event: PeerInterceptEvent) {
        self.pending.insert(
            event.circuit,
            InFlightHtlc {
                add_time: Some(Utc::now()),
                incoming_msat: event.incoming_msat,
                outgoing_msat: event.outgoing_msat,
            },
        );

        respond(event.response, true);
        info!(
            channel = event.circuit.channel,
            htlc = event.circuit.htlc,
            pending = self.pending.len(),
            "htlc forwarded"
        );
    }

    async fn handle_resolved(&mut self, event: PeerResolvedEvent) -> Result<(), DaemonError> {
        // Events also arrive for HTLCs we failed; those are not tracked.
        let Some(in_flight) = self.pending.remove(&event.incoming_circuit) else {
            debug!(
                channel = event.incoming_circuit.channel,
                htlc = event.incoming_circuit.htlc,
                "resolution for untracked htlc"
            );
            return Ok(());
        };

        self.incr_counters(if event.settled {
            CounterKind::Success
        } else {
            CounterKind::Fail
        });

        // HTLCs inherited at startup carry no add time and are not recorded.
        if let Some(add_time) = in_flight.add_time {
            self.store
                .record_htlc_resolution(HtlcInfo {
                    add_time,
                    resolve_time: event.timestamp,
                    settled: event.settled,
                    incoming_msat: in_flight.incoming_msat,
                    outgoing_msat: in_flight.outgoing_msat,
                    incoming_peer: self.peer,
                    outgoing_peer: event.outgoing_peer,
                    incoming_circuit: event.incoming_circuit,
                    outgoing_circuit: event.outgoing_circuit,
                })
                .await?;
        }

        info!(
            channel = event.incoming_circuit.channel,
            htlc = event.incoming_circuit.htlc,
            settled = event.settled,
            pending = self.pending.len(),
            "htlc resolved"
        );
        Ok(())
    }

    fn apply_limit(&mut self, limit: Limit) {
        self.limit = limit;
        self.bucket.set_rate_per_hour(limit.max_hourly_rate);

        info!(
            max_hourly_rate = limit.max_hourly_rate,
            max_pending = limit.max_pending,
            mode = %limit.mode,
            "limit updated"
        );
    }

    fn snapshot(&mut self) -> PeerState {
        PeerState {
            counts: self.counters.iter_mut().map(EventCounters::rates).collect(),
            queue_len: self.queue.len(),
            pending_count: self.pending.len(),
        }
    }

    fn incr_counters(&mut self, kind: CounterKind) {
        for counter in &mut self.counters {
            counter.incr(kind);
        }
    }

    /// Drop pending entries the host no longer reports. Lost resolutions do
    /// not touch the counters.
    async fn resync(&mut self) -> Result<(), DaemonError> {
        self.last_sync = Instant::now();

        let mut all = self
            .client
            .pending_incoming_htlcs(Some(self.peer))
            .await
            .map_err(DaemonError::Lnd)?;
        let live = all.remove(&self.peer).unwrap_or_default();

        let before = self.pending.len();
        self.pending.retain(|key, _| live.contains_key(key));

        let removed = before - self.pending.len();
        if removed > 0 {
            info!(removed, "dropped pending htlcs with lost resolutions");
        }
        Ok(())
    }
}

fn respond(sink: oneshot::Sender<bool>, resume: bool) {
    // A dropped receiver means the interceptor pump is shutting down; the
    // stream closes without a response and the host fails the htlc.
    if sink.send(resume).is_err() {
        debug!("interceptor response dropped");
    }
}
