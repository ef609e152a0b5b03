//! Shared setup for daemon integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use bw_core::{CircuitKey, PeerId};
use bw_daemon::peer_controller::PeerState;
use bw_daemon::process::{Dispatcher, DispatcherHandle};
use bw_daemon::DaemonError;
use bw_lnd::{InterceptResponse, InterceptedHtlc, LndClient, ResolvedHtlc};
use bw_store::Store;
use bw_testkit::{within, MockLndClient, MockLndHandles};

/// A dispatcher wired to a mock host, plus everything a test needs to drive
/// and observe it.
pub struct TestDaemon {
    pub handles: MockLndHandles,
    pub dispatcher: DispatcherHandle,
    pub store: Store,
    pub client: Arc<dyn LndClient>,

    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), DaemonError>>,
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::start_with(bw_daemon::peer_controller::DEFAULT_BURST_SIZE, |c| c).await
    }

    pub async fn start_with(
        burst_size: u32,
        configure: impl FnOnce(MockLndClient) -> MockLndClient,
    ) -> Self {
        bw_testkit::init_tracing();

        let (client, handles) = MockLndClient::new();
        let client: Arc<dyn LndClient> = Arc::new(configure(client));

        let store = Store::open_in_memory(1000).await.expect("open store");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (dispatcher, handle) =
            Dispatcher::new(Arc::clone(&client), store.clone(), shutdown_rx);
        let dispatcher = dispatcher.with_burst(burst_size);
        let task = tokio::spawn(dispatcher.run());

        Self {
            handles,
            dispatcher: handle,
            store,
            client,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Inject an intercept for `(channel, htlc)`.
    pub async fn intercept(&self, channel: u64, htlc: u64) {
        self.handles
            .intercepts
            .send(InterceptedHtlc {
                incoming_circuit: CircuitKey::new(channel, htlc),
                incoming_msat: 100_000,
                outgoing_msat: 99_000,
            })
            .await
            .expect("interceptor stream open");
    }

    /// Next admission decision from the daemon.
    pub async fn expect_response(&mut self) -> InterceptResponse {
        within(self.handles.responses.recv())
            .await
            .expect("interceptor response")
    }

    /// Inject a resolution event.
    pub async fn resolve(&self, incoming: CircuitKey, outgoing: CircuitKey, settled: bool) {
        self.handles
            .events
            .send(ResolvedHtlc {
                incoming_circuit: incoming,
                outgoing_circuit: outgoing,
                settled,
                timestamp: Utc::now(),
            })
            .await
            .expect("event stream open");
    }

    /// Poll the dispatcher until `predicate` holds for `peer`'s state.
    pub async fn wait_for_state(
        &self,
        peer: PeerId,
        predicate: impl Fn(&PeerState) -> bool,
    ) -> PeerState {
        within(async {
            loop {
                let states = self.dispatcher.query_state().await.expect("query state");
                if let Some(state) = states.get(&peer) {
                    if predicate(state) {
                        return state.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
    }

    /// Stop the daemon and return its exit result.
    pub async fn stop(self) -> Result<(), DaemonError> {
        let _ = self.shutdown.send(true);
        within(self.task).await.expect("dispatcher task")
    }

    /// Wait for the dispatcher to exit on its own (fatal error tests).
    pub async fn join(self) -> Result<(), DaemonError> {
        within(self.task).await.expect("dispatcher task")
    }
}
