//! Management API behavior over a real listener.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::watch;

use bw_core::{CircuitKey, Limit, Mode, PeerId};
use bw_daemon::rpc::{HistoryResponse, InfoResponse, ListLimitsResponse};
use bw_daemon::server::{self, ApiState};
use bw_testkit::peer_from_byte;

use common::TestDaemon;

/// Serve the API for a running test daemon on an ephemeral port.
async fn serve_api(daemon: &TestDaemon) -> (String, watch::Sender<bool>) {
    let state = ApiState {
        dispatcher: daemon.dispatcher.clone(),
        store: daemon.store.clone(),
        client: Arc::clone(&daemon.client),
        aliases: Arc::new(Mutex::new(HashMap::new())),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::serve(listener, state, shutdown_rx));

    (address, shutdown_tx)
}

#[tokio::test]
async fn info_reports_identities() {
    let daemon = TestDaemon::start().await;
    let (address, _shutdown) = serve_api(&daemon).await;

    let info: InfoResponse = reqwest::get(format!("{address}/api/info"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(info.node_key, peer_from_byte(1).to_string());
    assert_eq!(info.node_alias, "mock");
    assert_eq!(info.node_version, "v1.0.0");
    assert!(!info.version.is_empty());

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn limit_round_trip_through_api() {
    let daemon = TestDaemon::start().await;
    let (address, _shutdown) = serve_api(&daemon).await;
    let http = reqwest::Client::new();
    let peer = peer_from_byte(2);

    let limit = Limit {
        max_hourly_rate: 120,
        max_pending: 3,
        mode: Mode::Queue,
    };
    let response = http
        .put(format!("{address}/api/limits/{peer}"))
        .json(&limit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let limits: ListLimitsResponse = http
        .get(format!("{address}/api/limits"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let row = limits
        .limits
        .iter()
        .find(|row| row.node == peer.to_string())
        .expect("peer row");
    assert_eq!(row.limit, limit);
    assert_eq!(row.alias, "alias-020000");

    // Applying the same update twice changes nothing.
    let response = http
        .put(format!("{address}/api/limits/{peer}"))
        .json(&limit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = http
        .delete(format!("{address}/api/limits/{peer}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let limits: ListLimitsResponse = http
        .get(format!("{address}/api/limits"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(limits
        .limits
        .iter()
        .all(|row| row.node != peer.to_string() || row.limit == limits.default_limit));

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn default_limit_endpoint_guards() {
    let daemon = TestDaemon::start().await;
    let (address, _shutdown) = serve_api(&daemon).await;
    let http = reqwest::Client::new();

    // The sentinel node is not addressable as a peer.
    let sentinel = PeerId::DEFAULT;
    let limit = Limit {
        max_hourly_rate: 10,
        max_pending: 1,
        mode: Mode::Fail,
    };
    let response = http
        .put(format!("{address}/api/limits/{sentinel}"))
        .json(&limit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = http
        .delete(format!("{address}/api/limits/{sentinel}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = http
        .put(format!("{address}/api/limits/not-hex"))
        .json(&limit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The dedicated endpoint does replace the default.
    let response = http
        .put(format!("{address}/api/limits/default"))
        .json(&limit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let limits: ListLimitsResponse = http
        .get(format!("{address}/api/limits"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(limits.default_limit, limit);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn history_scan_over_api() {
    let mut daemon = TestDaemon::start().await;
    let (address, _shutdown) = serve_api(&daemon).await;

    let history: HistoryResponse = reqwest::get(format!("{address}/api/history"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history.forwards.is_empty());

    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);
    daemon
        .resolve(CircuitKey::new(2, 5), CircuitKey::new(7, 0), true)
        .await;
    daemon
        .wait_for_state(peer_from_byte(2), |s| s.counts[0].success == 1)
        .await;

    let history: HistoryResponse = reqwest::get(format!("{address}/api/history"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.forwards.len(), 1);
    let forward = &history.forwards[0];
    assert!(forward.settled);
    assert_eq!(forward.incoming_channel, 2);
    assert_eq!(forward.incoming_htlc_index, 5);
    assert_eq!(forward.outgoing_peer.as_deref(), Some(peer_from_byte(7).to_string().as_str()));

    // A range entirely after the forward excludes it.
    let history: HistoryResponse = reqwest::get(format!(
        "{address}/api/history?start_ns={}",
        forward.add_time_ns + 1
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert!(history.forwards.is_empty());

    daemon.stop().await.unwrap();
}
