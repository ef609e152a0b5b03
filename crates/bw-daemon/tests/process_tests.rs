//! End-to-end admission behavior through the dispatcher and peer
//! controllers, driven by the mock host.

mod common;

use std::time::{Duration, Instant};

use bw_core::{CircuitKey, Limit, Mode};
use bw_daemon::DaemonError;
use bw_testkit::peer_from_byte;

use common::TestDaemon;

#[tokio::test]
async fn admit_then_settle() {
    let mut daemon = TestDaemon::start().await;
    let peer = peer_from_byte(2);

    daemon
        .dispatcher
        .update_limit(
            Some(peer),
            Some(Limit {
                max_hourly_rate: 60,
                max_pending: 1,
                mode: Mode::Fail,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(2, 5).await;
    let response = daemon.expect_response().await;
    assert_eq!(response.incoming_circuit, CircuitKey::new(2, 5));
    assert!(response.resume);

    daemon
        .resolve(CircuitKey::new(2, 5), CircuitKey::new(7, 0), true)
        .await;

    let state = daemon
        .wait_for_state(peer, |s| s.counts[0].success == 1)
        .await;
    assert_eq!(state.pending_count, 0);
    assert_eq!(state.counts[0].fail, 0);
    assert_eq!(state.counts[1].success, 1);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn admit_then_fail_downstream() {
    let mut daemon = TestDaemon::start().await;
    let peer = peer_from_byte(2);

    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);

    daemon
        .resolve(CircuitKey::new(2, 5), CircuitKey::new(7, 0), false)
        .await;

    let state = daemon.wait_for_state(peer, |s| s.counts[0].fail == 1).await;
    assert_eq!(state.pending_count, 0);
    assert_eq!(state.counts[0].success, 0);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn rate_limit_fail_mode() {
    let mut daemon = TestDaemon::start_with(2, |c| c).await;
    let peer = peer_from_byte(2);

    daemon
        .dispatcher
        .update_limit(
            None,
            Some(Limit {
                max_hourly_rate: 1800,
                max_pending: 0,
                mode: Mode::Fail,
            }),
        )
        .await
        .unwrap();

    // Two within the burst pass, the third hits the empty bucket.
    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);
    daemon.intercept(2, 6).await;
    assert!(daemon.expect_response().await.resume);

    daemon.intercept(2, 7).await;
    let response = daemon.expect_response().await;
    assert_eq!(response.incoming_circuit, CircuitKey::new(2, 7));
    assert!(!response.resume);

    let state = daemon
        .wait_for_state(peer, |s| s.counts[0].reject == 1)
        .await;
    assert_eq!(state.pending_count, 2);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn rate_limit_queue_mode_delays_release() {
    let mut daemon = TestDaemon::start_with(2, |c| c).await;

    daemon
        .dispatcher
        .update_limit(
            None,
            Some(Limit {
                max_hourly_rate: 1800,
                max_pending: 0,
                mode: Mode::Queue,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);
    daemon.intercept(2, 6).await;
    assert!(daemon.expect_response().await.resume);

    // The third is held until the bucket accrues a token (0.5/s).
    daemon.intercept(2, 7).await;
    let queued_at = Instant::now();

    let response = daemon.expect_response().await;
    assert_eq!(response.incoming_circuit, CircuitKey::new(2, 7));
    assert!(response.resume);
    assert!(queued_at.elapsed() >= Duration::from_secs(1));

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn queue_peer_initiated_holds_only_their_channels() {
    // Channel 3 was opened by us, so QUEUE_PEER_INITIATED degrades to FAIL.
    let mut daemon = TestDaemon::start_with(2, |c| c).await;

    daemon
        .dispatcher
        .update_limit(
            None,
            Some(Limit {
                max_hourly_rate: 0,
                max_pending: 1,
                mode: Mode::QueuePeerInitiated,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(3, 5).await;
    assert!(daemon.expect_response().await.resume);

    daemon.intercept(3, 6).await;
    let response = daemon.expect_response().await;
    assert_eq!(response.incoming_circuit, CircuitKey::new(3, 6));
    assert!(!response.resume);

    // Channel 2 is peer-initiated: the same pressure queues instead, and the
    // queued htlc is released once the slot frees up.
    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);
    daemon.intercept(2, 6).await;

    tokio::select! {
        response = daemon.expect_response() => {
            panic!("htlc should be queued, got {response:?}");
        }
        () = tokio::time::sleep(Duration::from_secs(1)) => {}
    }

    daemon
        .resolve(CircuitKey::new(2, 5), CircuitKey::new(7, 0), true)
        .await;
    let response = daemon.expect_response().await;
    assert_eq!(response.incoming_circuit, CircuitKey::new(2, 6));
    assert!(response.resume);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn max_pending_queue_mode_waits_for_slot() {
    let mut daemon = TestDaemon::start_with(2, |c| c).await;

    daemon
        .dispatcher
        .update_limit(
            None,
            Some(Limit {
                max_hourly_rate: 60,
                max_pending: 1,
                mode: Mode::Queue,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);

    daemon.intercept(2, 6).await;
    tokio::select! {
        response = daemon.expect_response() => {
            panic!("htlc should be queued, got {response:?}");
        }
        () = tokio::time::sleep(Duration::from_secs(1)) => {}
    }

    daemon
        .resolve(CircuitKey::new(2, 5), CircuitKey::new(7, 0), true)
        .await;
    let response = daemon.expect_response().await;
    assert_eq!(response.incoming_circuit, CircuitKey::new(2, 6));
    assert!(response.resume);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn block_mode_rejects_unconditionally() {
    let mut daemon = TestDaemon::start().await;
    let peer = peer_from_byte(2);

    daemon
        .dispatcher
        .update_limit(
            Some(peer),
            Some(Limit {
                max_hourly_rate: 0,
                max_pending: 0,
                mode: Mode::Block,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(2, 5).await;
    let response = daemon.expect_response().await;
    assert!(!response.resume);

    let state = daemon
        .wait_for_state(peer, |s| s.counts[0].reject == 1)
        .await;
    assert_eq!(state.pending_count, 0);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn rehydrated_htlc_replays_as_resume() {
    let peer = peer_from_byte(2);
    let key = CircuitKey::new(2, 5);

    let mut daemon =
        TestDaemon::start_with(10, move |client| client.with_pending(peer, &[key])).await;

    // The controller was seeded with the pending htlc at startup.
    daemon.wait_for_state(peer, |s| s.pending_count == 1).await;

    // Its intercept arrives late and must resume without touching counters
    // or the bucket.
    daemon.intercept(2, 5).await;
    let response = daemon.expect_response().await;
    assert!(response.resume);

    let state = daemon.wait_for_state(peer, |s| s.pending_count == 1).await;
    assert_eq!(state.counts[0].success, 0);
    assert_eq!(state.counts[0].reject, 0);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn clear_default_rejected_clear_peer_works() {
    let daemon = TestDaemon::start().await;
    let peer = peer_from_byte(2);

    assert!(daemon.dispatcher.update_limit(None, None).await.is_err());

    let limit = Limit {
        max_hourly_rate: 100,
        max_pending: 4,
        mode: Mode::Queue,
    };
    daemon
        .dispatcher
        .update_limit(Some(peer), Some(limit))
        .await
        .unwrap();
    assert_eq!(daemon.store.get_limits().await.unwrap().per_peer[&peer], limit);

    daemon.dispatcher.update_limit(Some(peer), None).await.unwrap();
    assert!(daemon
        .store
        .get_limits()
        .await
        .unwrap()
        .per_peer
        .is_empty());

    // Clearing a peer without an override stays a no-op success.
    daemon.dispatcher.update_limit(Some(peer), None).await.unwrap();

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn limit_update_applies_to_live_controller() {
    let mut daemon = TestDaemon::start().await;
    let peer = peer_from_byte(2);

    daemon
        .dispatcher
        .update_limit(
            None,
            Some(Limit {
                max_hourly_rate: 0,
                max_pending: 1,
                mode: Mode::Fail,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);
    daemon.intercept(2, 6).await;
    assert!(!daemon.expect_response().await.resume);

    // Lifting the pending cap takes effect for the next intercept.
    daemon
        .dispatcher
        .update_limit(
            Some(peer),
            Some(Limit {
                max_hourly_rate: 0,
                max_pending: 0,
                mode: Mode::Fail,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(2, 7).await;
    assert!(daemon.expect_response().await.resume);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_channel_is_fatal() {
    let daemon = TestDaemon::start().await;

    daemon.intercept(99, 1).await;

    let result = daemon.join().await;
    assert!(matches!(result, Err(DaemonError::ChannelNotFound(99))));
}

#[tokio::test]
async fn resolution_for_failed_htlc_is_ignored() {
    let mut daemon = TestDaemon::start().await;
    let peer = peer_from_byte(2);

    daemon
        .dispatcher
        .update_limit(
            Some(peer),
            Some(Limit {
                max_hourly_rate: 0,
                max_pending: 0,
                mode: Mode::Block,
            }),
        )
        .await
        .unwrap();

    daemon.intercept(2, 5).await;
    assert!(!daemon.expect_response().await.resume);

    // The host still reports the failure back; it must not count as a
    // forward outcome.
    daemon
        .resolve(CircuitKey::new(2, 5), CircuitKey::new(0, 0), false)
        .await;

    let state = daemon
        .wait_for_state(peer, |s| s.counts[0].reject == 1)
        .await;
    assert_eq!(state.counts[0].fail, 0);
    assert_eq!(state.counts[0].success, 0);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn settled_forward_lands_in_history() {
    let mut daemon = TestDaemon::start().await;

    daemon.intercept(2, 5).await;
    assert!(daemon.expect_response().await.resume);
    daemon
        .resolve(CircuitKey::new(2, 5), CircuitKey::new(7, 0), true)
        .await;

    daemon
        .wait_for_state(peer_from_byte(2), |s| s.counts[0].success == 1)
        .await;

    let forwards = daemon.store.list_forwarding_history(None, None).await.unwrap();
    assert_eq!(forwards.len(), 1);
    let forward = &forwards[0];
    assert_eq!(forward.incoming_circuit, CircuitKey::new(2, 5));
    assert_eq!(forward.outgoing_circuit, CircuitKey::new(7, 0));
    assert_eq!(forward.incoming_peer, peer_from_byte(2));
    assert_eq!(forward.outgoing_peer, Some(peer_from_byte(7)));
    assert!(forward.settled);
    assert_eq!(forward.incoming_msat, 100_000);

    daemon.stop().await.unwrap();
}
