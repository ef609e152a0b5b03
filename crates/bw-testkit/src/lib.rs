//! Test support for the breakwater HTLC admission controller.
//!
//! [`MockLndClient`] is a channel-driven fake of the host node: tests inject
//! intercept requests and resolution events through [`MockLndHandles`] and
//! read the daemon's interceptor responses back out.

#![forbid(unsafe_code)]

mod mock;

pub use mock::*;

use std::future::Future;
use std::time::Duration;

/// Upper bound applied to every awaited test step.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Await a future under [`TEST_TIMEOUT`], panicking if it does not finish.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("test step timed out")
}

/// Install a compact tracing subscriber for test debugging. Safe to call
/// from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
