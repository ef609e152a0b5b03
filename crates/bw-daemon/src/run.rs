//! Daemon startup and supervision.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use bw_lnd::{LndClient, LndRestClient, StubLndClient};
use bw_store::{Store, DB_FILENAME};

use crate::config::{expand_path, DaemonArgs};
use crate::process::Dispatcher;
use crate::server::{self, ApiState};
use crate::DaemonError;

/// Run the daemon until SIGINT or the first unrecovered error.
pub async fn run_daemon(args: DaemonArgs) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "breakwater starting");

    let config_dir = expand_path(&args.configdir)?;
    std::fs::create_dir_all(&config_dir)?;

    let db_path = config_dir.join(DB_FILENAME);
    info!(path = %db_path.display(), "opening database");
    let store = Store::open(&db_path, args.fwdhistorylimit).await?;

    let client: Arc<dyn LndClient> = if args.stub {
        info!("running with a synthetic host");
        Arc::new(StubLndClient::new())
    } else {
        let (tls_cert_path, macaroon_path) = args.credential_paths()?;
        Arc::new(LndRestClient::new(
            &args.rpcserver,
            &tls_cert_path,
            &macaroon_path,
        )?)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (dispatcher, handle) = Dispatcher::new(Arc::clone(&client), store.clone(), shutdown_rx.clone());

    let state = ApiState {
        dispatcher: handle,
        store,
        client,
        aliases: Arc::new(Mutex::new(HashMap::new())),
    };
    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "management api listening");

    let mut tasks: JoinSet<Result<(), DaemonError>> = JoinSet::new();
    tasks.spawn(dispatcher.run());
    tasks.spawn(server::serve(listener, state, shutdown_rx));

    let mut outcome: Result<(), DaemonError> = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        Some(result) = tasks.join_next() => {
            outcome = flatten(result);
            if let Err(err) = &outcome {
                error!(error = %err, "task failed, shutting down");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(result) = tasks.join_next().await {
        let result = flatten(result);
        if outcome.is_ok() {
            outcome = result;
        }
    }

    if outcome.is_ok() {
        info!("breakwater stopped");
    }
    outcome.map_err(Into::into)
}

fn flatten(
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    result.map_err(|e| DaemonError::Task(e.to_string()))?
}
