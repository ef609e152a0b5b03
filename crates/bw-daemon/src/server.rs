//! Management API.
//!
//! A small JSON-over-HTTP surface for operators and the CLI: node info,
//! limit management, live counters, and the forwarding history scan. Limit
//! mutations are serialised through the dispatcher so the store and the
//! controllers never disagree.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use bw_core::{Limit, PeerId};
use bw_lnd::LndClient;
use bw_store::{Store, StoreError};

use crate::process::DispatcherHandle;
use crate::rpc::{ErrorResponse, Forward, HistoryResponse, InfoResponse, ListLimitsResponse, NodeLimit};
use crate::DaemonError;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: DispatcherHandle,
    pub store: Store,
    pub client: Arc<dyn LndClient>,

    /// Alias cache read by API tasks; node-not-found is cached as an empty
    /// string.
    pub aliases: Arc<Mutex<HashMap<PeerId, String>>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/info", get(get_info))
        .route("/api/limits", get(list_limits))
        .route("/api/limits/default", put(update_default_limit))
        .route("/api/limits/{node}", put(update_limit).delete(clear_limit))
        .route("/api/history", get(list_history))
        .with_state(state)
}

/// Serve the management API until shutdown fires.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DaemonError> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| DaemonError::Api(e.to_string()))
}

async fn get_info(State(state): State<ApiState>) -> Result<Json<InfoResponse>, ApiError> {
    let info = state
        .client
        .get_info()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(InfoResponse {
        node_key: info.node_key.to_string(),
        node_alias: info.alias,
        node_version: info.version,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

async fn list_limits(State(state): State<ApiState>) -> Result<Json<ListLimitsResponse>, ApiError> {
    let limits = state.store.get_limits().await?;
    let mut states = state.dispatcher.query_state().await?;

    // Peers with an override and peers with live controllers, in stable
    // key order.
    let nodes: BTreeSet<PeerId> = limits
        .per_peer
        .keys()
        .chain(states.keys())
        .copied()
        .collect();

    let mut rows = Vec::with_capacity(nodes.len());
    for node in nodes {
        let peer_state = states.remove(&node).unwrap_or_default();
        let alias = node_alias(&state, node).await?;

        rows.push(NodeLimit {
            node: node.to_string(),
            alias,
            limit: limits.get(&node),
            counter_1h: peer_state.counts.first().copied().unwrap_or_default(),
            counter_24h: peer_state.counts.get(1).copied().unwrap_or_default(),
            queue_len: peer_state.queue_len,
            pending_htlc_count: peer_state.pending_count,
        });
    }

    Ok(Json(ListLimitsResponse {
        default_limit: limits.default,
        limits: rows,
    }))
}

async fn update_limit(
    State(state): State<ApiState>,
    Path(node): Path<String>,
    Json(limit): Json<Limit>,
) -> Result<StatusCode, ApiError> {
    let peer = parse_node(&node)?;
    if peer.is_default() {
        return Err(ApiError::BadRequest(
            "the default limit is set via /api/limits/default".to_string(),
        ));
    }

    info!(node = %peer, ?limit, "updating limit");
    state.dispatcher.update_limit(Some(peer), Some(limit)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_limit(
    State(state): State<ApiState>,
    Path(node): Path<String>,
) -> Result<StatusCode, ApiError> {
    let peer = parse_node(&node)?;
    if peer.is_default() {
        return Err(ApiError::BadRequest(
            "the default limit cannot be cleared".to_string(),
        ));
    }

    info!(node = %peer, "clearing limit");
    state.dispatcher.update_limit(Some(peer), None).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_default_limit(
    State(state): State<ApiState>,
    Json(limit): Json<Limit>,
) -> Result<StatusCode, ApiError> {
    info!(?limit, "updating default limit");
    state.dispatcher.update_limit(None, Some(limit)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Time range in nanoseconds since epoch; zero leaves a side unbounded.
#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    start_ns: i64,
    #[serde(default)]
    end_ns: i64,
}

async fn list_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let start = (query.start_ns != 0).then(|| Utc.timestamp_nanos(query.start_ns));
    let end = (query.end_ns != 0).then(|| Utc.timestamp_nanos(query.end_ns));

    let forwards = state.store.list_forwarding_history(start, end).await?;
    Ok(Json(HistoryResponse {
        forwards: forwards.into_iter().map(Forward::from).collect(),
    }))
}

fn parse_node(node: &str) -> Result<PeerId, ApiError> {
    node.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid node key: {e}")))
}

async fn node_alias(state: &ApiState, peer: PeerId) -> Result<String, ApiError> {
    if let Some(alias) = state.aliases.lock().get(&peer) {
        return Ok(alias.clone());
    }

    let alias = match state.client.get_node_alias(peer).await {
        Ok(Some(alias)) => alias,
        Ok(None) => String::new(),
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };

    state.aliases.lock().insert(peer, alias.clone());
    Ok(alias)
}

/// Handler-level errors mapped onto HTTP statuses.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            Self::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DefaultLimitProtected => Self::BadRequest(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::InvalidRequest(_)
            | DaemonError::Store(StoreError::DefaultLimitProtected) => {
                Self::BadRequest(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}
