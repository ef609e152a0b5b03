//! Durable store for the breakwater HTLC admission controller.
//!
//! A single SQLite database holds per-peer limits (including the default,
//! stored under the all-zero sentinel peer) and a bounded ring of
//! forwarding history. The connection is blocking, so all public methods
//! hop to the blocking pool.

#![forbid(unsafe_code)]

mod error;
mod migrations;

pub use error::StoreError;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use bw_core::{CircuitKey, HtlcInfo, Limit, Limits, Mode, PeerId};

/// Database filename under the config directory.
pub const DB_FILENAME: &str = "breakwater.db";

/// Forwarding history rows kept by default.
pub const DEFAULT_FWD_HISTORY_LIMIT: u64 = 1_000_000;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the durable store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    fwd_history_limit: u64,
}

impl Store {
    /// Open (or create) the database at `path`, apply migrations, and run
    /// one history sweep.
    pub async fn open(path: &Path, fwd_history_limit: u64) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            Self::init(conn, fwd_history_limit)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory(fwd_history_limit: u64) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_in_memory()?;
            Self::init(conn, fwd_history_limit)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn init(conn: Connection, fwd_history_limit: u64) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::migrate(&conn)?;

        // Enforce the history bound once on open: the limit may have been
        // lowered (or disabled) since the last run.
        limit_history(&conn, fwd_history_limit)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            fwd_history_limit,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// The default limit plus all per-peer overrides.
    pub async fn get_limits(&self) -> Result<Limits, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT peer, max_pending, max_hourly_rate, mode FROM limits")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut default = None;
            let mut per_peer = HashMap::new();
            for row in rows {
                let (peer_hex, max_pending, max_hourly_rate, mode) = row?;
                let peer = PeerId::from_str(&peer_hex)
                    .map_err(|_| StoreError::InvalidPeer(peer_hex.clone()))?;
                let limit = Limit {
                    max_hourly_rate,
                    max_pending,
                    mode: Mode::from_str(&mode).map_err(|e| StoreError::UnknownMode(e.0))?,
                };

                if peer.is_default() {
                    default = Some(limit);
                } else {
                    per_peer.insert(peer, limit);
                }
            }

            Ok(Limits {
                default: default.ok_or(StoreError::MissingDefault)?,
                per_peer,
            })
        })
        .await
    }

    /// Insert or replace a limit. Writing the sentinel peer replaces the
    /// default.
    pub async fn update_limit(&self, peer: PeerId, limit: Limit) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "REPLACE INTO limits (peer, max_pending, max_hourly_rate, mode)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    peer.to_string(),
                    limit.max_pending,
                    limit.max_hourly_rate,
                    limit.mode.to_string()
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Remove a per-peer limit. Clearing the default is rejected; clearing a
    /// peer without an override is a no-op success.
    pub async fn clear_limit(&self, peer: PeerId) -> Result<(), StoreError> {
        if peer.is_default() {
            return Err(StoreError::DefaultLimitProtected);
        }

        self.with_conn(move |conn| {
            conn.execute("DELETE FROM limits WHERE peer = ?1", params![peer.to_string()])?;
            Ok(())
        })
        .await
    }

    /// Record one resolved HTLC and trim the history to its bound. With a
    /// history limit of zero nothing is recorded.
    pub async fn record_htlc_resolution(&self, htlc: HtlcInfo) -> Result<(), StoreError> {
        let limit = self.fwd_history_limit;
        if limit == 0 {
            return Ok(());
        }

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO forwarding_history (
                     add_time, resolve_time, settled,
                     incoming_channel, incoming_htlc_index,
                     outgoing_channel, outgoing_htlc_index,
                     incoming_msat, outgoing_msat,
                     incoming_peer, outgoing_peer
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    ts_nanos(htlc.add_time),
                    ts_nanos(htlc.resolve_time),
                    htlc.settled,
                    htlc.incoming_circuit.channel,
                    htlc.incoming_circuit.htlc,
                    htlc.outgoing_circuit.channel,
                    htlc.outgoing_circuit.htlc,
                    htlc.incoming_msat,
                    htlc.outgoing_msat,
                    htlc.incoming_peer.to_string(),
                    htlc.outgoing_peer.map(|p| p.to_string()),
                ],
            )?;

            limit_history(conn, limit)
        })
        .await
    }

    /// Resolutions with `add_time` in `[start, end)`, oldest first. `None`
    /// leaves that side unbounded.
    pub async fn list_forwarding_history(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<HtlcInfo>, StoreError> {
        let start_ns = start.map_or(i64::MIN, ts_nanos);
        let end_ns = end.map_or(i64::MAX, ts_nanos);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT add_time, resolve_time, settled,
                        incoming_channel, incoming_htlc_index,
                        outgoing_channel, outgoing_htlc_index,
                        incoming_msat, outgoing_msat,
                        incoming_peer, outgoing_peer
                 FROM forwarding_history
                 WHERE add_time >= ?1 AND add_time < ?2
                 ORDER BY add_time",
            )?;

            let rows = stmt.query_map(params![start_ns, end_ns], |row| {
                Ok(RawHistoryRow {
                    add_time: row.get(0)?,
                    resolve_time: row.get(1)?,
                    settled: row.get(2)?,
                    incoming_channel: row.get(3)?,
                    incoming_htlc_index: row.get(4)?,
                    outgoing_channel: row.get(5)?,
                    outgoing_htlc_index: row.get(6)?,
                    incoming_msat: row.get(7)?,
                    outgoing_msat: row.get(8)?,
                    incoming_peer: row.get(9)?,
                    outgoing_peer: row.get(10)?,
                })
            })?;

            let mut forwards = Vec::new();
            for row in rows {
                forwards.push(row?.try_into()?);
            }
            Ok(forwards)
        })
        .await
    }
}

struct RawHistoryRow {
    add_time: i64,
    resolve_time: i64,
    settled: bool,
    incoming_channel: u64,
    incoming_htlc_index: u64,
    outgoing_channel: u64,
    outgoing_htlc_index: u64,
    incoming_msat: u64,
    outgoing_msat: u64,
    incoming_peer: String,
    outgoing_peer: Option<String>,
}

impl TryFrom<RawHistoryRow> for HtlcInfo {
    type Error = StoreError;

    fn try_from(row: RawHistoryRow) -> Result<Self, StoreError> {
        let incoming_peer = PeerId::from_str(&row.incoming_peer)
            .map_err(|_| StoreError::InvalidPeer(row.incoming_peer.clone()))?;
        let outgoing_peer = row
            .outgoing_peer
            .map(|hex| PeerId::from_str(&hex).map_err(|_| StoreError::InvalidPeer(hex)))
            .transpose()?;

        Ok(Self {
            add_time: from_nanos(row.add_time),
            resolve_time: from_nanos(row.resolve_time),
            settled: row.settled,
            incoming_msat: row.incoming_msat,
            outgoing_msat: row.outgoing_msat,
            incoming_peer,
            outgoing_peer,
            incoming_circuit: CircuitKey::new(row.incoming_channel, row.incoming_htlc_index),
            outgoing_circuit: CircuitKey::new(row.outgoing_channel, row.outgoing_htlc_index),
        })
    }
}

/// Trim forwarding history down to roughly the newest 90% of the limit.
///
/// Once the row count reaches the limit, everything at or before the
/// add_time found 10% from the bottom is deleted, so trimming runs in
/// batches rather than on every insert.
fn limit_history(conn: &Connection, limit: u64) -> Result<(), StoreError> {
    let count: u64 = conn.query_row("SELECT COUNT(add_time) FROM forwarding_history", [], |row| {
        row.get(0)
    })?;
    if limit > 0 && count < limit {
        return Ok(());
    }

    let offset = limit - limit / 10;
    let threshold: Option<i64> = conn
        .query_row(
            "SELECT add_time FROM forwarding_history
             ORDER BY add_time DESC LIMIT 1 OFFSET ?1",
            params![offset],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(threshold) = threshold {
        let deleted = conn.execute(
            "DELETE FROM forwarding_history WHERE add_time <= ?1",
            params![threshold],
        )?;
        debug!(deleted, "trimmed forwarding history");
    }

    Ok(())
}

fn ts_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}
