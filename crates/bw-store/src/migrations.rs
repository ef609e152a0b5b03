//! Schema migrations.
//!
//! The schema version lives in `PRAGMA user_version` and migrations are
//! applied in order on open. SQLite cannot widen a CHECK constraint in
//! place, so extending the mode set rebuilds the limits table.

use bw_core::PeerId;
use rusqlite::{params, Connection};

use crate::StoreError;

/// Default limit seeded on first open.
const SEED_MAX_PENDING: i64 = 5;
const SEED_MAX_HOURLY_RATE: i64 = 3600;

pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS limits (
                peer TEXT PRIMARY KEY NOT NULL,
                max_pending INTEGER NOT NULL,
                max_hourly_rate INTEGER NOT NULL,
                mode TEXT CHECK(mode IN ('FAIL', 'QUEUE', 'QUEUE_PEER_INITIATED'))
                    NOT NULL DEFAULT 'FAIL'
            );",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO limits (peer, max_pending, max_hourly_rate, mode)
             VALUES (?1, ?2, ?3, 'FAIL')",
            params![
                PeerId::DEFAULT.to_string(),
                SEED_MAX_PENDING,
                SEED_MAX_HOURLY_RATE
            ],
        )?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    if version < 2 {
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE limits_new (
                 peer TEXT PRIMARY KEY NOT NULL,
                 max_pending INTEGER NOT NULL,
                 max_hourly_rate INTEGER NOT NULL,
                 mode TEXT CHECK(mode IN ('FAIL', 'QUEUE', 'QUEUE_PEER_INITIATED', 'BLOCK'))
                     NOT NULL DEFAULT 'FAIL'
             );
             INSERT INTO limits_new SELECT peer, max_pending, max_hourly_rate, mode FROM limits;
             DROP TABLE limits;
             ALTER TABLE limits_new RENAME TO limits;
             PRAGMA user_version = 2;
             COMMIT;",
        )?;
    }

    if version < 3 {
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE forwarding_history (
                 add_time INTEGER NOT NULL,
                 resolve_time INTEGER NOT NULL,
                 settled INTEGER NOT NULL,
                 incoming_channel INTEGER NOT NULL,
                 incoming_htlc_index INTEGER NOT NULL,
                 outgoing_channel INTEGER NOT NULL,
                 outgoing_htlc_index INTEGER NOT NULL,
                 incoming_msat INTEGER NOT NULL,
                 outgoing_msat INTEGER NOT NULL,
                 incoming_peer TEXT NOT NULL,
                 outgoing_peer TEXT,
                 UNIQUE(incoming_channel, incoming_htlc_index)
             );
             CREATE INDEX forwarding_history_add_time ON forwarding_history(add_time);
             PRAGMA user_version = 3;
             COMMIT;",
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_per_version() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 3);

        // The default row survives re-running the migrations.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM limits", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
