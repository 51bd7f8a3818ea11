//! Delivery-id ledger for webhook deduplication.
//!
//! The Git host retries webhook deliveries, and every retry carries the same
//! delivery id. [`DedupStore::reserve`] is the single admission gate: the
//! first caller for an id gets [`Reservation::New`], every later caller gets
//! [`Reservation::Seen`]. Rows are never mutated; a background compaction
//! removes entries older than the retention window.
//!
//! # Example
//!
//! ```
//! use gitguard_dedup::{DedupStore, Reservation};
//!
//! let td = tempfile::tempdir().expect("tempdir");
//! let store = DedupStore::open(td.path().join("ledger.db")).expect("open");
//!
//! let first = store.reserve("d-1", "pull_request", "abc123").expect("reserve");
//! assert_eq!(first, Reservation::New);
//! let second = store.reserve("d-1", "pull_request", "abc123").expect("reserve");
//! assert_eq!(second, Reservation::Seen);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gitguard_types::DeliveryRecord;
use rusqlite::{Connection, OptionalExtension, params};

/// Default retention window for ledger rows: 14 days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Outcome of an atomic reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// First time this delivery id was seen; the caller owns the event.
    New,
    /// Already in the ledger; the caller must not start a workflow.
    Seen,
}

/// SQLite-backed ledger of seen delivery ids.
pub struct DedupStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DedupStore {
    /// Open (and initialize if needed) the ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger dir {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open dedup ledger {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set busy timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS seen_deliveries (
                delivery_id TEXT PRIMARY KEY,
                received_at TEXT NOT NULL,
                event_kind  TEXT NOT NULL,
                raw_digest  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_seen_received_at
                ON seen_deliveries(received_at);",
        )
        .context("failed to initialize dedup schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Atomically reserve a delivery id.
    ///
    /// `INSERT OR IGNORE` makes the check-and-insert a single statement, so
    /// concurrent callers for the same id race safely: exactly one sees
    /// [`Reservation::New`].
    pub fn reserve(&self, delivery_id: &str, event_kind: &str, raw_digest: &str) -> Result<Reservation> {
        let conn = self.conn.lock().expect("dedup lock poisoned");
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO seen_deliveries
                    (delivery_id, received_at, event_kind, raw_digest)
                 VALUES (?1, ?2, ?3, ?4)",
                params![delivery_id, Utc::now().to_rfc3339(), event_kind, raw_digest],
            )
            .context("failed to reserve delivery id")?;
        Ok(if inserted == 1 {
            Reservation::New
        } else {
            Reservation::Seen
        })
    }

    /// Look up a ledger row.
    pub fn get(&self, delivery_id: &str) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn.lock().expect("dedup lock poisoned");
        conn.query_row(
            "SELECT delivery_id, received_at, event_kind, raw_digest
             FROM seen_deliveries WHERE delivery_id = ?1",
            params![delivery_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .context("failed to read dedup ledger")?
        .map(|(delivery_id, received_at, event_kind, raw_digest)| {
            let received_at: DateTime<Utc> = received_at
                .parse()
                .context("invalid received_at in dedup ledger")?;
            Ok(DeliveryRecord {
                delivery_id,
                received_at,
                event_kind,
                raw_digest,
            })
        })
        .transpose()
    }

    /// Release a reservation whose event never reached the stream, so the
    /// host's retry is admitted instead of deduplicated into a lost event.
    pub fn release(&self, delivery_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("dedup lock poisoned");
        conn.execute(
            "DELETE FROM seen_deliveries WHERE delivery_id = ?1",
            params![delivery_id],
        )
        .context("failed to release delivery id")?;
        Ok(())
    }

    /// Remove rows older than `retention`. Returns the number pruned.
    pub fn prune(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).context("retention out of range")?;
        let conn = self.conn.lock().expect("dedup lock poisoned");
        let pruned = conn
            .execute(
                "DELETE FROM seen_deliveries WHERE received_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("failed to prune dedup ledger")?;
        Ok(pruned as u64)
    }

    /// Number of rows currently in the ledger.
    pub fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("dedup lock poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM seen_deliveries", [], |row| row.get(0))
            .context("failed to count dedup ledger")?;
        Ok(count as u64)
    }

    /// True when the ledger has no rows.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ledger file location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, DedupStore) {
        let td = tempdir().expect("tempdir");
        let store = DedupStore::open(td.path().join("ledger.db")).expect("open");
        (td, store)
    }

    #[test]
    fn first_reserve_is_new() {
        let (_td, store) = open_store();
        assert_eq!(
            store.reserve("d-1", "pull_request", "digest").expect("reserve"),
            Reservation::New
        );
    }

    #[test]
    fn second_reserve_is_seen() {
        let (_td, store) = open_store();
        store.reserve("d-1", "pull_request", "digest").expect("reserve");
        assert_eq!(
            store.reserve("d-1", "pull_request", "digest").expect("reserve"),
            Reservation::Seen
        );
    }

    #[test]
    fn reserve_is_idempotent_over_many_attempts() {
        let (_td, store) = open_store();
        let mut new_count = 0;
        for _ in 0..20 {
            if store.reserve("d-1", "push", "digest").expect("reserve") == Reservation::New {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1);
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn distinct_ids_are_independent() {
        let (_td, store) = open_store();
        assert_eq!(
            store.reserve("d-1", "push", "a").expect("reserve"),
            Reservation::New
        );
        assert_eq!(
            store.reserve("d-2", "push", "b").expect("reserve"),
            Reservation::New
        );
        assert_eq!(store.len().expect("len"), 2);
    }

    #[test]
    fn get_returns_stored_record() {
        let (_td, store) = open_store();
        store
            .reserve("d-9", "release", "feedface")
            .expect("reserve");
        let record = store.get("d-9").expect("get").expect("present");
        assert_eq!(record.delivery_id, "d-9");
        assert_eq!(record.event_kind, "release");
        assert_eq!(record.raw_digest, "feedface");
    }

    #[test]
    fn get_missing_returns_none() {
        let (_td, store) = open_store();
        assert!(store.get("nope").expect("get").is_none());
    }

    #[test]
    fn record_is_never_mutated_by_later_reserves() {
        let (_td, store) = open_store();
        store.reserve("d-1", "push", "first").expect("reserve");
        store.reserve("d-1", "release", "second").expect("reserve");
        let record = store.get("d-1").expect("get").expect("present");
        assert_eq!(record.event_kind, "push");
        assert_eq!(record.raw_digest, "first");
    }

    #[test]
    fn release_reopens_a_reservation() {
        let (_td, store) = open_store();
        store.reserve("d-1", "push", "a").expect("reserve");
        store.release("d-1").expect("release");
        assert_eq!(
            store.reserve("d-1", "push", "a").expect("reserve"),
            Reservation::New
        );
    }

    #[test]
    fn prune_removes_only_expired_rows() {
        let (_td, store) = open_store();
        store.reserve("old", "push", "a").expect("reserve");
        store.reserve("fresh", "push", "b").expect("reserve");

        // Nothing is older than 1 hour yet.
        assert_eq!(store.prune(Duration::from_secs(3600)).expect("prune"), 0);

        // Zero retention expires everything inserted before "now".
        std::thread::sleep(Duration::from_millis(10));
        let pruned = store.prune(Duration::ZERO).expect("prune");
        assert_eq!(pruned, 2);
        assert!(store.is_empty().expect("is_empty"));
    }

    #[test]
    fn reopen_preserves_ledger() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("ledger.db");
        {
            let store = DedupStore::open(&path).expect("open");
            store.reserve("d-1", "push", "a").expect("reserve");
        }
        let store = DedupStore::open(&path).expect("reopen");
        assert_eq!(
            store.reserve("d-1", "push", "a").expect("reserve"),
            Reservation::Seen
        );
    }

    #[test]
    fn concurrent_reserves_yield_exactly_one_new() {
        use std::sync::Arc;

        let td = tempdir().expect("tempdir");
        let store = Arc::new(DedupStore::open(td.path().join("ledger.db")).expect("open"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.reserve("contested", "push", "digest").expect("reserve")
            }));
        }

        let news = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|r| *r == Reservation::New)
            .count();
        assert_eq!(news, 1);
    }
}
