//! Optional observability database: search metrics, error log, system
//! metrics, and indexing events, with a retention sweep. Kept separate from
//! the metadata store so it can be disabled without touching the schema the
//! engine depends on.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS search_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    mode TEXT NOT NULL,
    duration_ms REAL NOT NULL,
    result_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS error_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    component TEXT NOT NULL,
    message TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS system_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    name TEXT NOT NULL,
    value REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS indexing_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    run_id TEXT NOT NULL,
    source TEXT NOT NULL,
    index_kind TEXT NOT NULL,
    event TEXT NOT NULL,
    files_processed INTEGER NOT NULL DEFAULT 0
);
";

pub struct ObservabilityStore {
    conn: Mutex<Connection>,
}

impl ObservabilityStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open observability db at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(SCHEMA)
            .context("failed to create observability schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record_search_metric(
        &self,
        mode: &str,
        duration_ms: f64,
        result_count: usize,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO search_metrics (timestamp, mode, duration_ms, result_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                chrono::Utc::now().timestamp(),
                mode,
                duration_ms,
                result_count as i64
            ],
        )?;
        Ok(())
    }

    /// Returns the new error row id, so the caller can resolve it later.
    pub fn record_error(&self, component: &str, message: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO error_log (timestamp, component, message) VALUES (?1, ?2, ?3)",
            params![chrono::Utc::now().timestamp(), component, message],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn resolve_error(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE error_log SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(updated > 0)
    }

    pub fn record_system_metric(&self, name: &str, value: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_metrics (timestamp, name, value) VALUES (?1, ?2, ?3)",
            params![chrono::Utc::now().timestamp(), name, value],
        )?;
        Ok(())
    }

    pub fn record_indexing_event(
        &self,
        run_id: &str,
        source: &str,
        index_kind: &str,
        event: &str,
        files_processed: u64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO indexing_events (timestamp, run_id, source, index_kind, event, files_processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chrono::Utc::now().timestamp(),
                run_id,
                source,
                index_kind,
                event,
                files_processed as i64
            ],
        )?;
        Ok(())
    }

    /// Delete rows older than `retention_days`. Unresolved errors are
    /// preserved regardless of age. Returns the number of deleted rows.
    pub fn sweep_retention(&self, retention_days: i64) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp() - retention_days * 24 * 60 * 60;
        let conn = self.conn.lock();
        let mut deleted = 0;
        deleted += conn.execute(
            "DELETE FROM search_metrics WHERE timestamp < ?1",
            params![cutoff],
        )?;
        deleted += conn.execute(
            "DELETE FROM system_metrics WHERE timestamp < ?1",
            params![cutoff],
        )?;
        deleted += conn.execute(
            "DELETE FROM indexing_events WHERE timestamp < ?1",
            params![cutoff],
        )?;
        deleted += conn.execute(
            "DELETE FROM error_log WHERE timestamp < ?1 AND resolved = 1",
            params![cutoff],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, retention_days, "observability retention sweep");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_sweeps_metrics() {
        let store = ObservabilityStore::open_in_memory().unwrap();
        store.record_search_metric("hybrid", 12.0, 5).unwrap();
        store.record_system_metric("keyword_documents", 42.0).unwrap();
        store
            .record_indexing_event("run-1", "repository:proj", "keyword", "complete", 10)
            .unwrap();

        // Recent rows survive the sweep.
        assert_eq!(store.sweep_retention(30).unwrap(), 0);
    }

    #[test]
    fn unresolved_errors_survive_sweep() {
        let store = ObservabilityStore::open_in_memory().unwrap();
        let id = store.record_error("keyword", "backend write failed").unwrap();

        // Force everything past the cutoff.
        {
            let conn = store.conn.lock();
            conn.execute("UPDATE error_log SET timestamp = 0", []).unwrap();
        }

        assert_eq!(store.sweep_retention(30).unwrap(), 0);
        assert!(store.resolve_error(id).unwrap());
        assert_eq!(store.sweep_retention(30).unwrap(), 1);
    }
}
