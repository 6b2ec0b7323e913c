//! Durable file-metadata store backed by SQLite.
//!
//! Sole owner of the durable schema: per-file indexing state, per-source
//! indexing stats, system-wide counters, and the managed-directory
//! catalogue. One writer, many readers; all access is serialised through a
//! single connection guarded by a mutex, and batch writes run in one
//! transaction.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::config::FilePatterns;
use crate::types::{
    DirectoryRecord, FileMetadataRecord, FileMetadataUpdate, IndexCoverage, IndexKind,
    MetadataStats, SourceRef, SourceStats,
};

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open (creating if necessary) the metadata database and apply pending
    /// schema migrations. A failed migration aborts startup.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open metadata db at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        super::migrations::apply_pending_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        super::migrations::apply_pending_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── File metadata ──────────────────────────────────────────────────

    /// Unix timestamp of the last successful indexing of `path`, or `None`
    /// if the file has never been indexed.
    pub fn get_last_indexed(&self, path: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT last_indexed FROM file_metadata WHERE file_path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get_record(&self, path: &str) -> Result<Option<FileMetadataRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT file_path, source_type, source_id, last_indexed, last_modified,
                        content_hash, file_size, index_kind, created_at, updated_at
                 FROM file_metadata WHERE file_path = ?1",
                params![path],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert(&self, kind: IndexKind, update: &FileMetadataUpdate) -> Result<()> {
        self.upsert_batch(kind, std::slice::from_ref(update))
    }

    /// Record a batch of successfully flushed files in one transaction.
    /// `last_indexed` is stamped with the current time; a row already
    /// covered by the other index kind is promoted to `both`.
    pub fn upsert_batch(&self, kind: IndexKind, updates: &[FileMetadataUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO file_metadata (
                     file_path, source_type, source_id, last_indexed, last_modified,
                     content_hash, file_size, index_kind, created_at, updated_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(file_path) DO UPDATE SET
                     source_type = excluded.source_type,
                     source_id = excluded.source_id,
                     last_indexed = excluded.last_indexed,
                     last_modified = excluded.last_modified,
                     content_hash = excluded.content_hash,
                     file_size = excluded.file_size,
                     index_kind = CASE
                         WHEN file_metadata.index_kind = excluded.index_kind
                             THEN excluded.index_kind
                         ELSE 'both'
                     END,
                     updated_at = excluded.updated_at",
            )?;
            for update in updates {
                stmt.execute(params![
                    update.file_path,
                    update.source.source_type(),
                    update.source.source_id(),
                    now,
                    update.last_modified,
                    update.content_hash,
                    update.size as i64,
                    kind.as_str(),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a file's metadata row. Returns whether a row was deleted; the
    /// next reindex will re-add the file.
    pub fn remove(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM file_metadata WHERE file_path = ?1",
            params![path],
        )?;
        Ok(deleted > 0)
    }

    pub fn remove_by_source(&self, source: &SourceRef) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM file_metadata WHERE source_type = ?1 AND source_id = ?2",
            params![source.source_type(), source.source_id()],
        )?;
        Ok(deleted)
    }

    pub fn count_by_source(&self, source: &SourceRef) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM file_metadata WHERE source_type = ?1 AND source_id = ?2",
            params![source.source_type(), source.source_id()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn list_indexed(&self, source: Option<&SourceRef>) -> Result<Vec<FileMetadataRecord>> {
        let conn = self.conn.lock();
        let mut records = Vec::new();
        match source {
            Some(source) => {
                let mut stmt = conn.prepare(
                    "SELECT file_path, source_type, source_id, last_indexed, last_modified,
                            content_hash, file_size, index_kind, created_at, updated_at
                     FROM file_metadata WHERE source_type = ?1 AND source_id = ?2",
                )?;
                let rows = stmt.query_map(
                    params![source.source_type(), source.source_id()],
                    row_to_record,
                )?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT file_path, source_type, source_id, last_indexed, last_modified,
                            content_hash, file_size, index_kind, created_at, updated_at
                     FROM file_metadata",
                )?;
                let rows = stmt.query_map([], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<MetadataStats> {
        let conn = self.conn.lock();
        let total_files: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |r| r.get(0))?;

        let mut stats = MetadataStats {
            total_files: total_files as u64,
            ..Default::default()
        };

        let mut stmt = conn.prepare(
            "SELECT source_type || ':' || source_id, COUNT(*)
             FROM file_metadata GROUP BY source_type, source_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (source, count) = row?;
            stats.by_source.insert(source, count as u64);
        }

        let mut stmt = conn
            .prepare("SELECT index_kind, COUNT(*) FROM file_metadata GROUP BY index_kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            stats.by_index_kind.insert(kind, count as u64);
        }

        Ok(stats)
    }

    // ── Source stats ───────────────────────────────────────────────────

    /// Record timing stats for an indexing run. Initial-index fields are
    /// written once (first run, or an explicit `is_initial`); reindex
    /// fields are updated on every run.
    pub fn record_source_indexing(
        &self,
        source: &SourceRef,
        kind: IndexKind,
        duration_seconds: f64,
        total_files: u64,
        total_bytes: u64,
        is_initial: bool,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT initial_index_timestamp FROM source_stats
                 WHERE source_type = ?1 AND source_id = ?2 AND index_kind = ?3",
                params![source.source_type(), source.source_id(), kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if is_initial || existing.is_none() {
            conn.execute(
                "INSERT INTO source_stats (
                     source_type, source_id, index_kind,
                     initial_index_time_seconds, initial_index_timestamp,
                     last_reindex_time_seconds, last_reindex_timestamp,
                     total_files_indexed, total_bytes_indexed
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?4, ?5, ?6, ?7)
                 ON CONFLICT(source_type, source_id, index_kind) DO UPDATE SET
                     initial_index_time_seconds = excluded.initial_index_time_seconds,
                     initial_index_timestamp = excluded.initial_index_timestamp,
                     last_reindex_time_seconds = excluded.last_reindex_time_seconds,
                     last_reindex_timestamp = excluded.last_reindex_timestamp,
                     total_files_indexed = excluded.total_files_indexed,
                     total_bytes_indexed = excluded.total_bytes_indexed",
                params![
                    source.source_type(),
                    source.source_id(),
                    kind.as_str(),
                    duration_seconds,
                    now,
                    total_files as i64,
                    total_bytes as i64,
                ],
            )?;
        } else {
            conn.execute(
                "UPDATE source_stats SET
                     last_reindex_time_seconds = ?1,
                     last_reindex_timestamp = ?2,
                     total_files_indexed = ?3,
                     total_bytes_indexed = ?4
                 WHERE source_type = ?5 AND source_id = ?6 AND index_kind = ?7",
                params![
                    duration_seconds,
                    now,
                    total_files as i64,
                    total_bytes as i64,
                    source.source_type(),
                    source.source_id(),
                    kind.as_str(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn get_source_stats(
        &self,
        source: &SourceRef,
        kind: Option<IndexKind>,
    ) -> Result<Vec<SourceStats>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match kind {
            Some(kind) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM source_stats
                     WHERE source_type = ?1 AND source_id = ?2 AND index_kind = ?3",
                )?;
                let rows = stmt.query_map(
                    params![source.source_type(), source.source_id(), kind.as_str()],
                    row_to_source_stats,
                )?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM source_stats WHERE source_type = ?1 AND source_id = ?2",
                )?;
                let rows = stmt.query_map(
                    params![source.source_type(), source.source_id()],
                    row_to_source_stats,
                )?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn all_source_stats(&self) -> Result<Vec<SourceStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM source_stats")?;
        let rows = stmt.query_map([], row_to_source_stats)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── System metadata ────────────────────────────────────────────────

    pub fn get_last_index_time(&self) -> Result<Option<String>> {
        self.get_system_value("last_index_time")
    }

    pub fn set_last_index_time(&self, timestamp: Option<String>) -> Result<()> {
        let timestamp =
            timestamp.unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        self.set_system_value("last_index_time", Some(&timestamp))
    }

    /// Add one search to the cumulative counters.
    pub fn record_search(&self, duration_ms: f64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let searches: i64 = tx
            .query_row(
                "SELECT value FROM system_metadata WHERE key = 'total_searches'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let total_ms: i64 = tx
            .query_row(
                "SELECT value FROM system_metadata WHERE key = 'total_search_time_ms'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        for (key, value) in [
            ("total_searches", (searches + 1).to_string()),
            (
                "total_search_time_ms",
                (total_ms + duration_ms as i64).to_string(),
            ),
        ] {
            tx.execute(
                "INSERT INTO system_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_search_stats(&self) -> Result<(u64, u64)> {
        let searches = self
            .get_system_value("total_searches")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let total_ms = self
            .get_system_value("total_search_time_ms")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok((searches, total_ms))
    }

    /// Reset all system counters to their defaults.
    pub fn clear_system_metadata(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM system_metadata
             WHERE key IN ('last_index_time', 'total_searches', 'total_search_time_ms')",
            [],
        )?;
        for (key, value) in [
            ("last_index_time", None::<&str>),
            ("total_searches", Some("0")),
            ("total_search_time_ms", Some("0")),
        ] {
            tx.execute(
                "INSERT INTO system_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_system_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value: Option<Option<String>> = conn
            .query_row(
                "SELECT value FROM system_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn set_system_value(&self, key: &str, value: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    // ── Managed directories ────────────────────────────────────────────

    pub fn add_directory(
        &self,
        path: &str,
        name: &str,
        priority: i64,
        enabled: bool,
        notes: Option<&str>,
        patterns: &FilePatterns,
    ) -> Result<DirectoryRecord> {
        let now = chrono::Utc::now().timestamp();
        let include = serde_json::to_string(&patterns.include)?;
        let exclude = serde_json::to_string(&patterns.exclude)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO directories (
                 path, name, enabled, priority, notes,
                 include_patterns, exclude_patterns, created_at, updated_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![path, name, enabled, priority, notes, include, exclude, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(DirectoryRecord {
            id,
            path: path.to_string(),
            name: name.to_string(),
            enabled,
            priority,
            notes: notes.map(|s| s.to_string()),
            include_patterns: patterns.include.clone(),
            exclude_patterns: patterns.exclude.clone(),
        })
    }

    pub fn get_directory(&self, id: i64) -> Result<Option<DirectoryRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, path, name, enabled, priority, notes,
                        include_patterns, exclude_patterns
                 FROM directories WHERE id = ?1",
                params![id],
                row_to_directory,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_directory_by_path(&self, path: &str) -> Result<Option<DirectoryRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, path, name, enabled, priority, notes,
                        include_patterns, exclude_patterns
                 FROM directories WHERE path = ?1",
                params![path],
                row_to_directory,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_directories(&self, enabled_only: bool) -> Result<Vec<DirectoryRecord>> {
        let conn = self.conn.lock();
        let sql = if enabled_only {
            "SELECT id, path, name, enabled, priority, notes,
                    include_patterns, exclude_patterns
             FROM directories WHERE enabled = 1 ORDER BY priority DESC, id"
        } else {
            "SELECT id, path, name, enabled, priority, notes,
                    include_patterns, exclude_patterns
             FROM directories ORDER BY priority DESC, id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_directory)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_directory(&self, record: &DirectoryRecord) -> Result<bool> {
        let include = serde_json::to_string(&record.include_patterns)?;
        let exclude = serde_json::to_string(&record.exclude_patterns)?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE directories SET
                 path = ?1, name = ?2, enabled = ?3, priority = ?4, notes = ?5,
                 include_patterns = ?6, exclude_patterns = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                record.path,
                record.name,
                record.enabled,
                record.priority,
                record.notes,
                include,
                exclude,
                chrono::Utc::now().timestamp(),
                record.id,
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_directory(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM directories WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FileMetadataRecord> {
    let source_type: String = row.get(1)?;
    let source_id: String = row.get(2)?;
    let kind: String = row.get(7)?;
    Ok(FileMetadataRecord {
        file_path: row.get(0)?,
        source: SourceRef::from_parts(&source_type, &source_id)
            .unwrap_or(SourceRef::Repository(source_id)),
        last_indexed_at: row.get(3)?,
        last_modified: row.get(4)?,
        content_hash: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
        index_kind: IndexCoverage::parse(&kind).unwrap_or(IndexCoverage::Keyword),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_source_stats(row: &Row<'_>) -> rusqlite::Result<SourceStats> {
    Ok(SourceStats {
        source_type: row.get(0)?,
        source_id: row.get(1)?,
        index_kind: row.get(2)?,
        initial_index_time_seconds: row.get(3)?,
        initial_index_timestamp: row.get(4)?,
        last_reindex_time_seconds: row.get(5)?,
        last_reindex_timestamp: row.get(6)?,
        total_files_indexed: row.get::<_, i64>(7)? as u64,
        total_bytes_indexed: row.get::<_, i64>(8)? as u64,
    })
}

fn row_to_directory(row: &Row<'_>) -> rusqlite::Result<DirectoryRecord> {
    let include: String = row.get(6)?;
    let exclude: String = row.get(7)?;
    Ok(DirectoryRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        enabled: row.get(3)?,
        priority: row.get(4)?,
        notes: row.get(5)?,
        include_patterns: serde_json::from_str(&include).unwrap_or_default(),
        exclude_patterns: serde_json::from_str(&exclude).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_for(path: &str, source: SourceRef, mtime: i64) -> FileMetadataUpdate {
        FileMetadataUpdate {
            file_path: path.to_string(),
            source,
            last_modified: mtime,
            content_hash: Some("abc".into()),
            size: 10,
        }
    }

    #[test]
    fn upsert_and_last_indexed() {
        let store = MetadataStore::open_in_memory().unwrap();
        let source = SourceRef::Repository("proj".into());
        assert_eq!(store.get_last_indexed("/a.py").unwrap(), None);

        store
            .upsert(IndexKind::Keyword, &update_for("/a.py", source.clone(), 100))
            .unwrap();
        let indexed = store.get_last_indexed("/a.py").unwrap().unwrap();
        assert!(indexed > 0);

        let record = store.get_record("/a.py").unwrap().unwrap();
        assert_eq!(record.index_kind, IndexCoverage::Keyword);
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn both_kinds_merge_to_both() {
        let store = MetadataStore::open_in_memory().unwrap();
        let source = SourceRef::Repository("proj".into());
        store
            .upsert(IndexKind::Keyword, &update_for("/a.py", source.clone(), 100))
            .unwrap();
        store
            .upsert(IndexKind::Vector, &update_for("/a.py", source.clone(), 100))
            .unwrap();
        let record = store.get_record("/a.py").unwrap().unwrap();
        assert_eq!(record.index_kind, IndexCoverage::Both);
    }

    #[test]
    fn remove_by_source_counts_rows() {
        let store = MetadataStore::open_in_memory().unwrap();
        let a = SourceRef::Repository("a".into());
        let b = SourceRef::Directory(1);
        store
            .upsert_batch(
                IndexKind::Keyword,
                &[
                    update_for("/a/1.py", a.clone(), 1),
                    update_for("/a/2.py", a.clone(), 1),
                    update_for("/b/3.py", b.clone(), 1),
                ],
            )
            .unwrap();
        assert_eq!(store.count_by_source(&a).unwrap(), 2);
        assert_eq!(store.remove_by_source(&a).unwrap(), 2);
        assert_eq!(store.count_by_source(&a).unwrap(), 0);
        assert_eq!(store.count_by_source(&b).unwrap(), 1);
    }

    #[test]
    fn source_stats_initial_then_reindex() {
        let store = MetadataStore::open_in_memory().unwrap();
        let source = SourceRef::Repository("proj".into());

        store
            .record_source_indexing(&source, IndexKind::Keyword, 12.5, 100, 4096, true)
            .unwrap();
        store
            .record_source_indexing(&source, IndexKind::Keyword, 1.5, 3, 128, false)
            .unwrap();

        let stats = store
            .get_source_stats(&source, Some(IndexKind::Keyword))
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].initial_index_time_seconds, Some(12.5));
        assert_eq!(stats[0].last_reindex_time_seconds, Some(1.5));
        assert_eq!(stats[0].total_files_indexed, 3);
    }

    #[test]
    fn search_counters_accumulate() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.record_search(30.0).unwrap();
        store.record_search(70.0).unwrap();
        let (searches, total_ms) = store.get_search_stats().unwrap();
        assert_eq!(searches, 2);
        assert_eq!(total_ms, 100);

        store.clear_system_metadata().unwrap();
        let (searches, total_ms) = store.get_search_stats().unwrap();
        assert_eq!((searches, total_ms), (0, 0));
        assert_eq!(store.get_last_index_time().unwrap(), None);
    }

    #[test]
    fn last_index_time_round_trip() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert_eq!(store.get_last_index_time().unwrap(), None);
        store
            .set_last_index_time(Some("2026-01-06T15:59:00Z".into()))
            .unwrap();
        assert_eq!(
            store.get_last_index_time().unwrap().as_deref(),
            Some("2026-01-06T15:59:00Z")
        );
    }

    #[test]
    fn directory_catalogue_crud() {
        let store = MetadataStore::open_in_memory().unwrap();
        let patterns = FilePatterns::standard();
        let dir = store
            .add_directory("/data/docs", "docs", 10, true, Some("team docs"), &patterns)
            .unwrap();
        assert!(dir.id > 0);

        let fetched = store.get_directory(dir.id).unwrap().unwrap();
        assert_eq!(fetched.name, "docs");
        assert_eq!(fetched.include_patterns, patterns.include);

        let mut updated = fetched.clone();
        updated.enabled = false;
        updated.priority = 2;
        assert!(store.update_directory(&updated).unwrap());
        assert!(store.list_directories(true).unwrap().is_empty());
        assert_eq!(store.list_directories(false).unwrap().len(), 1);

        assert!(store.delete_directory(dir.id).unwrap());
        assert!(store.get_directory(dir.id).unwrap().is_none());
    }
}
