//! Versioned schema migrations for the metadata database.
//!
//! Migration files live in `migrations/NNN_*.sql` and are embedded at build
//! time. Each pending migration runs inside a transaction that also records
//! a `schema_version(version, applied_at)` row; a failure rolls the
//! transaction back and aborts startup.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "001_initial_schema.sql",
        include_str!("../../migrations/001_initial_schema.sql"),
    ),
    (
        2,
        "002_directories.sql",
        include_str!("../../migrations/002_directories.sql"),
    ),
];

pub fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )
    .context("failed to create schema_version table")?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .context("failed to read schema version")?;

    for (version, name, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn
            .transaction()
            .context("failed to open migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("migration {name} failed"))?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![version, chrono::Utc::now().timestamp()],
        )
        .with_context(|| format!("failed to record migration {name}"))?;
        tx.commit()
            .with_context(|| format!("failed to commit migration {name}"))?;
        tracing::info!(version, name, "applied schema migration");
    }

    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
