//! SQL migration definitions for the registry and classification state databases.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

use libsql::{Connection, params};

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Registry migrations, in ascending version order.
pub(crate) fn registry_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial registry schema: pages",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per fetched wiki page; titles are unique across page ids
CREATE TABLE IF NOT EXISTS pages (
    page_id      INTEGER PRIMARY KEY,
    title        TEXT UNIQUE,
    last_revid   INTEGER,
    last_updated TEXT DEFAULT CURRENT_TIMESTAMP,
    file_path    TEXT,
    categories   TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

/// Classification state migrations, in ascending version order.
pub(crate) fn state_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial state schema: classification_state",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS classification_state (
    doc_id             TEXT PRIMARY KEY,
    source_mode        TEXT NOT NULL,
    last_revid         INTEGER,
    content_hash       TEXT,
    strategy_version   TEXT NOT NULL,
    entity_type        TEXT NOT NULL,
    source_path        TEXT NOT NULL,
    last_classified_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_class_state_source_mode
    ON classification_state(source_mode);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

/// Apply every migration newer than the recorded schema version.
pub(crate) async fn apply(conn: &Connection, migrations: &[Migration]) -> libsql::Result<()> {
    let current_version = schema_version(conn).await;

    for migration in migrations {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.sql).await?;
        }
    }
    Ok(())
}

/// Current schema version, or 0 if no migrations have been applied.
async fn schema_version(conn: &Connection) -> u32 {
    match conn
        .query("SELECT MAX(version) FROM schema_migrations", params![])
        .await
    {
        Ok(mut rows) => match rows.next().await {
            Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
            _ => 0,
        },
        Err(_) => 0, // Table doesn't exist yet
    }
}
