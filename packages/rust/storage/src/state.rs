//! Persistent classification state keyed by document id.
//!
//! A store that cannot be read is quarantined (renamed aside with a timestamp)
//! and recreated empty rather than failing the run.

use std::path::{Path, PathBuf};

use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::{info, warn};
use wikiharvest_shared::{
    HarvestError, Result, RevisionId, StateEntry, StateFingerprint,
};

use crate::{migrations, open_database, storage_err};

/// SQLite primary result codes that mean the file itself is unusable.
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// How the state store came to be open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Opened (or created) normally.
    Opened,
    /// The previous file was corrupt and moved to `quarantined`; a fresh store was created.
    Recovered { quarantined: PathBuf },
}

/// Classification state store backed by libSQL.
pub struct ClassificationStateStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    path: PathBuf,
}

impl ClassificationStateStore {
    /// Open the store at `path`, recovering from a corrupt file if needed.
    pub async fn open_with_recovery(path: &Path) -> Result<(Self, OpenOutcome)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }

        match Self::try_open(path).await {
            Ok(store) => {
                info!(path = %path.display(), "classification state store opened");
                Ok((store, OpenOutcome::Opened))
            }
            Err(e) if path.is_file() && is_corruption(&e) => {
                warn!(path = %path.display(), error = %e, "classification state store is corrupt, quarantining");
                let quarantined = quarantine(path)?;
                let store = Self::try_open(path).await.map_err(storage_err)?;
                info!(
                    path = %path.display(),
                    quarantined = %quarantined.display(),
                    "classification state store recreated"
                );
                Ok((store, OpenOutcome::Recovered { quarantined }))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn try_open(path: &Path) -> libsql::Result<Self> {
        let (db, conn) = open_database(path).await?;
        migrations::apply(&conn, &migrations::state_migrations()).await?;

        // Schema statements may succeed on a damaged file; touch the table itself.
        let mut rows = conn
            .query("SELECT COUNT(*) FROM classification_state", params![])
            .await?;
        rows.next().await?;

        Ok(Self {
            db,
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last recorded fingerprint for `doc_id`, if any.
    pub async fn get(&self, doc_id: &str) -> Result<Option<StateFingerprint>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_mode, last_revid, content_hash, strategy_version
                 FROM classification_state WHERE doc_id = ?1",
                params![doc_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(StateFingerprint {
                source_mode: row.get::<String>(0).map_err(storage_err)?,
                revision_id: row
                    .get::<Option<i64>>(1)
                    .map_err(storage_err)?
                    .map(|r| r as RevisionId),
                content_hash: row.get::<Option<String>>(2).map_err(storage_err)?,
                strategy_version: row.get::<String>(3).map_err(storage_err)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert or replace the state row for `entry.doc_id`.
    pub async fn upsert(&self, entry: &StateEntry) -> Result<()> {
        let fp = &entry.fingerprint;
        self.conn
            .execute(
                "INSERT INTO classification_state (
                    doc_id, source_mode, last_revid, content_hash, strategy_version,
                    entity_type, source_path, last_classified_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(doc_id) DO UPDATE SET
                   source_mode = excluded.source_mode,
                   last_revid = excluded.last_revid,
                   content_hash = excluded.content_hash,
                   strategy_version = excluded.strategy_version,
                   entity_type = excluded.entity_type,
                   source_path = excluded.source_path,
                   last_classified_at = excluded.last_classified_at",
                params![
                    entry.doc_id.as_str(),
                    fp.source_mode.as_str(),
                    fp.revision_id.map(|r| r as i64),
                    fp.content_hash.as_deref(),
                    fp.strategy_version.as_str(),
                    entry.entity_type.as_str(),
                    entry.source_path.as_str(),
                    entry.last_classified_at.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Number of documents with recorded state.
    pub async fn len(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM classification_state", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as usize),
            None => Ok(0),
        }
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Whether an open/migrate error means the file is damaged rather than unreachable.
fn is_corruption(err: &libsql::Error) -> bool {
    if let libsql::Error::SqliteFailure(code, _) = err {
        let primary = code & 0xff;
        if primary == SQLITE_CORRUPT || primary == SQLITE_NOTADB {
            return true;
        }
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("not a database") || msg.contains("malformed")
}

/// Move a damaged store aside as `<name>.corrupt.<YYYYmmddHHMMSS>`.
fn quarantine(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "classification_state.db".to_string());
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let target = path.with_file_name(format!("{file_name}.corrupt.{stamp}"));

    std::fs::rename(path, &target).map_err(|e| HarvestError::io(path, e))?;
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{suffix}", path.display()));
        if sidecar.exists() {
            let _ = std::fs::remove_file(&sidecar);
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("wh_state_{}.db", Uuid::now_v7()))
    }

    fn entry(doc_id: &str, revid: Option<u64>, hash: Option<&str>) -> StateEntry {
        StateEntry {
            doc_id: doc_id.into(),
            fingerprint: StateFingerprint {
                source_mode: "html".into(),
                revision_id: revid,
                content_hash: hash.map(String::from),
                strategy_version: "1.1.0".into(),
            },
            entity_type: "cat".into(),
            source_path: "page/Cat_1.json".into(),
            last_classified_at: Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn missing_doc_returns_none() {
        let (store, outcome) = ClassificationStateStore::open_with_recovery(&temp_db_path())
            .await
            .expect("open");
        assert_eq!(outcome, OpenOutcome::Opened);
        assert!(store.get("1").await.unwrap().is_none());
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips_fingerprint() {
        let (store, _) = ClassificationStateStore::open_with_recovery(&temp_db_path())
            .await
            .unwrap();

        store.upsert(&entry("1", Some(10), Some("abc"))).await.unwrap();
        store.upsert(&entry("1", Some(11), None)).await.unwrap();

        let fp = store.get("1").await.unwrap().expect("state present");
        assert_eq!(fp.revision_id, Some(11));
        assert_eq!(fp.content_hash, None);
        assert_eq!(fp.source_mode, "html");
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_and_recreated() {
        let path = temp_db_path();
        std::fs::write(&path, "not a sqlite database ".repeat(200)).unwrap();

        let (store, outcome) = ClassificationStateStore::open_with_recovery(&path)
            .await
            .expect("recover");

        let OpenOutcome::Recovered { quarantined } = outcome else {
            panic!("expected recovery, got {outcome:?}");
        };
        assert!(quarantined.exists());
        let name = quarantined.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains(".corrupt."));
        assert!(store.is_empty().await.unwrap());

        store.upsert(&entry("9", Some(1), Some("h"))).await.unwrap();
        assert!(store.get("9").await.unwrap().is_some());
    }
}
