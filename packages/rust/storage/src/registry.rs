//! Local page registry: which pages have been fetched, at which revision, and where.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use libsql::{Connection, Database, Row, params};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wikiharvest_shared::{HarvestError, PageId, RegistryRecord, Result, RevisionId, WikiPageDoc};

use crate::{migrations, open_database, storage_err};

const RECORD_COLUMNS: &str = "page_id, title, last_revid, last_updated, file_path, categories";

/// Registry handle wrapping a libSQL database.
///
/// Writes are serialized through an internal lock so concurrent crawl tasks
/// can share one handle.
pub struct Registry {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Registry {
    /// Open or create the registry at `path`, applying migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }

        let (db, conn) = open_database(path).await.map_err(storage_err)?;
        migrations::apply(&conn, &migrations::registry_migrations())
            .await
            .map_err(|e| HarvestError::Storage(format!("registry migration failed: {e}")))?;

        Ok(Self {
            db,
            conn,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map of page id to last recorded revision id. Rows without a revision are omitted.
    pub async fn local_state(&self) -> Result<HashMap<PageId, RevisionId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT page_id, last_revid FROM pages WHERE last_revid IS NOT NULL",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut state = HashMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let page_id = row.get::<i64>(0).map_err(storage_err)?;
            let revid = row.get::<i64>(1).map_err(storage_err)?;
            state.insert(page_id as PageId, revid as RevisionId);
        }
        Ok(state)
    }

    /// Insert or update the row for a fetched document and return what was stored.
    ///
    /// A row holding the same title under a different page id is removed first,
    /// inside the same transaction, so a title always maps to exactly one page.
    pub async fn upsert(&self, doc: &WikiPageDoc, file_path: &str) -> Result<RegistryRecord> {
        let page_id = doc.pageid;
        let title = doc.title.as_str();
        let revid = doc.revid;
        let categories_json = serde_json::to_string(&doc.categories)?;
        let now = Utc::now().to_rfc3339();

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let outcome = async {
            let displaced = tx
                .execute(
                    "DELETE FROM pages WHERE title = ?1 AND page_id != ?2",
                    params![title, page_id as i64],
                )
                .await?;
            if displaced > 0 {
                warn!(page_id, title, "title moved to a new page id, replacing old row");
            }
            tx.execute(
                "INSERT INTO pages (page_id, title, last_revid, last_updated, file_path, categories)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(page_id) DO UPDATE SET
                   title = excluded.title,
                   last_revid = excluded.last_revid,
                   last_updated = excluded.last_updated,
                   file_path = excluded.file_path,
                   categories = excluded.categories",
                params![
                    page_id as i64,
                    title,
                    revid as i64,
                    now.as_str(),
                    file_path,
                    categories_json.as_str()
                ],
            )
            .await?;
            Ok::<_, libsql::Error>(())
        }
        .await;

        match outcome {
            Ok(()) => tx.commit().await.map_err(storage_err)?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(storage_err(e));
            }
        }

        debug!(page_id, revid, "registry row upserted");
        Ok(RegistryRecord {
            page_id,
            title: doc.title.clone(),
            last_revid: Some(revid),
            last_updated: Some(now),
            file_path: Some(file_path.to_string()),
            categories: doc.categories.clone(),
        })
    }

    /// Fetch one page row by id.
    pub async fn get(&self, page_id: PageId) -> Result<Option<RegistryRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM pages WHERE page_id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![page_id as i64])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// All page rows ordered by page id.
    pub async fn list(&self) -> Result<Vec<RegistryRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM pages ORDER BY page_id");
        let mut rows = self.conn.query(&sql, params![]).await.map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            records.push(record_from_row(&row)?);
        }
        Ok(records)
    }
}

fn record_from_row(row: &Row) -> Result<RegistryRecord> {
    let page_id = row.get::<i64>(0).map_err(storage_err)?;
    let categories_raw = row.get::<Option<String>>(5).map_err(storage_err)?;

    Ok(RegistryRecord {
        page_id: page_id as PageId,
        title: row
            .get::<Option<String>>(1)
            .map_err(storage_err)?
            .unwrap_or_default(),
        last_revid: row
            .get::<Option<i64>>(2)
            .map_err(storage_err)?
            .map(|r| r as RevisionId),
        last_updated: row.get::<Option<String>>(3).map_err(storage_err)?,
        file_path: row.get::<Option<String>>(4).map_err(storage_err)?,
        categories: parse_categories(page_id, categories_raw.as_deref()),
    })
}

/// Categories are stored as a JSON array string; anything else reads as empty.
fn parse_categories(page_id: i64, raw: Option<&str>) -> Vec<String> {
    match raw.map(str::trim) {
        None | Some("") => Vec::new(),
        Some(text) => serde_json::from_str::<Vec<String>>(text).unwrap_or_else(|e| {
            warn!(page_id, error = %e, "invalid categories JSON in registry row");
            Vec::new()
        }),
    }
}
