//! libSQL storage layer.
//!
//! - [`Registry`]: the local page registry written by the crawler
//! - [`ClassificationStateStore`]: per-document fingerprints for incremental classification

mod migrations;
pub mod registry;
pub mod state;

use std::path::Path;

use libsql::{Connection, Database};
use wikiharvest_shared::HarvestError;

pub use registry::Registry;
pub use state::{ClassificationStateStore, OpenOutcome};

/// Open a local libSQL database file and a connection to it.
pub(crate) async fn open_database(path: &Path) -> libsql::Result<(Database, Connection)> {
    let db = libsql::Builder::new_local(path).build().await?;
    let conn = db.connect()?;
    Ok((db, conn))
}

pub(crate) fn storage_err(e: impl std::fmt::Display) -> HarvestError {
    HarvestError::Storage(e.to_string())
}
