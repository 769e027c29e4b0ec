//! Core domain records shared by the crawler, storage, and classification crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HarvestError;

/// Wiki page identifier.
pub type PageId = u64;

/// Wiki revision identifier.
pub type RevisionId = u64;

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Per-run identity threaded through the client, audit log, and reports.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Time-sortable run identifier (UUID v7).
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            started_at: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Crawl records
// ---------------------------------------------------------------------------

/// A page selected for fetching, with the redirect titles that resolve to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    pub page_id: PageId,
    pub remote_revision_id: RevisionId,
    /// Sorted, de-duplicated redirect titles pointing at this page.
    pub redirect_aliases: Vec<String>,
}

/// Response metadata captured alongside a fetched document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMeta {
    pub status: u16,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub last_modified: String,
}

/// A fetched wiki page as persisted to `<sanitized title>_<pageid>.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WikiPageDoc {
    /// Source wiki name (host).
    pub source: String,
    pub pageid: PageId,
    pub title: String,
    pub canonical_url: String,
    pub revid: RevisionId,
    /// Revision timestamp as reported by the wiki.
    pub timestamp: String,
    #[serde(default)]
    pub content_model: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Plain-text body.
    #[serde(default)]
    pub content: String,
    /// Raw extract as returned by the API.
    #[serde(default)]
    pub extract: String,
    #[serde(default)]
    pub is_redirect: bool,
    #[serde(default)]
    pub redirect_target: Option<String>,
    pub fetched_at: String,
    #[serde(default)]
    pub http: HttpMeta,
    /// Redirect titles that resolve to this page.
    #[serde(default)]
    pub redirects_from: Vec<String>,
}

/// One row of the local page registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub page_id: PageId,
    pub title: String,
    pub last_revid: Option<RevisionId>,
    pub last_updated: Option<String>,
    pub file_path: Option<String>,
    pub categories: Vec<String>,
}

/// Counters reported by a crawl run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub discovered_total: usize,
    pub queued_total: usize,
    pub processed_total: usize,
    pub failed_total: usize,
    pub skipped_total: usize,
}

// ---------------------------------------------------------------------------
// Classification fingerprints
// ---------------------------------------------------------------------------

/// Where classification input pages come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Downloaded page JSON files in a directory.
    #[default]
    #[serde(alias = "files")]
    Html,
    /// Rows of the local page registry.
    #[serde(alias = "db")]
    Registry,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Registry => "registry",
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceMode {
    type Err = HarvestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "html" | "files" => Ok(Self::Html),
            "registry" | "db" => Ok(Self::Registry),
            other => Err(HarvestError::config(format!(
                "unknown source mode '{other}': expected 'html' or 'registry'"
            ))),
        }
    }
}

/// What the state store remembers about the last classification of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFingerprint {
    pub source_mode: String,
    pub revision_id: Option<RevisionId>,
    pub content_hash: Option<String>,
    pub strategy_version: String,
}

/// The same fingerprint computed for the page as currently loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFingerprint {
    pub source_mode: String,
    pub revision_id: Option<RevisionId>,
    pub content_hash: Option<String>,
    pub strategy_version: String,
}

impl From<PageFingerprint> for StateFingerprint {
    fn from(fp: PageFingerprint) -> Self {
        Self {
            source_mode: fp.source_mode,
            revision_id: fp.revision_id,
            content_hash: fp.content_hash,
            strategy_version: fp.strategy_version,
        }
    }
}

/// A full state-store row written after a page is classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub doc_id: String,
    pub fingerprint: StateFingerprint,
    pub entity_type: String,
    pub source_path: String,
    pub last_classified_at: String,
}
