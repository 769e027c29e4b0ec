//! Capabilities the classification pipeline depends on.
//!
//! The pipeline only sees these traits; concrete sources, sinks, and state
//! stores live in [`crate::sources`], [`crate::sinks`], and the storage crate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use wikiharvest_classifier::{Classification, EntityType, WikiPage};
use wikiharvest_shared::{PageId, RegistryRecord, Result, RevisionId, StateEntry, StateFingerprint};
use wikiharvest_storage::ClassificationStateStore;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A discovered but not yet loaded page.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRef {
    /// File stem or page id.
    pub source_id: String,
    /// Path of the page document; may be empty for registry rows.
    pub location: String,
    /// Registry row the reference came from, if any.
    pub metadata: Option<RegistryRecord>,
}

/// A page ready for classification plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPage {
    pub page: WikiPage,
    pub source_path: String,
    /// Set when the page was recovered from a damaged or incomplete source.
    pub parse_warning: Option<String>,
}

/// One line of the label and review logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationLabelRecord {
    pub doc_id: String,
    pub pageid: Option<PageId>,
    pub title: String,
    pub revision_id: Option<RevisionId>,
    pub canonical_url: Option<String>,
    pub entity_type: EntityType,
    pub subtypes: Vec<String>,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub matched_rules: Vec<String>,
    pub strategy_version: String,
    pub source_path: String,
    pub is_redirect: bool,
    pub parse_warning: Option<String>,
    pub is_ambiguous: bool,
}

impl ClassificationLabelRecord {
    pub fn new(loaded: &LoadedPage, classification: &Classification) -> Self {
        let page = &loaded.page;
        Self {
            doc_id: page.doc_id(),
            pageid: page.pageid,
            title: page.title.clone(),
            revision_id: page.revid,
            canonical_url: page.canonical_url.clone(),
            entity_type: classification.entity_type,
            subtypes: classification.subtypes.clone(),
            confidence: classification.confidence,
            reasons: classification.reasons.clone(),
            matched_rules: classification.matched_rules.clone(),
            strategy_version: classification.strategy_version.clone(),
            source_path: loaded.source_path.clone(),
            is_redirect: page.is_redirect,
            parse_warning: loaded.parse_warning.clone(),
            is_ambiguous: classification.is_ambiguous,
        }
    }
}

/// How the state store was (or was not) made available to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreStatus {
    /// Neither incremental nor full-rebuild mode was requested.
    Disabled,
    Opened,
    /// A corrupt store was quarantined and recreated.
    Recovered,
    /// The store could not be opened; the run classified every page without state.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStoreReport {
    pub path: String,
    pub status: StateStoreStatus,
    pub recovered_from: Option<String>,
    pub error: Option<String>,
}

impl StateStoreReport {
    pub fn new(path: impl Into<String>, status: StateStoreStatus) -> Self {
        Self {
            path: path.into(),
            status,
            recovered_from: None,
            error: None,
        }
    }
}

/// Run summary written to `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub run_id: String,
    pub source_mode: String,
    pub total_discovered: usize,
    pub loaded_ok: usize,
    pub classified_count: usize,
    pub skipped_unchanged: usize,
    pub skipped_redirects: usize,
    pub load_error_count: usize,
    pub parse_warning_count: usize,
    pub misc_count: usize,
    pub low_conf_count: usize,
    pub conflict_count: usize,
    pub by_entity_type: BTreeMap<String, usize>,
    pub incremental: bool,
    pub full_rebuild: bool,
    pub state_store: StateStoreReport,
    pub duration_ms: u64,
    pub generated_at: String,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Where pages to classify come from.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    /// References in processing order, without parsing page bodies.
    async fn discover(&self) -> Result<Vec<SourceRef>>;

    /// Load one page. An `Err` means the page could not be read at all.
    async fn load(&self, source_ref: &SourceRef) -> Result<LoadedPage>;
}

/// Receives one record per classified page, plus the review subset.
pub trait ClassificationSink {
    fn write_label(&mut self, record: &ClassificationLabelRecord) -> Result<()>;
    fn write_review(&mut self, record: &ClassificationLabelRecord) -> Result<()>;
    /// Flush and release. Further writes fail.
    fn close(&mut self) -> Result<()>;
}

pub trait ReportSink {
    fn write_report(&self, report: &ClassificationReport) -> Result<()>;
}

/// Persisted fingerprints keyed by document id.
#[allow(async_fn_in_trait)]
pub trait StateStore {
    async fn get(&self, doc_id: &str) -> Result<Option<StateFingerprint>>;
    async fn upsert(&self, entry: &StateEntry) -> Result<()>;
}

impl StateStore for ClassificationStateStore {
    async fn get(&self, doc_id: &str) -> Result<Option<StateFingerprint>> {
        ClassificationStateStore::get(self, doc_id).await
    }

    async fn upsert(&self, entry: &StateEntry) -> Result<()> {
        ClassificationStateStore::upsert(self, entry).await
    }
}
