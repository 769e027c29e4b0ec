//! Shared types, error model, and configuration for wikiharvest.
//!
//! This crate is the foundation depended on by all other wikiharvest crates.
//! It provides:
//! - [`HarvestError`], the unified error type
//! - Domain records ([`WikiPageDoc`], [`PageRef`], [`RegistryRecord`], fingerprints)
//! - Configuration ([`AppConfig`], [`CrawlConfig`], [`ClassifyConfig`], config loading)
//! - Filename, canonical URL, and content hash policy ([`rules`])

pub mod config;
pub mod error;
pub mod rules;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CONFIG_ENV_VAR, ClassifyConfig, ClassifySection, CrawlConfig, CrawlSection,
    WikiConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    parse_config,
};
pub use error::{HarvestError, Result};
pub use rules::{
    build_canonical_url, compute_content_hash, make_filename, normalize_content,
    sanitize_filename,
};
pub use types::{
    CrawlSummary, HttpMeta, PageFingerprint, PageId, PageRef, RegistryRecord, RevisionId,
    RunContext, SourceMode, StateEntry, StateFingerprint, WikiPageDoc,
};
