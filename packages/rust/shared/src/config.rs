//! Application configuration for wikiharvest.
//!
//! User config lives at `~/.wikiharvest/wikiharvest.toml` unless
//! `WIKIHARVEST_CONFIG` points elsewhere.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::types::SourceMode;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "wikiharvest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".wikiharvest";

// ---------------------------------------------------------------------------
// Config structs (matching wikiharvest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Target wiki endpoints.
    #[serde(default)]
    pub wiki: WikiConfig,

    /// Crawl tuning and output locations.
    #[serde(default)]
    pub crawl: CrawlSection,

    /// Classification inputs, outputs, and thresholds.
    #[serde(default)]
    pub classify: ClassifySection,
}

/// `[wiki]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiConfig {
    /// MediaWiki `api.php` endpoint.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base for canonical page URLs; the encoded title is appended.
    #[serde(default = "default_wiki_root_url")]
    pub wiki_root_url: String,

    /// Source name recorded on every fetched document.
    #[serde(default = "default_source_name")]
    pub source_name: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WikiConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            wiki_root_url: default_wiki_root_url(),
            source_name: default_source_name(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_url() -> String {
    "https://battlecats.miraheze.org/w/api.php".into()
}
fn default_wiki_root_url() -> String {
    "https://battlecats.miraheze.org/wiki/".into()
}
fn default_source_name() -> String {
    "battlecats.miraheze.org".into()
}
fn default_user_agent() -> String {
    concat!("wikiharvest/", env!("CARGO_PKG_VERSION")).into()
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    /// Maximum in-flight page fetches.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pages per chunk; a politeness pause follows each chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_polite_delay_ms")]
    pub polite_delay_ms: u64,

    /// Total attempts per API request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit; attempt `n` waits `base * 2^n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Directory receiving one JSON document per page.
    #[serde(default = "default_page_dir")]
    pub output_dir: String,

    #[serde(default = "default_registry_path")]
    pub registry_path: String,

    /// Directory receiving `api_calls_<run_id>.jsonl` audit logs.
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,

    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunk_size: default_chunk_size(),
            polite_delay_ms: default_polite_delay_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            timeout_secs: default_timeout_secs(),
            output_dir: default_page_dir(),
            registry_path: default_registry_path(),
            audit_dir: default_audit_dir(),
            audit: true,
        }
    }
}

fn default_concurrency() -> usize {
    5
}
fn default_chunk_size() -> usize {
    50
}
fn default_polite_delay_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_timeout_secs() -> u64 {
    45
}
fn default_page_dir() -> String {
    "artifacts/raw/wiki/page".into()
}
fn default_registry_path() -> String {
    "artifacts/raw/wiki/wiki_registry.db".into()
}
fn default_audit_dir() -> String {
    "artifacts/raw/wiki/api_calls".into()
}
fn default_true() -> bool {
    true
}

/// `[classify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifySection {
    #[serde(default)]
    pub source_mode: SourceMode,

    /// Page JSON directory read in `html` mode.
    #[serde(default = "default_page_dir")]
    pub input_dir: String,

    /// Registry database read in `registry` mode.
    #[serde(default = "default_registry_path")]
    pub registry_path: String,

    #[serde(default = "default_labels_path")]
    pub labels_path: String,

    #[serde(default = "default_review_path")]
    pub review_path: String,

    #[serde(default = "default_report_path")]
    pub report_path: String,

    /// Root of the per-entity-type mirror. Empty means `<input_dir>/classified`.
    #[serde(default = "default_classified_root")]
    pub classified_root: String,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Pages below this confidence go to the review queue.
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,

    /// Best-versus-runner-up gap below which a page is ambiguous.
    #[serde(default = "default_low_margin_threshold")]
    pub low_margin_threshold: f64,

    #[serde(default = "default_true")]
    pub include_redirects: bool,

    #[serde(default = "default_true")]
    pub incremental: bool,

    #[serde(default)]
    pub full_rebuild: bool,
}

impl Default for ClassifySection {
    fn default() -> Self {
        Self {
            source_mode: SourceMode::default(),
            input_dir: default_page_dir(),
            registry_path: default_registry_path(),
            labels_path: default_labels_path(),
            review_path: default_review_path(),
            report_path: default_report_path(),
            classified_root: default_classified_root(),
            state_path: default_state_path(),
            low_confidence_threshold: default_low_confidence_threshold(),
            low_margin_threshold: default_low_margin_threshold(),
            include_redirects: true,
            incremental: true,
            full_rebuild: false,
        }
    }
}

fn default_labels_path() -> String {
    "artifacts/classified/page_labels.jsonl".into()
}
fn default_review_path() -> String {
    "artifacts/classified/review_queue.jsonl".into()
}
fn default_report_path() -> String {
    "artifacts/classified/classification_report.json".into()
}
fn default_classified_root() -> String {
    "artifacts/classified/wiki".into()
}
fn default_state_path() -> String {
    "artifacts/classified/classification_state.db".into()
}
fn default_low_confidence_threshold() -> f64 {
    0.5
}
fn default_low_margin_threshold() -> f64 {
    0.15
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub api_url: String,
    pub wiki_root_url: String,
    pub source_name: String,
    pub user_agent: String,
    pub concurrency: usize,
    pub chunk_size: usize,
    pub polite_delay: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub output_dir: PathBuf,
    pub registry_path: PathBuf,
    /// `None` disables the raw API audit log.
    pub audit_dir: Option<PathBuf>,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        let crawl = &config.crawl;
        Self {
            api_url: config.wiki.api_url.clone(),
            wiki_root_url: config.wiki.wiki_root_url.clone(),
            source_name: config.wiki.source_name.clone(),
            user_agent: config.wiki.user_agent.clone(),
            concurrency: crawl.concurrency.max(1),
            chunk_size: crawl.chunk_size.max(1),
            polite_delay: Duration::from_millis(crawl.polite_delay_ms),
            max_attempts: crawl.max_attempts.max(1),
            backoff_base: Duration::from_millis(crawl.backoff_base_ms),
            connect_timeout: Duration::from_secs(crawl.connect_timeout_secs),
            timeout: Duration::from_secs(crawl.timeout_secs),
            output_dir: PathBuf::from(&crawl.output_dir),
            registry_path: PathBuf::from(&crawl.registry_path),
            audit_dir: crawl.audit.then(|| PathBuf::from(&crawl.audit_dir)),
        }
    }
}

/// Runtime classification configuration.
#[derive(Debug, Clone)]
pub struct ClassifyConfig {
    pub source_mode: SourceMode,
    pub input_dir: PathBuf,
    pub registry_path: PathBuf,
    pub labels_path: PathBuf,
    pub review_path: PathBuf,
    pub report_path: PathBuf,
    pub classified_root: Option<PathBuf>,
    pub state_path: PathBuf,
    pub low_confidence_threshold: f64,
    pub low_margin_threshold: f64,
    pub include_redirects: bool,
    pub incremental: bool,
    pub full_rebuild: bool,
}

impl From<&AppConfig> for ClassifyConfig {
    fn from(config: &AppConfig) -> Self {
        let c = &config.classify;
        Self {
            source_mode: c.source_mode,
            input_dir: PathBuf::from(&c.input_dir),
            registry_path: PathBuf::from(&c.registry_path),
            labels_path: PathBuf::from(&c.labels_path),
            review_path: PathBuf::from(&c.review_path),
            report_path: PathBuf::from(&c.report_path),
            classified_root: (!c.classified_root.trim().is_empty())
                .then(|| PathBuf::from(&c.classified_root)),
            state_path: PathBuf::from(&c.state_path),
            low_confidence_threshold: c.low_confidence_threshold,
            low_margin_threshold: c.low_margin_threshold,
            include_redirects: c.include_redirects,
            incremental: c.incremental,
            full_rebuild: c.full_rebuild,
        }
    }
}

impl ClassifyConfig {
    /// Whether the run needs the classification state store at all.
    pub fn uses_state(&self) -> bool {
        self.incremental || self.full_rebuild
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "WIKIHARVEST_CONFIG";

/// `~/.wikiharvest/`.
pub fn config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME))
        .ok_or_else(|| HarvestError::config("no home directory for the config file"))
}

/// Resolved config file location: `$WIKIHARVEST_CONFIG` if set, else `~/.wikiharvest/wikiharvest.toml`.
pub fn config_file_path() -> Result<PathBuf> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(explicit) if !explicit.is_empty() => Ok(PathBuf::from(explicit)),
        _ => Ok(config_dir()?.join(CONFIG_FILE_NAME)),
    }
}

/// Load the config from its resolved location, falling back to defaults when absent.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;
    if path.is_file() {
        return load_config_from(&path);
    }
    tracing::debug!(path = %path.display(), "no config file, using defaults");
    Ok(AppConfig::default())
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;
    parse_config(&raw)
        .map_err(|e| HarvestError::config(format!("{}: {e}", path.display())))
}

/// Parse TOML text into an [`AppConfig`]; missing keys take their defaults.
pub fn parse_config(raw: &str) -> std::result::Result<AppConfig, toml::de::Error> {
    toml::from_str(raw)
}

/// Write a default config file and return its path.
///
/// An existing file is left untouched and reported as a config error.
pub fn init_config() -> Result<PathBuf> {
    let path = config_file_path()?;
    if path.exists() {
        return Err(HarvestError::config(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
    }

    let body = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| HarvestError::config(e.to_string()))?;
    std::fs::write(&path, body).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(path = %path.display(), "wrote default config");

    Ok(path)
}
