//! Page sources: downloaded JSON documents on disk, or the crawl registry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, warn};
use wikiharvest_classifier::WikiPage;
use wikiharvest_shared::{HarvestError, RegistryRecord, Result};
use wikiharvest_storage::Registry;

use crate::ports::{LoadedPage, PageSource, SourceRef};

// ---------------------------------------------------------------------------
// File source
// ---------------------------------------------------------------------------

/// Reads every `*.json` page document in one directory.
#[derive(Debug, Clone)]
pub struct FilePageSource {
    input_dir: PathBuf,
}

impl FilePageSource {
    pub fn new(input_dir: &Path) -> Self {
        Self {
            input_dir: input_dir.to_path_buf(),
        }
    }

    /// Parse one page document, falling back to pattern extraction on malformed JSON.
    pub fn load_file(path: &Path) -> Result<LoadedPage> {
        let bytes = std::fs::read(path).map_err(|e| HarvestError::io(path, e))?;
        let raw = String::from_utf8_lossy(&bytes);

        let (fields, parse_warning) = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(fields)) => (fields, None),
            Ok(_) => {
                return Err(HarvestError::parse(format!(
                    "{} is not a JSON object",
                    path.display()
                )));
            }
            Err(e) => {
                let warning = format!("json_decode_error:{e}");
                warn!(path = %path.display(), %warning, "malformed page JSON, using fallback extractor");
                (fallback_extract(&raw), Some(warning))
            }
        };

        Ok(LoadedPage {
            page: page_from_fields(&fields),
            source_path: path.to_string_lossy().into_owned(),
            parse_warning,
        })
    }
}

impl PageSource for FilePageSource {
    async fn discover(&self) -> Result<Vec<SourceRef>> {
        let entries = match std::fs::read_dir(&self.input_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %self.input_dir.display(), "input directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(HarvestError::io(&self.input_dir, e)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let refs: Vec<SourceRef> = paths
            .into_iter()
            .map(|path| SourceRef {
                source_id: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                location: path.to_string_lossy().into_owned(),
                metadata: None,
            })
            .collect();

        info!(pages = refs.len(), dir = %self.input_dir.display(), "file source discovered pages");
        Ok(refs)
    }

    async fn load(&self, source_ref: &SourceRef) -> Result<LoadedPage> {
        Self::load_file(Path::new(&source_ref.location))
    }
}

// ---------------------------------------------------------------------------
// Registry source
// ---------------------------------------------------------------------------

/// Walks the crawl registry, loading each row's document file when present.
pub struct RegistryPageSource {
    registry: Registry,
}

impl RegistryPageSource {
    /// Open an existing registry. A missing file is a configuration error.
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarvestError::config(format!(
                "registry not found at {}",
                path.display()
            )));
        }
        Ok(Self {
            registry: Registry::open(path).await?,
        })
    }

    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Build a page from registry columns alone.
    fn metadata_page(&self, source_ref: &SourceRef, record: &RegistryRecord) -> LoadedPage {
        warn!(
            source_id = %source_ref.source_id,
            db = %self.registry.path().display(),
            "document file missing, using registry metadata"
        );
        LoadedPage {
            page: WikiPage {
                pageid: Some(record.page_id),
                title: record.title.clone(),
                revid: record.last_revid,
                categories: record.categories.clone(),
                ..Default::default()
            },
            source_path: format!(
                "registry:{}:{}",
                self.registry.path().display(),
                source_ref.source_id
            ),
            parse_warning: Some("missing_file_path".into()),
        }
    }
}

impl PageSource for RegistryPageSource {
    async fn discover(&self) -> Result<Vec<SourceRef>> {
        let records = self.registry.list().await?;
        let refs: Vec<SourceRef> = records
            .into_iter()
            .map(|record| SourceRef {
                source_id: record.page_id.to_string(),
                location: record.file_path.clone().unwrap_or_default(),
                metadata: Some(record),
            })
            .collect();

        info!(
            pages = refs.len(),
            db = %self.registry.path().display(),
            "registry source discovered pages"
        );
        Ok(refs)
    }

    async fn load(&self, source_ref: &SourceRef) -> Result<LoadedPage> {
        let location = Path::new(&source_ref.location);
        if !source_ref.location.is_empty() && location.exists() {
            return FilePageSource::load_file(location);
        }
        match &source_ref.metadata {
            Some(record) => Ok(self.metadata_page(source_ref, record)),
            None => Err(HarvestError::validation(format!(
                "registry reference {} has no metadata",
                source_ref.source_id
            ))),
        }
    }
}

/// Either source, chosen at runtime from the configured source mode.
pub enum AnyPageSource {
    Files(FilePageSource),
    Registry(RegistryPageSource),
}

impl PageSource for AnyPageSource {
    async fn discover(&self) -> Result<Vec<SourceRef>> {
        match self {
            Self::Files(source) => source.discover().await,
            Self::Registry(source) => source.discover().await,
        }
    }

    async fn load(&self, source_ref: &SourceRef) -> Result<LoadedPage> {
        match self {
            Self::Files(source) => source.load(source_ref).await,
            Self::Registry(source) => source.load(source_ref).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Field mapping
// ---------------------------------------------------------------------------

fn page_from_fields(fields: &Map<String, Value>) -> WikiPage {
    let categories: BTreeSet<String> = fields
        .get("categories")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|c| value_to_string(c).trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    WikiPage {
        pageid: fields.get("pageid").and_then(value_to_u64),
        title: fields.get("title").map(value_to_string).unwrap_or_default(),
        revid: fields.get("revid").and_then(value_to_u64),
        timestamp: fields.get("timestamp").and_then(Value::as_str).map(String::from),
        canonical_url: fields
            .get("canonical_url")
            .and_then(Value::as_str)
            .map(String::from),
        categories: categories.into_iter().collect(),
        content: fields
            .get("content")
            .map(value_to_string)
            .unwrap_or_default(),
        is_redirect: fields
            .get("is_redirect")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Integer ids stored as numbers or numeric strings.
fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Fallback extraction
// ---------------------------------------------------------------------------

static PAGEID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""pageid"\s*:\s*(\d+)"#).expect("valid regex"));
static REVID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""revid"\s*:\s*(\d+)"#).expect("valid regex"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""title"\s*:\s*"([^"\n]*)""#).expect("valid regex"));
static TIMESTAMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""timestamp"\s*:\s*"([^"\n]*)""#).expect("valid regex"));
static CANONICAL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""canonical_url"\s*:\s*"([^"\n]*)""#).expect("valid regex"));
static CATEGORIES_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)"categories"\s*:\s*\[(.*?)\]"#).expect("valid regex"));
static CATEGORY_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(Category:[^"\n]+)""#).expect("valid regex"));
static IS_REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"is_redirect"\s*:\s*(true|false)"#).expect("valid regex"));

/// Recover the simple scalar fields of a damaged page document.
fn fallback_extract(raw: &str) -> Map<String, Value> {
    let capture = |re: &Regex| re.captures(raw).map(|c| c[1].to_string());
    let number = |re: &Regex| {
        capture(re)
            .and_then(|s| s.parse::<u64>().ok())
            .map_or(Value::Null, Value::from)
    };
    let text = |re: &Regex| capture(re).map_or(Value::Null, Value::String);

    let categories: Vec<Value> = CATEGORIES_BLOCK_RE
        .captures(raw)
        .map(|block| {
            CATEGORY_ITEM_RE
                .captures_iter(&block[1])
                .map(|c| Value::String(c[1].to_string()))
                .collect()
        })
        .unwrap_or_default();

    let is_redirect = capture(&IS_REDIRECT_RE).is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let mut fields = Map::new();
    fields.insert("pageid".into(), number(&PAGEID_RE));
    fields.insert(
        "title".into(),
        Value::String(capture(&TITLE_RE).unwrap_or_else(|| "unknown".into())),
    );
    fields.insert("revid".into(), number(&REVID_RE));
    fields.insert("timestamp".into(), text(&TIMESTAMP_RE));
    fields.insert("canonical_url".into(), text(&CANONICAL_URL_RE));
    fields.insert("categories".into(), Value::Array(categories));
    fields.insert("content".into(), Value::String(String::new()));
    fields.insert("is_redirect".into(), Value::Bool(is_redirect));
    fields
}
