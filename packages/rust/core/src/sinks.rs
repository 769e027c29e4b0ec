//! Classification outputs: JSONL label/review logs, the per-type document
//! mirror, and the run report.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};
use wikiharvest_shared::{HarvestError, Result};

use crate::ports::{ClassificationLabelRecord, ClassificationReport, ClassificationSink, ReportSink};

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JSONL
// ---------------------------------------------------------------------------

/// One JSON object per line; both files are truncated when the sink opens.
pub struct JsonlSink {
    labels_path: PathBuf,
    review_path: PathBuf,
    labels: Option<BufWriter<File>>,
    review: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(labels_path: &Path, review_path: &Path) -> Result<Self> {
        let open = |path: &Path| -> Result<BufWriter<File>> {
            create_parent(path)?;
            File::create(path)
                .map(BufWriter::new)
                .map_err(|e| HarvestError::io(path, e))
        };
        Ok(Self {
            labels: Some(open(labels_path)?),
            review: Some(open(review_path)?),
            labels_path: labels_path.to_path_buf(),
            review_path: review_path.to_path_buf(),
        })
    }
}

fn write_line(
    writer: Option<&mut BufWriter<File>>,
    path: &Path,
    record: &ClassificationLabelRecord,
) -> Result<()> {
    let writer = writer.ok_or_else(|| {
        HarvestError::validation(format!("{} is already closed", path.display()))
    })?;
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n").map_err(|e| HarvestError::io(path, e))
}

impl ClassificationSink for JsonlSink {
    fn write_label(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
        write_line(self.labels.as_mut(), &self.labels_path, record)
    }

    fn write_review(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
        write_line(self.review.as_mut(), &self.review_path, record)
    }

    fn close(&mut self) -> Result<()> {
        let labels = match self.labels.take() {
            Some(mut w) => w.flush().map_err(|e| HarvestError::io(&self.labels_path, e)),
            None => Ok(()),
        };
        let review = match self.review.take() {
            Some(mut w) => w.flush().map_err(|e| HarvestError::io(&self.review_path, e)),
            None => Ok(()),
        };
        labels.and(review)
    }
}

// ---------------------------------------------------------------------------
// Classified mirror
// ---------------------------------------------------------------------------

/// Copies each labeled source document to `<root>/<entity_type>/<file name>`,
/// adding `subtypes` and `is_ambiguous`. Source files are never modified.
///
/// A copy that cannot be written is logged and counted, never returned as an
/// error.
pub struct ClassifiedMirrorSink {
    root: PathBuf,
    copied: usize,
    skipped_invalid_source: usize,
    collision_renamed: usize,
    write_failed: usize,
    by_entity_type: BTreeMap<String, usize>,
}

impl ClassifiedMirrorSink {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| HarvestError::io(root, e))?;
        info!(root = %root.display(), "classified mirror initialized");
        Ok(Self {
            root: root.to_path_buf(),
            copied: 0,
            skipped_invalid_source: 0,
            collision_renamed: 0,
            write_failed: 0,
            by_entity_type: BTreeMap::new(),
        })
    }

    pub fn copied(&self) -> usize {
        self.copied
    }

    pub fn collision_renamed(&self) -> usize {
        self.collision_renamed
    }

    pub fn skipped_invalid_source(&self) -> usize {
        self.skipped_invalid_source
    }

    pub fn write_failed(&self) -> usize {
        self.write_failed
    }

    fn copy_into(
        &mut self,
        entity_type: &str,
        file_name: &str,
        payload: serde_json::Map<String, Value>,
        record: &ClassificationLabelRecord,
    ) -> Result<()> {
        let entity_dir = self.root.join(entity_type);
        std::fs::create_dir_all(&entity_dir).map_err(|e| HarvestError::io(&entity_dir, e))?;
        warn_legacy_names(&entity_dir, file_name, entity_type);

        let target = resolve_target(&entity_dir, file_name, record);
        if target.file_name() != Some(std::ffi::OsStr::new(file_name)) {
            self.collision_renamed += 1;
        }

        let mut json = serde_json::to_string_pretty(&Value::Object(payload))?;
        json.push('\n');
        std::fs::write(&target, json).map_err(|e| HarvestError::io(&target, e))
    }

    fn skip(&mut self, record: &ClassificationLabelRecord, why: &str) {
        self.skipped_invalid_source += 1;
        warn!(doc_id = %record.doc_id, source_path = %record.source_path, why, "skipping classified copy");
    }
}

impl ClassificationSink for ClassifiedMirrorSink {
    fn write_label(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
        let source = Path::new(&record.source_path);
        let is_json = source
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let Some(file_name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            self.skip(record, "no file name");
            return Ok(());
        };
        if !is_json || !source.is_file() {
            self.skip(record, "source is not an existing .json file");
            return Ok(());
        }

        let payload = std::fs::read_to_string(source)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());
        let Some(Value::Object(mut payload)) = payload else {
            self.skip(record, "source is not a JSON object");
            return Ok(());
        };
        payload.insert("subtypes".into(), Value::from(record.subtypes.clone()));
        payload.insert("is_ambiguous".into(), Value::Bool(record.is_ambiguous));

        let entity_type = record.entity_type.as_str();
        match self.copy_into(entity_type, &file_name, payload, record) {
            Ok(()) => {
                self.copied += 1;
                *self.by_entity_type.entry(entity_type.to_string()).or_default() += 1;
            }
            Err(e) => {
                self.write_failed += 1;
                warn!(doc_id = %record.doc_id, error = %e, "classified copy failed");
            }
        }
        Ok(())
    }

    fn write_review(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
        debug!(doc_id = %record.doc_id, "review rows are not mirrored");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        info!(
            root = %self.root.display(),
            copied = self.copied,
            skipped_invalid_source = self.skipped_invalid_source,
            collision_renamed = self.collision_renamed,
            write_failed = self.write_failed,
            by_entity_type = ?self.by_entity_type,
            "classified mirror closed"
        );
        Ok(())
    }
}

/// Same name as the source, unless that slot holds a different document,
/// in which case the page id (or doc id) is appended to the stem.
fn resolve_target(entity_dir: &Path, file_name: &str, record: &ClassificationLabelRecord) -> PathBuf {
    let candidate = entity_dir.join(file_name);
    if !candidate.exists() || is_same_document(&candidate, record) {
        return candidate;
    }

    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "json".into());
    let unique = match record.pageid {
        Some(id) => id.to_string(),
        None => record.doc_id.clone(),
    };
    entity_dir.join(format!("{stem}_{unique}.{ext}"))
}

fn is_same_document(path: &Path, record: &ClassificationLabelRecord) -> bool {
    let Some(existing) = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
    else {
        return false;
    };

    let scalar = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if let (Some(pageid), Some(existing_id)) = (record.pageid, existing.get("pageid")) {
        if !existing_id.is_null() && scalar(existing_id) == pageid.to_string() {
            return true;
        }
    }
    existing
        .get("doc_id")
        .is_some_and(|d| scalar(d) == record.doc_id)
}

/// Older runs named collisions `<stem>__<digits>.json`.
fn warn_legacy_names(entity_dir: &Path, file_name: &str, entity_type: &str) {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Ok(entries) = std::fs::read_dir(entity_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_legacy = name
            .strip_prefix(stem.as_str())
            .and_then(|rest| rest.strip_prefix("__"))
            .and_then(|rest| rest.strip_suffix(".json"))
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()));
        if is_legacy {
            warn!(
                entity_type,
                legacy_filename = %name,
                recommended_pattern = %format!("{stem}_<id>.json"),
                "legacy classified filename detected"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Fans every write out to two sinks. Closing closes both even if the first fails.
pub struct CompositeSink<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> CompositeSink<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &A {
        &self.primary
    }

    pub fn secondary(&self) -> &B {
        &self.secondary
    }
}

impl<A: ClassificationSink, B: ClassificationSink> ClassificationSink for CompositeSink<A, B> {
    fn write_label(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
        self.primary.write_label(record)?;
        self.secondary.write_label(record)
    }

    fn write_review(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
        self.primary.write_review(record)?;
        self.secondary.write_review(record)
    }

    fn close(&mut self) -> Result<()> {
        let primary = self.primary.close();
        let secondary = self.secondary.close();
        primary.and(secondary)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Writes the run report as pretty JSON, replacing any previous report.
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl ReportSink for JsonReportSink {
    fn write_report(&self, report: &ClassificationReport) -> Result<()> {
        create_parent(&self.path)?;
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&self.path, json).map_err(|e| HarvestError::io(&self.path, e))?;
        info!(path = %self.path.display(), "classification report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wikiharvest_classifier::EntityType;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wh_{label}_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(pageid: Option<u64>, source_path: &Path, entity_type: EntityType) -> ClassificationLabelRecord {
        ClassificationLabelRecord {
            doc_id: pageid.map_or_else(|| "Untitled".to_string(), |id| id.to_string()),
            pageid,
            title: "Page".into(),
            revision_id: Some(1),
            canonical_url: None,
            entity_type,
            subtypes: vec!["rarity:rare".into()],
            confidence: 1.0,
            reasons: vec![],
            matched_rules: vec![],
            strategy_version: "test".into(),
            source_path: source_path.to_string_lossy().into_owned(),
            is_redirect: false,
            parse_warning: None,
            is_ambiguous: false,
        }
    }

    #[test]
    fn jsonl_writes_one_line_per_record_and_rejects_after_close() {
        let dir = temp_dir("sink_jsonl");
        let labels = dir.join("out/labels.jsonl");
        let review = dir.join("out/review.jsonl");
        let mut sink = JsonlSink::create(&labels, &review).unwrap();

        let row = record(Some(1), &dir.join("x.json"), EntityType::Cat);
        sink.write_label(&row).unwrap();
        sink.write_label(&row).unwrap();
        sink.write_review(&row).unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read_to_string(&labels).unwrap().lines().count(), 2);
        let line = std::fs::read_to_string(&review).unwrap();
        let parsed: ClassificationLabelRecord = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed, row);

        assert!(sink.write_label(&row).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mirror_copies_with_subtypes_and_leaves_source_alone() {
        let dir = temp_dir("sink_mirror");
        let source = dir.join("Cat_1.json");
        std::fs::write(&source, r#"{"pageid": 1, "title": "Cat"}"#).unwrap();

        let mut mirror = ClassifiedMirrorSink::new(&dir.join("classified")).unwrap();
        mirror.write_label(&record(Some(1), &source, EntityType::Cat)).unwrap();

        let copied: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.join("classified/cat/Cat_1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(copied["subtypes"][0], "rarity:rare");
        assert_eq!(copied["is_ambiguous"], false);

        let original: Value = serde_json::from_str(&std::fs::read_to_string(&source).unwrap()).unwrap();
        assert!(original.get("subtypes").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mirror_overwrites_same_document_and_renames_collisions() {
        let dir = temp_dir("sink_collide");
        let first_dir = dir.join("a");
        let second_dir = dir.join("b");
        std::fs::create_dir_all(&first_dir).unwrap();
        std::fs::create_dir_all(&second_dir).unwrap();

        let first = first_dir.join("Stage.json");
        let second = second_dir.join("Stage.json");
        std::fs::write(&first, r#"{"pageid": 1}"#).unwrap();
        std::fs::write(&second, r#"{"pageid": 2}"#).unwrap();

        let root = dir.join("classified");
        let mut mirror = ClassifiedMirrorSink::new(&root).unwrap();
        mirror.write_label(&record(Some(1), &first, EntityType::Stage)).unwrap();
        mirror.write_label(&record(Some(1), &first, EntityType::Stage)).unwrap();
        assert_eq!(mirror.collision_renamed(), 0);

        mirror.write_label(&record(Some(2), &second, EntityType::Stage)).unwrap();
        assert_eq!(mirror.collision_renamed(), 1);
        assert_eq!(mirror.copied(), 3);

        assert!(root.join("stage/Stage.json").exists());
        let renamed: Value = serde_json::from_str(
            &std::fs::read_to_string(root.join("stage/Stage_2.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(renamed["pageid"], 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mirror_write_failures_do_not_abort() {
        let dir = temp_dir("sink_mirror_fail");
        let source = dir.join("Cat_1.json");
        std::fs::write(&source, r#"{"pageid": 1}"#).unwrap();
        let root = dir.join("classified");

        let mut mirror = ClassifiedMirrorSink::new(&root).unwrap();
        // A plain file where the entity directory should go.
        std::fs::write(root.join("cat"), "").unwrap();

        mirror.write_label(&record(Some(1), &source, EntityType::Cat)).unwrap();
        assert_eq!(mirror.write_failed(), 1);
        assert_eq!(mirror.copied(), 0);
        assert!(mirror.close().is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mirror_skips_sources_it_cannot_copy() {
        let dir = temp_dir("sink_skip");
        let broken = dir.join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();

        let mut mirror = ClassifiedMirrorSink::new(&dir.join("classified")).unwrap();
        mirror
            .write_label(&record(Some(1), Path::new("registry:db:1"), EntityType::Cat))
            .unwrap();
        mirror.write_label(&record(Some(2), &dir.join("absent.json"), EntityType::Cat)).unwrap();
        mirror.write_label(&record(Some(3), &broken, EntityType::Cat)).unwrap();

        assert_eq!(mirror.skipped_invalid_source(), 3);
        assert_eq!(mirror.copied(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    struct FailingClose;

    impl ClassificationSink for FailingClose {
        fn write_label(&mut self, _record: &ClassificationLabelRecord) -> Result<()> {
            Ok(())
        }
        fn write_review(&mut self, _record: &ClassificationLabelRecord) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Err(HarvestError::validation("close failed"))
        }
    }

    #[test]
    fn composite_closes_secondary_when_primary_fails() {
        let dir = temp_dir("sink_composite");
        let labels = dir.join("labels.jsonl");
        let jsonl = JsonlSink::create(&labels, &dir.join("review.jsonl")).unwrap();
        let mut sink = CompositeSink::new(FailingClose, jsonl);

        sink.write_label(&record(Some(1), &dir.join("x.json"), EntityType::Cat)).unwrap();
        assert!(sink.close().is_err());

        // The secondary was flushed even though the primary failed.
        assert_eq!(std::fs::read_to_string(&labels).unwrap().lines().count(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
