//! End-to-end runs: build every component from configuration and execute.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use wikiharvest_classifier::RuleBasedClassifier;
use wikiharvest_crawler::{ApiCallLog, CrawlProgress, CrawlWorkflow, DocumentStore, MediaWikiClient};
use wikiharvest_shared::{ClassifyConfig, CrawlConfig, CrawlSummary, Result, RunContext, SourceMode};
use wikiharvest_storage::{ClassificationStateStore, OpenOutcome, Registry};

use crate::pipeline::{ClassificationPipeline, PipelineOptions};
use crate::ports::{ClassificationReport, StateStoreReport, StateStoreStatus};
use crate::sinks::{ClassifiedMirrorSink, CompositeSink, JsonReportSink, JsonlSink};
use crate::sources::{AnyPageSource, FilePageSource, RegistryPageSource};

// ---------------------------------------------------------------------------
// Crawl
// ---------------------------------------------------------------------------

fn build_client(config: &CrawlConfig, run: &RunContext) -> Result<(MediaWikiClient, Option<Arc<ApiCallLog>>)> {
    let mut client = MediaWikiClient::new(config, run)?;
    let audit = match &config.audit_dir {
        Some(dir) => {
            let log = Arc::new(ApiCallLog::open(dir, &run.run_id)?);
            info!(path = %log.path().display(), "auditing API calls");
            client = client.with_audit(log.clone());
            Some(log)
        }
        None => None,
    };
    Ok((client, audit))
}

/// Discover, diff against the registry, and fetch new or changed pages.
#[instrument(skip_all, fields(run_id = %run.run_id))]
pub async fn run_crawl(
    config: &CrawlConfig,
    run: &RunContext,
    progress: &dyn CrawlProgress,
) -> Result<CrawlSummary> {
    let (client, audit) = build_client(config, run)?;
    let store = DocumentStore::new(&config.output_dir)?;
    let registry = Registry::open(&config.registry_path).await?;

    let workflow = CrawlWorkflow::new(client, store, registry, config);
    let result = workflow.run(progress).await;

    if let Some(log) = audit {
        log.close().await;
    }
    result
}

/// List every category on the wiki.
#[instrument(skip_all, fields(run_id = %run.run_id))]
pub async fn run_categories(config: &CrawlConfig, run: &RunContext) -> Result<Vec<String>> {
    let (client, audit) = build_client(config, run)?;
    let categories = client.fetch_categories().await;
    if let Some(log) = audit {
        log.close().await;
    }
    Ok(categories)
}

// ---------------------------------------------------------------------------
// Classify
// ---------------------------------------------------------------------------

/// Open the state store if the run needs one. Failure degrades to a stateless run.
async fn open_state(config: &ClassifyConfig) -> (Option<ClassificationStateStore>, StateStoreReport) {
    let path = config.state_path.display().to_string();
    if !config.uses_state() {
        return (None, StateStoreReport::new(path, StateStoreStatus::Disabled));
    }

    match ClassificationStateStore::open_with_recovery(&config.state_path).await {
        Ok((store, OpenOutcome::Opened)) => {
            (Some(store), StateStoreReport::new(path, StateStoreStatus::Opened))
        }
        Ok((store, OpenOutcome::Recovered { quarantined })) => {
            warn!(quarantined = %quarantined.display(), "classification state was rebuilt from scratch");
            let mut report = StateStoreReport::new(path, StateStoreStatus::Recovered);
            report.recovered_from = Some(quarantined.display().to_string());
            (Some(store), report)
        }
        Err(e) => {
            warn!(%path, error = %e, "classification state unavailable, classifying every page");
            let mut report = StateStoreReport::new(path, StateStoreStatus::Unavailable);
            report.error = Some(e.to_string());
            (None, report)
        }
    }
}

/// Classify every page from the configured source and write all outputs.
#[instrument(skip_all, fields(run_id = %run.run_id, source_mode = %config.source_mode))]
pub async fn run_classify(config: &ClassifyConfig, run: &RunContext) -> Result<ClassificationReport> {
    let source = match config.source_mode {
        SourceMode::Html => AnyPageSource::Files(FilePageSource::new(&config.input_dir)),
        SourceMode::Registry => {
            AnyPageSource::Registry(RegistryPageSource::open(&config.registry_path).await?)
        }
    };

    let (state, state_report) = open_state(config).await;

    let mirror_root = config
        .classified_root
        .clone()
        .unwrap_or_else(|| config.input_dir.join("classified"));
    let sink = CompositeSink::new(
        JsonlSink::create(&config.labels_path, &config.review_path)?,
        ClassifiedMirrorSink::new(&mirror_root)?,
    );

    let mut pipeline = ClassificationPipeline::new(
        source,
        RuleBasedClassifier::new(config.low_margin_threshold),
        sink,
        JsonReportSink::new(&config.report_path),
        state,
        state_report,
    );
    pipeline.run(run, &PipelineOptions::from(config)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use serde_json::json;
    use uuid::Uuid;
    use wikiharvest_shared::AppConfig;

    struct Workspace {
        root: PathBuf,
        config: ClassifyConfig,
    }

    impl Workspace {
        fn new(label: &str) -> Self {
            let root = std::env::temp_dir().join(format!("wh_{label}_{}", Uuid::now_v7()));
            let input = root.join("page");
            std::fs::create_dir_all(&input).unwrap();

            let mut config = ClassifyConfig::from(&AppConfig::default());
            config.input_dir = input;
            config.labels_path = root.join("out/labels.jsonl");
            config.review_path = root.join("out/review.jsonl");
            config.report_path = root.join("out/report.json");
            config.classified_root = Some(root.join("classified"));
            config.state_path = root.join("state/classification_state.db");
            config.registry_path = root.join("registry.db");
            Self { root, config }
        }

        fn write_page(&self, name: &str, body: serde_json::Value) -> PathBuf {
            let path = self.config.input_dir.join(name);
            std::fs::write(&path, body.to_string()).unwrap();
            path
        }

        fn lines(&self, path: &Path) -> Vec<serde_json::Value> {
            std::fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl Drop for Workspace {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn stage_page() -> serde_json::Value {
        json!({
            "pageid": 1,
            "title": "Stage A",
            "revid": 1,
            "categories": ["Category:Event Stages"],
            "content": "stage content",
            "is_redirect": false
        })
    }

    #[tokio::test]
    async fn classify_writes_all_outputs() {
        let ws = Workspace::new("classify_outputs");
        let source = ws.write_page("Stage_A_1.json", stage_page());

        let report = run_classify(&ws.config, &RunContext::new()).await.unwrap();
        assert_eq!(report.classified_count, 1);
        assert_eq!(report.by_entity_type["stage"], 1);
        assert_eq!(report.state_store.status, StateStoreStatus::Opened);

        let labels = ws.lines(&ws.config.labels_path);
        assert_eq!(labels[0]["entity_type"], "stage");
        assert!(ws.config.review_path.exists());

        let written: ClassificationReport =
            serde_json::from_str(&std::fs::read_to_string(&ws.config.report_path).unwrap()).unwrap();
        assert_eq!(written.run_id, report.run_id);

        let mirrored: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(ws.root.join("classified/stage/Stage_A_1.json")).unwrap(),
        )
        .unwrap();
        assert!(mirrored.get("subtypes").is_some());
        assert!(mirrored.get("is_ambiguous").is_some());

        let original: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&source).unwrap()).unwrap();
        assert!(original.get("subtypes").is_none());
    }

    #[tokio::test]
    async fn incremental_rerun_skips_unchanged_pages() {
        let ws = Workspace::new("classify_incremental");
        ws.write_page("Stage_A_1.json", stage_page());

        let first = run_classify(&ws.config, &RunContext::new()).await.unwrap();
        let second = run_classify(&ws.config, &RunContext::new()).await.unwrap();

        assert_eq!(first.classified_count, 1);
        assert_eq!(second.classified_count, 0);
        assert_eq!(second.skipped_unchanged, 1);
        assert!(ws.lines(&ws.config.labels_path).is_empty());

        let mut changed = stage_page();
        changed["content"] = json!("stage content, edited");
        ws.write_page("Stage_A_1.json", changed);
        let third = run_classify(&ws.config, &RunContext::new()).await.unwrap();
        assert_eq!(third.classified_count, 1);
    }

    #[tokio::test]
    async fn missing_pageid_goes_to_labels_and_review() {
        let ws = Workspace::new("classify_invalid");
        ws.write_page(
            "broken.json",
            json!({"title": "Broken Page", "revid": 1, "content": "mechanic content"}),
        );

        for _ in 0..2 {
            let report = run_classify(&ws.config, &RunContext::new()).await.unwrap();
            assert_eq!(report.classified_count, 1);
            assert_eq!(report.by_entity_type["invalid"], 1);

            let labels = ws.lines(&ws.config.labels_path);
            let review = ws.lines(&ws.config.review_path);
            assert_eq!(labels.len(), 1);
            assert_eq!(review.len(), 1);
            assert_eq!(review[0]["entity_type"], "invalid");
        }
    }

    #[tokio::test]
    async fn corrupt_state_is_recovered_and_reported() {
        let ws = Workspace::new("classify_corrupt");
        ws.write_page("Stage_A_1.json", stage_page());
        std::fs::create_dir_all(ws.config.state_path.parent().unwrap()).unwrap();
        std::fs::write(&ws.config.state_path, "not a sqlite database ".repeat(200)).unwrap();

        let report = run_classify(&ws.config, &RunContext::new()).await.unwrap();
        assert_eq!(report.state_store.status, StateStoreStatus::Recovered);
        assert!(report.state_store.recovered_from.is_some());
        assert_eq!(report.classified_count, 1);
    }

    #[tokio::test]
    async fn unusable_state_path_degrades_to_stateless() {
        let mut ws = Workspace::new("classify_stateless");
        ws.write_page("Stage_A_1.json", stage_page());
        // A directory cannot be opened as a database file.
        ws.config.state_path = ws.root.join("page");

        let first = run_classify(&ws.config, &RunContext::new()).await.unwrap();
        let second = run_classify(&ws.config, &RunContext::new()).await.unwrap();
        assert_eq!(first.state_store.status, StateStoreStatus::Unavailable);
        assert!(first.state_store.error.is_some());
        assert_eq!(second.classified_count, 1);
    }

    #[tokio::test]
    async fn non_incremental_run_does_not_touch_state() {
        let mut ws = Workspace::new("classify_disabled");
        ws.write_page("Stage_A_1.json", stage_page());
        ws.config.incremental = false;

        let report = run_classify(&ws.config, &RunContext::new()).await.unwrap();
        assert_eq!(report.state_store.status, StateStoreStatus::Disabled);
        assert!(!ws.config.state_path.exists());
    }
}
