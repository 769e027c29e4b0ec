//! Classification pipeline: source, incremental check, classifier, sinks, state.
//!
//! Pages are processed one at a time in discovery order. Per page:
//! load, parse-warning check, redirect filter, page id check, incremental
//! check, classify, write label, review routing, state upsert.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use wikiharvest_classifier::{Classification, EntityType, RuleBasedClassifier, STRATEGY_VERSION, decide};
use wikiharvest_shared::{ClassifyConfig, PageFingerprint, Result, RunContext, SourceMode, StateEntry, compute_content_hash};

use crate::ports::{
    ClassificationLabelRecord, ClassificationReport, ClassificationSink, LoadedPage, PageSource,
    ReportSink, StateStore, StateStoreReport,
};

/// Per-run switches.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source_mode: SourceMode,
    pub low_confidence_threshold: f64,
    pub include_redirects: bool,
    pub incremental: bool,
    pub full_rebuild: bool,
}

impl From<&ClassifyConfig> for PipelineOptions {
    fn from(config: &ClassifyConfig) -> Self {
        Self {
            source_mode: config.source_mode,
            low_confidence_threshold: config.low_confidence_threshold,
            include_redirects: config.include_redirects,
            incremental: config.incremental,
            full_rebuild: config.full_rebuild,
        }
    }
}

/// Running totals for one pass over the source.
#[derive(Debug, Default)]
struct Counters {
    total_discovered: usize,
    loaded_ok: usize,
    classified: usize,
    skipped_unchanged: usize,
    skipped_redirects: usize,
    load_errors: usize,
    parse_warnings: usize,
    misc: usize,
    low_conf: usize,
    conflicts: usize,
    by_entity_type: BTreeMap<String, usize>,
}

impl Counters {
    fn new() -> Self {
        Self {
            by_entity_type: EntityType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), 0))
                .collect(),
            ..Default::default()
        }
    }

    fn count_type(&mut self, entity_type: EntityType) {
        *self
            .by_entity_type
            .entry(entity_type.as_str().to_string())
            .or_default() += 1;
    }
}

/// Wires a page source through the classifier into sinks.
///
/// `state` is `None` when the run is stateless, either by configuration or
/// because the store could not be opened.
pub struct ClassificationPipeline<S, K, R, T> {
    source: S,
    classifier: RuleBasedClassifier,
    sink: K,
    report_sink: R,
    state: Option<T>,
    state_report: StateStoreReport,
}

impl<S, K, R, T> ClassificationPipeline<S, K, R, T>
where
    S: PageSource,
    K: ClassificationSink,
    R: ReportSink,
    T: StateStore,
{
    pub fn new(
        source: S,
        classifier: RuleBasedClassifier,
        sink: K,
        report_sink: R,
        state: Option<T>,
        state_report: StateStoreReport,
    ) -> Self {
        Self {
            source,
            classifier,
            sink,
            report_sink,
            state,
            state_report,
        }
    }

    /// Classify every discovered page, write the report, and return it.
    ///
    /// The sink is closed on every exit path.
    #[instrument(skip_all, fields(run_id = %run.run_id, source_mode = %options.source_mode))]
    pub async fn run(&mut self, run: &RunContext, options: &PipelineOptions) -> Result<ClassificationReport> {
        let start = Instant::now();

        let outcome = self.process(options).await;
        let closed = self.sink.close();
        let counters = outcome?;
        closed?;

        let report = ClassificationReport {
            run_id: run.run_id.clone(),
            source_mode: options.source_mode.as_str().to_string(),
            total_discovered: counters.total_discovered,
            loaded_ok: counters.loaded_ok,
            classified_count: counters.classified,
            skipped_unchanged: counters.skipped_unchanged,
            skipped_redirects: counters.skipped_redirects,
            load_error_count: counters.load_errors,
            parse_warning_count: counters.parse_warnings,
            misc_count: counters.misc,
            low_conf_count: counters.low_conf,
            conflict_count: counters.conflicts,
            by_entity_type: counters.by_entity_type,
            incremental: options.incremental,
            full_rebuild: options.full_rebuild,
            state_store: self.state_report.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            generated_at: Utc::now().to_rfc3339(),
        };
        self.report_sink.write_report(&report)?;

        info!(
            discovered = report.total_discovered,
            classified = report.classified_count,
            skipped_unchanged = report.skipped_unchanged,
            skipped_redirects = report.skipped_redirects,
            load_errors = report.load_error_count,
            parse_warnings = report.parse_warning_count,
            misc = report.misc_count,
            low_conf = report.low_conf_count,
            conflicts = report.conflict_count,
            duration_ms = report.duration_ms,
            "classification completed"
        );
        Ok(report)
    }

    async fn process(&mut self, options: &PipelineOptions) -> Result<Counters> {
        let refs = self.source.discover().await?;
        let mut counters = Counters::new();
        counters.total_discovered = refs.len();

        let check_state = self.state.is_some() && options.incremental && !options.full_rebuild;
        info!(
            discovered = refs.len(),
            include_redirects = options.include_redirects,
            low_confidence_threshold = options.low_confidence_threshold,
            incremental = options.incremental,
            full_rebuild = options.full_rebuild,
            stateful = self.state.is_some(),
            "classification started"
        );

        for source_ref in &refs {
            let loaded = match self.source.load(source_ref).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    counters.load_errors += 1;
                    warn!(source_id = %source_ref.source_id, error = %e, "failed to load page");
                    continue;
                }
            };
            counters.loaded_ok += 1;

            if let Some(warning) = &loaded.parse_warning {
                counters.parse_warnings += 1;
                warn!(doc_id = %loaded.page.doc_id(), %warning, "page loaded with parse warning");
            }

            if loaded.page.is_redirect && !options.include_redirects {
                counters.skipped_redirects += 1;
                debug!(title = %loaded.page.title, "skipping redirect page");
                continue;
            }

            if loaded.page.pageid.is_none() {
                let classification = Classification::invalid("missing_pageid");
                let record = ClassificationLabelRecord::new(&loaded, &classification);
                self.sink.write_label(&record)?;
                self.sink.write_review(&record)?;
                counters.classified += 1;
                counters.count_type(EntityType::Invalid);
                warn!(title = %loaded.page.title, source_path = %loaded.source_path, "page has no page id, labeled invalid");
                continue;
            }

            let doc_id = loaded.page.doc_id();
            let fingerprint = page_fingerprint(&loaded, options.source_mode);

            if check_state {
                if let Some(state) = &self.state {
                    let existing = state.get(&doc_id).await.unwrap_or_else(|e| {
                        warn!(%doc_id, error = %e, "state lookup failed, reclassifying");
                        None
                    });
                    let decision = decide(existing.as_ref(), &fingerprint);
                    if !decision.should_classify {
                        counters.skipped_unchanged += 1;
                        debug!(%doc_id, reason = decision.reason.as_str(), "unchanged, skipping");
                        continue;
                    }
                    debug!(%doc_id, reason = decision.reason.as_str(), "reclassifying");
                }
            }

            let classification = self.classifier.classify(&loaded.page);
            self.emit(&loaded, &classification, options, &mut counters)?;

            if let Some(state) = &self.state {
                let entry = StateEntry {
                    doc_id: doc_id.clone(),
                    fingerprint: fingerprint.into(),
                    entity_type: classification.entity_type.as_str().to_string(),
                    source_path: loaded.source_path.clone(),
                    last_classified_at: Utc::now().to_rfc3339(),
                };
                if let Err(e) = state.upsert(&entry).await {
                    warn!(%doc_id, error = %e, "failed to record classification state");
                }
            }
        }

        Ok(counters)
    }

    /// Write the label, route to review, and update counters.
    fn emit(
        &mut self,
        loaded: &LoadedPage,
        classification: &Classification,
        options: &PipelineOptions,
        counters: &mut Counters,
    ) -> Result<()> {
        let record = ClassificationLabelRecord::new(loaded, classification);
        self.sink.write_label(&record)?;
        counters.classified += 1;
        counters.count_type(classification.entity_type);

        let is_misc = classification.entity_type == EntityType::Misc;
        let is_low_conf = classification.confidence < options.low_confidence_threshold;
        let is_conflict = classification.is_ambiguous;

        if is_misc {
            counters.misc += 1;
        }
        if is_misc || is_low_conf || is_conflict {
            self.sink.write_review(&record)?;
            if is_low_conf {
                counters.low_conf += 1;
            }
            if is_conflict {
                counters.conflicts += 1;
            }
            debug!(
                doc_id = %record.doc_id,
                entity_type = %classification.entity_type,
                confidence = classification.confidence,
                reasons = ?classification.reasons,
                "queued for review"
            );
        }
        Ok(())
    }
}

/// Fingerprint of a page as loaded. Pages with a parse warning carry no hash.
fn page_fingerprint(loaded: &LoadedPage, source_mode: SourceMode) -> PageFingerprint {
    PageFingerprint {
        source_mode: source_mode.as_str().to_string(),
        revision_id: loaded.page.revid,
        content_hash: loaded
            .parse_warning
            .is_none()
            .then(|| compute_content_hash(&loaded.page.content)),
        strategy_version: STRATEGY_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use wikiharvest_classifier::WikiPage;
    use wikiharvest_shared::{HarvestError, StateFingerprint};

    use crate::ports::{SourceRef, StateStoreStatus};

    /// In-memory source; a page of `None` fails to load.
    struct MemorySource(Vec<Option<LoadedPage>>);

    impl PageSource for MemorySource {
        async fn discover(&self) -> Result<Vec<SourceRef>> {
            Ok((0..self.0.len())
                .map(|i| SourceRef {
                    source_id: i.to_string(),
                    location: String::new(),
                    metadata: None,
                })
                .collect())
        }

        async fn load(&self, source_ref: &SourceRef) -> Result<LoadedPage> {
            let index: usize = source_ref.source_id.parse().unwrap();
            self.0[index]
                .clone()
                .ok_or_else(|| HarvestError::parse("unreadable"))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        labels: Vec<ClassificationLabelRecord>,
        review: Vec<ClassificationLabelRecord>,
        closed: bool,
    }

    impl ClassificationSink for &mut MemorySink {
        fn write_label(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
            self.labels.push(record.clone());
            Ok(())
        }
        fn write_review(&mut self, record: &ClassificationLabelRecord) -> Result<()> {
            self.review.push(record.clone());
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    struct NoReport;

    impl ReportSink for NoReport {
        fn write_report(&self, _report: &ClassificationReport) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryState(Mutex<HashMap<String, StateFingerprint>>);

    impl StateStore for &MemoryState {
        async fn get(&self, doc_id: &str) -> Result<Option<StateFingerprint>> {
            Ok(self.0.lock().unwrap().get(doc_id).cloned())
        }
        async fn upsert(&self, entry: &StateEntry) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .insert(entry.doc_id.clone(), entry.fingerprint.clone());
            Ok(())
        }
    }

    fn page(pageid: Option<u64>, title: &str, categories: &[&str]) -> Option<LoadedPage> {
        Some(LoadedPage {
            page: WikiPage {
                pageid,
                title: title.into(),
                revid: pageid.map(|id| id * 10),
                categories: categories.iter().map(|c| c.to_string()).collect(),
                content: format!("{title} body"),
                ..Default::default()
            },
            source_path: format!("{title}.json"),
            parse_warning: None,
        })
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            source_mode: SourceMode::Html,
            low_confidence_threshold: 0.5,
            include_redirects: true,
            incremental: true,
            full_rebuild: false,
        }
    }

    async fn run_once(
        pages: Vec<Option<LoadedPage>>,
        state: Option<&MemoryState>,
        options: &PipelineOptions,
    ) -> (ClassificationReport, MemorySink) {
        let mut sink = MemorySink::default();
        let report = {
            let mut pipeline = ClassificationPipeline::new(
                MemorySource(pages),
                RuleBasedClassifier::default(),
                &mut sink,
                NoReport,
                state,
                StateStoreReport::new("memory", StateStoreStatus::Opened),
            );
            pipeline.run(&RunContext::new(), options).await.unwrap()
        };
        (report, sink)
    }

    #[tokio::test]
    async fn counts_load_errors_and_keeps_going() {
        let pages = vec![
            page(Some(1), "Bahamut Cat", &["Category:Cat Units", "Category:Uber Rare Cats"]),
            None,
            page(Some(3), "Something", &[]),
        ];
        let (report, sink) = run_once(pages, None, &options()).await;

        assert_eq!(report.total_discovered, 3);
        assert_eq!(report.loaded_ok, 2);
        assert_eq!(report.load_error_count, 1);
        assert_eq!(report.classified_count, 2);
        assert_eq!(report.by_entity_type["cat"], 1);
        assert_eq!(report.misc_count, 1);
        assert_eq!(sink.labels.len(), 2);
        assert_eq!(sink.review.len(), 1);
        assert_eq!(sink.review[0].entity_type, EntityType::Misc);
        assert!(sink.closed);
    }

    #[tokio::test]
    async fn second_incremental_run_classifies_nothing() {
        let state = MemoryState::default();
        let pages = || {
            vec![
                page(Some(1), "Cat A", &["Category:Cat Units"]),
                page(Some(2), "Enemy B", &["Category:Enemy Units"]),
            ]
        };

        let (first, _) = run_once(pages(), Some(&state), &options()).await;
        let (second, sink) = run_once(pages(), Some(&state), &options()).await;

        assert_eq!(first.classified_count, 2);
        assert_eq!(second.classified_count, 0);
        assert_eq!(second.skipped_unchanged, 2);
        assert!(sink.labels.is_empty());
    }

    #[tokio::test]
    async fn full_rebuild_reclassifies_and_refreshes_state() {
        let state = MemoryState::default();
        let pages = || vec![page(Some(1), "Cat A", &["Category:Cat Units"])];

        run_once(pages(), Some(&state), &options()).await;
        state.0.lock().unwrap().get_mut("1").unwrap().strategy_version = "0.0.1".into();

        let rebuild = PipelineOptions {
            full_rebuild: true,
            ..options()
        };
        let (rebuilt, _) = run_once(pages(), Some(&state), &rebuild).await;
        assert_eq!(rebuilt.classified_count, 1);
        assert_eq!(
            state.0.lock().unwrap()["1"].strategy_version,
            STRATEGY_VERSION
        );

        let (after, _) = run_once(pages(), Some(&state), &options()).await;
        assert_eq!(after.classified_count, 0);
    }

    #[tokio::test]
    async fn missing_pageid_is_invalid_every_run() {
        let state = MemoryState::default();
        let pages = || vec![page(None, "Broken Page", &["Category:Mechanics"])];

        for _ in 0..2 {
            let (report, sink) = run_once(pages(), Some(&state), &options()).await;
            assert_eq!(report.classified_count, 1);
            assert_eq!(report.by_entity_type["invalid"], 1);
            assert_eq!(report.skipped_unchanged, 0);
            assert_eq!(sink.labels.len(), 1);
            assert_eq!(sink.review.len(), 1);
            assert_eq!(sink.labels[0].reasons, vec!["missing_pageid"]);
        }
        assert!(state.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn parse_warning_pages_are_always_reclassified() {
        let state = MemoryState::default();
        let pages = || {
            let mut loaded = page(Some(5), "Recovered", &["Category:Cat Units"]).unwrap();
            loaded.parse_warning = Some("json_decode_error:eof".into());
            vec![Some(loaded)]
        };

        run_once(pages(), Some(&state), &options()).await;
        let (second, _) = run_once(pages(), Some(&state), &options()).await;
        assert_eq!(second.classified_count, 1);
        assert_eq!(second.parse_warning_count, 1);
    }

    #[tokio::test]
    async fn redirects_can_be_excluded() {
        let mut redirect = page(Some(9), "Old Name", &["Category:Cat Units"]).unwrap();
        redirect.page.is_redirect = true;
        let pages = vec![Some(redirect), page(Some(1), "Cat", &["Category:Cat Units"])];

        let exclude = PipelineOptions {
            include_redirects: false,
            ..options()
        };
        let (report, sink) = run_once(pages, None, &exclude).await;
        assert_eq!(report.skipped_redirects, 1);
        assert_eq!(report.classified_count, 1);
        assert_eq!(sink.labels[0].title, "Cat");
    }

    #[tokio::test]
    async fn conflicts_are_counted_and_reviewed() {
        let pages = vec![page(
            Some(1),
            "Mixed",
            &["Category:Cat Units", "Category:Enemy Units"],
        )];
        let (report, sink) = run_once(pages, None, &options()).await;

        assert_eq!(report.conflict_count, 1);
        assert_eq!(report.misc_count, 1);
        assert!(sink.review[0].is_ambiguous);
        assert!(
            sink.review[0]
                .reasons
                .iter()
                .any(|r| r.starts_with("low_margin_conflict"))
        );
    }
}
