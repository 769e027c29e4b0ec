//! Incremental crawl workflow.
//!
//! A run discovers every content page with its latest revision, diffs that
//! against the local registry, and fetches only new or changed pages. Pages
//! are fetched in chunks with bounded concurrency and a polite pause between
//! chunks. A page that fails is counted and the run moves on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use wikiharvest_shared::{CrawlConfig, CrawlSummary, PageId, PageRef, RegistryRecord, Result, RevisionId};
use wikiharvest_storage::Registry;

use crate::client::MediaWikiClient;
use crate::documents::DocumentStore;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting crawl status.
pub trait CrawlProgress: Send + Sync {
    /// Called once discovery and diffing are done.
    fn discovered(&self, total: usize, queued: usize);
    /// Called after each page is saved or fails.
    fn page_done(&self, page_id: PageId, ok: bool);
    /// Called after each chunk, with 1-based index.
    fn chunk_done(&self, index: usize, chunks: usize);
    /// Called when the run completes.
    fn done(&self, summary: &CrawlSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl CrawlProgress for SilentProgress {
    fn discovered(&self, _total: usize, _queued: usize) {}
    fn page_done(&self, _page_id: PageId, _ok: bool) {}
    fn chunk_done(&self, _index: usize, _chunks: usize) {}
    fn done(&self, _summary: &CrawlSummary) {}
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Pages absent locally or whose remote revision is newer than the stored one.
///
/// Output is ordered by page id.
pub fn compute_work_set(
    remote: &BTreeMap<PageId, RevisionId>,
    local: &HashMap<PageId, RevisionId>,
    redirects: &HashMap<PageId, Vec<String>>,
) -> Vec<PageRef> {
    remote
        .iter()
        .filter(|&(page_id, revid)| local.get(page_id).is_none_or(|stored| revid > stored))
        .map(|(&page_id, &remote_revision_id)| PageRef {
            page_id,
            remote_revision_id,
            redirect_aliases: redirects.get(&page_id).cloned().unwrap_or_default(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Result of fetching and persisting one page.
#[derive(Debug)]
pub enum PageOutcome {
    Saved(RegistryRecord),
    Failed { page_id: PageId, reason: String },
}

/// Discover, diff, fetch, persist.
pub struct CrawlWorkflow {
    client: Arc<MediaWikiClient>,
    store: Arc<DocumentStore>,
    registry: Arc<Registry>,
    concurrency: usize,
    chunk_size: usize,
    polite_delay: Duration,
}

impl CrawlWorkflow {
    pub fn new(
        client: MediaWikiClient,
        store: DocumentStore,
        registry: Registry,
        config: &CrawlConfig,
    ) -> Self {
        Self {
            client: Arc::new(client),
            store: Arc::new(store),
            registry: Arc::new(registry),
            concurrency: config.concurrency.max(1),
            chunk_size: config.chunk_size.max(1),
            polite_delay: config.polite_delay,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one incremental crawl.
    ///
    /// Errors only if the local registry cannot be read; per-page failures are
    /// reflected in the summary.
    #[instrument(skip_all)]
    pub async fn run(&self, progress: &dyn CrawlProgress) -> Result<CrawlSummary> {
        let start = Instant::now();

        let listing = self.client.fetch_all_pages_metadata().await;
        let local = self.registry.local_state().await?;
        let work = compute_work_set(&listing.revisions, &local, &listing.redirects);

        let mut summary = CrawlSummary {
            discovered_total: listing.revisions.len(),
            queued_total: work.len(),
            skipped_total: listing.revisions.len() - work.len(),
            ..Default::default()
        };
        progress.discovered(summary.discovered_total, summary.queued_total);

        info!(
            discovered = summary.discovered_total,
            queued = summary.queued_total,
            skipped = summary.skipped_total,
            concurrency = self.concurrency,
            chunk_size = self.chunk_size,
            "starting crawl"
        );

        if work.is_empty() {
            info!("registry is up to date, nothing to fetch");
            progress.done(&summary);
            return Ok(summary);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let chunks = work.len().div_ceil(self.chunk_size);

        for (index, chunk) in work.chunks(self.chunk_size).enumerate() {
            let mut tasks = JoinSet::new();

            for page in chunk.iter().cloned() {
                let client = self.client.clone();
                let store = self.store.clone();
                let registry = self.registry.clone();
                let sem = semaphore.clone();

                tasks.spawn(async move {
                    let Ok(_permit) = sem.acquire_owned().await else {
                        return PageOutcome::Failed {
                            page_id: page.page_id,
                            reason: "semaphore closed".into(),
                        };
                    };
                    process_page(&client, &store, &registry, page).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(PageOutcome::Saved(record)) => {
                        summary.processed_total += 1;
                        debug!(page_id = record.page_id, title = %record.title, "page saved");
                        progress.page_done(record.page_id, true);
                    }
                    Ok(PageOutcome::Failed { page_id, reason }) => {
                        summary.failed_total += 1;
                        warn!(page_id, %reason, "page failed");
                        progress.page_done(page_id, false);
                    }
                    Err(e) => {
                        summary.failed_total += 1;
                        error!(error = %e, "page task aborted");
                    }
                }
            }

            progress.chunk_done(index + 1, chunks);
            info!(
                chunk = index + 1,
                chunks,
                processed = summary.processed_total,
                failed = summary.failed_total,
                "chunk complete"
            );

            if index + 1 < chunks && !self.polite_delay.is_zero() {
                tokio::time::sleep(self.polite_delay).await;
            }
        }

        info!(
            discovered = summary.discovered_total,
            queued = summary.queued_total,
            processed = summary.processed_total,
            failed = summary.failed_total,
            skipped = summary.skipped_total,
            duration_ms = start.elapsed().as_millis() as u64,
            "crawl completed"
        );
        progress.done(&summary);
        Ok(summary)
    }
}

/// Fetch one page, write its document, and record it in the registry.
async fn process_page(
    client: &MediaWikiClient,
    store: &DocumentStore,
    registry: &Registry,
    page: PageRef,
) -> PageOutcome {
    let page_id = page.page_id;
    let Some(doc) = client.fetch_page_doc(page_id, &page.redirect_aliases).await else {
        return PageOutcome::Failed {
            page_id,
            reason: "fetch failed".into(),
        };
    };

    if doc.revid != page.remote_revision_id {
        debug!(
            page_id,
            listed = page.remote_revision_id,
            fetched = doc.revid,
            "page changed since discovery"
        );
    }

    let path = match store.write(&doc) {
        Ok(path) => path,
        Err(e) => {
            return PageOutcome::Failed {
                page_id,
                reason: e.to_string(),
            };
        }
    };

    match registry.upsert(&doc, &path.to_string_lossy()).await {
        Ok(record) => PageOutcome::Saved(record),
        Err(e) => PageOutcome::Failed {
            page_id,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wikiharvest_shared::{AppConfig, RunContext, WikiPageDoc};
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn work_set_contains_new_and_changed_pages() {
        let remote = BTreeMap::from([(1, 10), (2, 20), (3, 30)]);
        let local = HashMap::from([(1, 10), (2, 19), (9, 90)]);
        let redirects = HashMap::from([(3, vec!["Old Three".to_string()])]);

        let work = compute_work_set(&remote, &local, &redirects);

        let ids: Vec<_> = work.iter().map(|p| (p.page_id, p.remote_revision_id)).collect();
        assert_eq!(ids, vec![(2, 20), (3, 30)]);
        assert!(work[0].redirect_aliases.is_empty());
        assert_eq!(work[1].redirect_aliases, vec!["Old Three"]);
    }

    #[test]
    fn work_set_is_empty_when_up_to_date() {
        let remote = BTreeMap::from([(1, 10)]);
        let local = HashMap::from([(1, 10)]);
        assert!(compute_work_set(&remote, &local, &HashMap::new()).is_empty());
    }

    #[test]
    fn work_set_skips_pages_with_newer_local_revision() {
        let remote = BTreeMap::from([(1, 10), (2, 20)]);
        let local = HashMap::from([(1, 12), (2, 20)]);
        assert!(compute_work_set(&remote, &local, &HashMap::new()).is_empty());
    }

    struct Fixture {
        server: MockServer,
        dir: std::path::PathBuf,
        config: CrawlConfig,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await;
        let dir = std::env::temp_dir().join(format!("wh_crawl_{}", Uuid::now_v7()));

        let mut app = AppConfig::default();
        app.wiki.api_url = format!("{}/w/api.php", server.uri());
        app.crawl.concurrency = 2;
        app.crawl.chunk_size = 1;
        app.crawl.polite_delay_ms = 0;
        app.crawl.backoff_base_ms = 0;
        app.crawl.output_dir = dir.join("page").to_string_lossy().into_owned();
        app.crawl.registry_path = dir.join("registry.db").to_string_lossy().into_owned();
        app.crawl.audit = false;

        Mock::given(method("GET"))
            .and(query_param("gapfilterredir", "nonredirects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": {"pages": [
                    {"pageid": 1, "title": "Alpha", "revisions": [{"revid": 10}]},
                    {"pageid": 2, "title": "Beta", "revisions": [{"revid": 20}]},
                    {"pageid": 3, "title": "Gamma", "revisions": [{"revid": 30}]}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("gapfilterredir", "redirects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": {"redirects": [{"from": "B", "to": "Beta"}]}
            })))
            .mount(&server)
            .await;

        Fixture {
            server,
            dir,
            config: CrawlConfig::from(&app),
        }
    }

    async fn workflow(fx: &Fixture, local: &[(u64, &str, u64)]) -> CrawlWorkflow {
        let registry = Registry::open(&fx.config.registry_path).await.unwrap();
        for &(pageid, title, revid) in local {
            let doc = WikiPageDoc {
                pageid,
                title: title.into(),
                revid,
                ..Default::default()
            };
            registry.upsert(&doc, "seed.json").await.unwrap();
        }
        let client = MediaWikiClient::new(&fx.config, &RunContext::new()).unwrap();
        let store = DocumentStore::new(&fx.config.output_dir).unwrap();
        CrawlWorkflow::new(client, store, registry, &fx.config)
    }

    #[tokio::test]
    async fn crawl_fetches_only_changed_pages() {
        let fx = fixture().await;

        Mock::given(method("GET"))
            .and(query_param("pageids", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": {"pages": [{
                    "pageid": 2,
                    "title": "Beta",
                    "categories": [{"title": "Category:Enemies"}],
                    "extract": "An enemy.",
                    "revisions": [{"revid": 20, "timestamp": "2024-01-01T00:00:00Z"}]
                }]}
            })))
            .expect(1)
            .mount(&fx.server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("pageids", "3"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&fx.server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("pageids", "1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&fx.server)
            .await;

        let wf = workflow(&fx, &[(1, "Alpha", 10), (2, "Beta", 19)]).await;
        let summary = wf.run(&SilentProgress).await.unwrap();

        assert_eq!(
            summary,
            CrawlSummary {
                discovered_total: 3,
                queued_total: 2,
                processed_total: 1,
                failed_total: 1,
                skipped_total: 1,
            }
        );

        let beta = wf.registry().get(2).await.unwrap().expect("registry row");
        assert_eq!(beta.last_revid, Some(20));
        assert_eq!(beta.categories, vec!["Category:Enemies"]);
        assert!(fx.config.output_dir.join("Beta_2.json").exists());
        assert!(wf.registry().get(3).await.unwrap().is_none());

        let saved: WikiPageDoc = serde_json::from_str(
            &std::fs::read_to_string(fx.config.output_dir.join("Beta_2.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved.redirects_from, vec!["B"]);

        let _ = std::fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test]
    async fn crawl_with_current_registry_fetches_nothing() {
        let fx = fixture().await;

        Mock::given(method("GET"))
            .and(query_param("explaintext", "1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&fx.server)
            .await;

        let wf = workflow(&fx, &[(1, "Alpha", 10), (2, "Beta", 20), (3, "Gamma", 30)]).await;
        let summary = wf.run(&SilentProgress).await.unwrap();

        assert_eq!(summary.queued_total, 0);
        assert_eq!(summary.skipped_total, 3);
        assert_eq!(summary.processed_total, 0);

        let _ = std::fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test]
    async fn page_fetches_never_exceed_concurrency() {
        let server = MockServer::start().await;
        let dir = std::env::temp_dir().join(format!("wh_crawl_bound_{}", Uuid::now_v7()));

        let mut app = AppConfig::default();
        app.wiki.api_url = format!("{}/w/api.php", server.uri());
        app.crawl.concurrency = 2;
        app.crawl.chunk_size = 6;
        app.crawl.polite_delay_ms = 0;
        app.crawl.backoff_base_ms = 0;
        app.crawl.output_dir = dir.join("page").to_string_lossy().into_owned();
        app.crawl.registry_path = dir.join("registry.db").to_string_lossy().into_owned();
        app.crawl.audit = false;
        let config = CrawlConfig::from(&app);

        let listing: Vec<_> = (1..=6u64)
            .map(|id| json!({"pageid": id, "title": format!("Page {id}"), "revisions": [{"revid": id * 10}]}))
            .collect();
        Mock::given(method("GET"))
            .and(query_param("gapfilterredir", "nonredirects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"query": {"pages": listing}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("gapfilterredir", "redirects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"query": {}})))
            .mount(&server)
            .await;
        for id in 1..=6u64 {
            Mock::given(method("GET"))
                .and(query_param("pageids", id.to_string()))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({
                            "query": {"pages": [{
                                "pageid": id,
                                "title": format!("Page {id}"),
                                "extract": "Body.",
                                "revisions": [{"revid": id * 10, "timestamp": "2024-01-01T00:00:00Z"}]
                            }]}
                        }))
                        .set_delay(Duration::from_millis(300)),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let registry = Registry::open(&config.registry_path).await.unwrap();
        let client = MediaWikiClient::new(&config, &RunContext::new()).unwrap();
        let store = DocumentStore::new(&config.output_dir).unwrap();
        let wf = CrawlWorkflow::new(client, store, registry, &config);

        let started = Instant::now();
        let summary = wf.run(&SilentProgress).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(summary.processed_total, 6);
        // Six 300ms fetches two at a time take at least three rounds.
        assert!(elapsed >= Duration::from_millis(900), "finished in {elapsed:?}");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
