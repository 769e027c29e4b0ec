//! MediaWiki API client: page discovery, category listing, and page documents.
//!
//! Every request goes through [`MediaWikiClient::fetch`], which retries transient
//! failures with backoff and records each attempt to the optional audit log.
//! Callers get `None` for a unit that could not be fetched; nothing here aborts a run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use wikiharvest_shared::{
    CrawlConfig, HarvestError, HttpMeta, PageId, Result, RevisionId, RunContext, WikiPageDoc,
    build_canonical_url,
};

use crate::audit::{ApiCallEvent, ApiCallLog, CallOutcome, ErrorInfo, HttpInfo, RequestInfo, Timing};
use crate::retry::{RetryDisposition, RetryPolicy, classify_reqwest_error, classify_status};

/// Query parameters, ordered so audit records are stable.
pub type Params = BTreeMap<String, String>;

/// Upper bound on a single backoff wait.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A successful API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub data: Value,
    pub http: HttpMeta,
}

/// Result of a discovery pass over the wiki.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListing {
    /// Latest revision per content page.
    pub revisions: BTreeMap<PageId, RevisionId>,
    /// Sorted redirect titles per canonical page.
    pub redirects: HashMap<PageId, Vec<String>>,
}

/// Outcome of one HTTP attempt, before audit and retry bookkeeping.
enum Attempt {
    Success { data: Value, http: HttpInfo },
    Retryable {
        http: Option<HttpInfo>,
        body: Option<String>,
        error: ErrorInfo,
    },
    HttpError { http: HttpInfo, body: String },
    Fatal { error: ErrorInfo },
}

fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Client for one wiki's `api.php`.
pub struct MediaWikiClient {
    http: Client,
    api_url: String,
    wiki_root_url: String,
    source_name: String,
    retry: RetryPolicy,
    run_id: String,
    audit: Option<Arc<ApiCallLog>>,
}

impl MediaWikiClient {
    /// Build a client with the configured timeouts and retry policy.
    pub fn new(config: &CrawlConfig, run: &RunContext) -> Result<Self> {
        let api_url = Url::parse(&config.api_url)
            .map_err(|e| HarvestError::config(format!("invalid api_url '{}': {e}", config.api_url)))?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(HarvestError::config(format!(
                "api_url must be http or https, got '{}'",
                api_url.scheme()
            )));
        }

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_url: api_url.to_string(),
            wiki_root_url: config.wiki_root_url.clone(),
            source_name: config.source_name.clone(),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                base_delay: config.backoff_base,
                max_delay: MAX_BACKOFF,
            },
            run_id: run.run_id.clone(),
            audit: None,
        })
    }

    /// Record every attempt to `log`.
    pub fn with_audit(mut self, log: Arc<ApiCallLog>) -> Self {
        self.audit = Some(log);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// List every content page with its latest revision, plus redirect aliases.
    ///
    /// A listing that fails part-way returns what was gathered so far.
    #[instrument(skip_all)]
    pub async fn fetch_all_pages_metadata(&self) -> RemoteListing {
        info!("fetching page list and revision ids");
        let base = params(&[
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("generator", "allpages"),
            ("gaplimit", "500"),
            ("gapnamespace", "0"),
            ("gapfilterredir", "nonredirects"),
            ("prop", "info|revisions"),
            ("rvprop", "ids"),
        ]);

        let mut revisions = BTreeMap::new();
        let mut title_to_id: HashMap<String, PageId> = HashMap::new();

        let complete = self
            .paginate(base, "fetch_all_pages_metadata", |data| {
                for page in query_list(data, "pages") {
                    let Some(page_id) = page.get("pageid").and_then(Value::as_u64) else {
                        continue;
                    };
                    let revid = page
                        .get("revisions")
                        .and_then(|r| r.get(0))
                        .and_then(|r| r.get("revid"))
                        .and_then(Value::as_u64)
                        .or_else(|| page.get("lastrevid").and_then(Value::as_u64));
                    let Some(revid) = revid else {
                        continue;
                    };
                    revisions.insert(page_id, revid);
                    if let Some(title) = page.get("title").and_then(Value::as_str) {
                        title_to_id.insert(title.to_string(), page_id);
                    }
                }
                debug!(pages = revisions.len(), "discovered pages so far");
            })
            .await;

        if !complete {
            error!(pages = revisions.len(), "page listing failed, continuing with partial results");
        }

        let redirects = self.fetch_redirect_aliases(&title_to_id).await;
        info!(
            pages = revisions.len(),
            redirected_pages = redirects.len(),
            "discovery complete"
        );

        RemoteListing {
            revisions,
            redirects,
        }
    }

    /// Map redirect titles onto the page ids discovered by the main listing.
    async fn fetch_redirect_aliases(
        &self,
        title_to_id: &HashMap<String, PageId>,
    ) -> HashMap<PageId, Vec<String>> {
        let base = params(&[
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("generator", "allpages"),
            ("gaplimit", "500"),
            ("gapnamespace", "0"),
            ("gapfilterredir", "redirects"),
            ("redirects", "1"),
        ]);

        let mut aliases: HashMap<PageId, Vec<String>> = HashMap::new();
        let mut dropped = 0usize;

        let complete = self
            .paginate(base, "fetch_redirects", |data| {
                for pair in query_list(data, "redirects") {
                    let from = pair.get("from").and_then(Value::as_str);
                    let to = pair.get("to").and_then(Value::as_str);
                    let (Some(from), Some(to)) = (from, to) else {
                        continue;
                    };
                    match title_to_id.get(to) {
                        Some(page_id) => aliases.entry(*page_id).or_default().push(from.to_string()),
                        None => dropped += 1,
                    }
                }
            })
            .await;

        if !complete {
            warn!("redirect listing failed, aliases may be incomplete");
        }
        if dropped > 0 {
            debug!(dropped, "redirects to unknown titles ignored");
        }

        for titles in aliases.values_mut() {
            titles.sort();
            titles.dedup();
        }
        aliases
    }

    /// Every category name on the wiki, de-duplicated in first-seen order.
    #[instrument(skip_all)]
    pub async fn fetch_categories(&self) -> Vec<String> {
        let base = params(&[
            ("action", "query"),
            ("list", "allcategories"),
            ("aclimit", "500"),
            ("format", "json"),
            ("formatversion", "2"),
        ]);

        let mut seen = HashSet::new();
        let mut names = Vec::new();

        let complete = self
            .paginate(base, "fetch_categories", |data| {
                for entry in query_list(data, "allcategories") {
                    let name = ["*", "category", "title"]
                        .iter()
                        .find_map(|key| entry.get(*key).and_then(Value::as_str))
                        .or_else(|| entry.as_str())
                        .unwrap_or("")
                        .trim();
                    if !name.is_empty() && seen.insert(name.to_string()) {
                        names.push(name.to_string());
                    }
                }
            })
            .await;

        if !complete {
            error!("failed to fetch category list");
            return Vec::new();
        }
        info!(categories = names.len(), "category listing complete");
        names
    }

    // -----------------------------------------------------------------------
    // Page documents
    // -----------------------------------------------------------------------

    /// Fetch one page with its plain-text body, categories, and revision info.
    #[instrument(skip(self, redirect_aliases), fields(page_id))]
    pub async fn fetch_page_doc(
        &self,
        page_id: PageId,
        redirect_aliases: &[String],
    ) -> Option<WikiPageDoc> {
        let id = page_id.to_string();
        let base = params(&[
            ("action", "query"),
            ("pageids", id.as_str()),
            ("explaintext", "1"),
            ("prop", "categories|info|revisions|extracts|pageprops"),
            ("rvprop", "content|ids|timestamp"),
            ("rvslots", "*"),
            ("redirects", "1"),
            ("cllimit", "max"),
            ("format", "json"),
            ("formatversion", "2"),
        ]);

        let mut request = base.clone();
        let mut doc: Option<WikiPageDoc> = None;

        loop {
            let response = self.fetch(&request, "fetch_page_doc", Some(page_id)).await?;
            match doc.as_mut() {
                None => doc = Some(self.parse_page_doc(page_id, redirect_aliases, &response)?),
                Some(existing) => merge_categories(existing, &response.data),
            }
            match next_request(&base, &request, &response.data) {
                Some(next) => request = next,
                None => break,
            }
        }
        doc
    }

    /// Build a document from a page query response, or `None` if required fields are missing.
    pub fn parse_page_doc(
        &self,
        page_id: PageId,
        redirect_aliases: &[String],
        response: &ApiResponse,
    ) -> Option<WikiPageDoc> {
        let data = &response.data;
        if let Some(err) = data.get("error") {
            error!(page_id, error = %err, "API error for page");
            return None;
        }

        let Some(page) = query_list(data, "pages").first() else {
            warn!(page_id, "page not found");
            return None;
        };
        if page.get("missing").is_some_and(|m| m.as_bool().unwrap_or(true)) {
            warn!(page_id, "page not found");
            return None;
        }
        let Some(revision) = page.get("revisions").and_then(|r| r.get(0)) else {
            warn!(page_id, "no revision content for page");
            return None;
        };

        let current_id = page.get("pageid").and_then(Value::as_u64);
        let revid = revision.get("revid").and_then(Value::as_u64);
        let timestamp = revision.get("timestamp").and_then(Value::as_str);
        let title = page.get("title").and_then(Value::as_str).filter(|t| !t.is_empty());
        let (Some(current_id), Some(revid), Some(timestamp), Some(title)) =
            (current_id, revid, timestamp, title)
        else {
            warn!(page_id, "incomplete page payload");
            return None;
        };

        let extract = str_field(page, "extract");
        let content = if extract.is_empty() {
            revision
                .pointer("/slots/main/content")
                .or_else(|| revision.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            extract.clone()
        };

        let description = page
            .pointer("/pageprops/description")
            .or_else(|| page.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let redirect_target = query_list(data, "redirects")
            .first()
            .and_then(|r| r.get("to"))
            .and_then(Value::as_str)
            .map(String::from);

        let mut aliases = redirect_aliases.to_vec();
        aliases.sort();
        aliases.dedup();

        Some(WikiPageDoc {
            source: self.source_name.clone(),
            pageid: current_id,
            title: title.to_string(),
            canonical_url: build_canonical_url(title, &self.wiki_root_url),
            revid,
            timestamp: timestamp.to_string(),
            content_model: page
                .get("contentmodel")
                .and_then(Value::as_str)
                .map(String::from),
            categories: category_titles(page),
            description,
            content,
            extract,
            is_redirect: page.get("redirect").and_then(Value::as_bool).unwrap_or(false),
            redirect_target,
            fetched_at: Utc::now().to_rfc3339(),
            http: response.http.clone(),
            redirects_from: aliases,
        })
    }

    // -----------------------------------------------------------------------
    // Retryable fetch primitive
    // -----------------------------------------------------------------------

    /// GET the API with `params`, retrying transient failures.
    ///
    /// Returns `None` on a terminal status, an unexpected error, or once all
    /// attempts are used up.
    pub async fn fetch(
        &self,
        params: &Params,
        operation: &str,
        page_id: Option<PageId>,
    ) -> Option<ApiResponse> {
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=attempts {
            let started_at = Utc::now().to_rfc3339();
            let result = self.attempt(params).await;
            let finished_at = Utc::now().to_rfc3339();
            let event = |outcome: CallOutcome| ApiCallEvent {
                run_id: self.run_id.clone(),
                operation: operation.to_string(),
                page_id,
                attempt,
                request: RequestInfo {
                    base_url: self.api_url.clone(),
                    params: params.clone(),
                },
                http: None,
                response_json: None,
                response_text: None,
                warnings: None,
                continue_token: None,
                error: None,
                timing: Timing {
                    started_at: started_at.clone(),
                    finished_at: finished_at.clone(),
                },
                outcome,
            };

            match result {
                Attempt::Success { data, http } => {
                    self.record(|| ApiCallEvent {
                        http: Some(http.clone()),
                        response_json: Some(data.clone()),
                        warnings: data.get("warnings").cloned(),
                        continue_token: data.get("continue").cloned(),
                        ..event(CallOutcome::Success)
                    })
                    .await;
                    return Some(ApiResponse {
                        http: HttpMeta {
                            status: http.status.unwrap_or(200),
                            etag: http.etag,
                            last_modified: http.last_modified,
                        },
                        data,
                    });
                }
                Attempt::HttpError { http, body } => {
                    error!(operation, ?page_id, status = ?http.status, "terminal HTTP status");
                    self.record(|| ApiCallEvent {
                        error: Some(ErrorInfo {
                            kind: "http_status".into(),
                            message: format!("HTTP {}", http.status.unwrap_or_default()),
                        }),
                        http: Some(http),
                        response_text: Some(body),
                        ..event(CallOutcome::HttpError)
                    })
                    .await;
                    return None;
                }
                Attempt::Fatal { error } => {
                    error!(operation, ?page_id, error = %error.message, "unexpected request failure");
                    self.record(|| ApiCallEvent {
                        error: Some(error),
                        ..event(CallOutcome::FatalError)
                    })
                    .await;
                    return None;
                }
                Attempt::Retryable { http, body, error } => {
                    let message = error.message.clone();
                    self.record(|| ApiCallEvent {
                        http,
                        response_text: body,
                        error: Some(error),
                        ..event(CallOutcome::RetryableError)
                    })
                    .await;

                    if attempt == attempts {
                        error!(operation, ?page_id, attempts, error = %message, "giving up after retries");
                        return None;
                    }
                    let wait = self.retry.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        ?page_id,
                        attempt,
                        attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %message,
                        "transient failure, retrying"
                    );
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        None
    }

    async fn attempt(&self, params: &Params) -> Attempt {
        let response = match self.http.get(&self.api_url).query(params).send().await {
            Ok(response) => response,
            Err(e) => {
                let error = ErrorInfo {
                    kind: reqwest_error_kind(&e).into(),
                    message: e.to_string(),
                };
                return match classify_reqwest_error(&e) {
                    RetryDisposition::Retryable => Attempt::Retryable {
                        http: None,
                        body: None,
                        error,
                    },
                    RetryDisposition::Terminal => Attempt::Fatal { error },
                };
            }
        };

        let status = response.status();
        let http = http_info(&response);

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return match classify_status(status) {
                RetryDisposition::Retryable => Attempt::Retryable {
                    error: ErrorInfo {
                        kind: "http_status".into(),
                        message: format!("HTTP {status}"),
                    },
                    http: Some(http),
                    body: Some(body),
                },
                RetryDisposition::Terminal => Attempt::HttpError { http, body },
            };
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Attempt::Retryable {
                    http: Some(http),
                    body: None,
                    error: ErrorInfo {
                        kind: "body".into(),
                        message: e.to_string(),
                    },
                };
            }
        };

        match serde_json::from_str::<Value>(&body) {
            Ok(data) => Attempt::Success { data, http },
            Err(e) => Attempt::Retryable {
                http: Some(http),
                body: Some(body),
                error: ErrorInfo {
                    kind: "json_decode".into(),
                    message: e.to_string(),
                },
            },
        }
    }

    /// Write an audit event if auditing is on. Failures are logged, never raised.
    async fn record(&self, build: impl FnOnce() -> ApiCallEvent) {
        let Some(log) = &self.audit else {
            return;
        };
        if let Err(e) = log.write_event(build()).await {
            warn!(error = %e, "failed to persist API call event");
        }
    }

    /// Follow `continue` tokens until the API stops returning them.
    ///
    /// Returns `false` if a request failed before the listing finished.
    async fn paginate<F>(&self, base: Params, operation: &str, mut on_batch: F) -> bool
    where
        F: FnMut(&Value),
    {
        let mut request = base.clone();
        loop {
            let Some(response) = self.fetch(&request, operation, None).await else {
                return false;
            };
            on_batch(&response.data);
            match next_request(&base, &request, &response.data) {
                Some(next) => request = next,
                None => return true,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// `base` merged with the response's `continue` object, or `None` when done.
fn next_request(base: &Params, current: &Params, data: &Value) -> Option<Params> {
    let token = data.get("continue")?.as_object()?;
    let mut next = base.clone();
    for (key, value) in token {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        next.insert(key.clone(), value);
    }
    if &next == current {
        warn!("continuation token did not advance, stopping");
        return None;
    }
    Some(next)
}

fn query_list<'a>(data: &'a Value, key: &str) -> &'a [Value] {
    data.get("query")
        .and_then(|q| q.get(key))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn category_titles(page: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    page.get("categories")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("title").and_then(Value::as_str))
        .map(str::trim)
        .filter(|t| !t.is_empty() && seen.insert(t.to_string()))
        .map(String::from)
        .collect()
}

/// Append categories from a continuation batch.
fn merge_categories(doc: &mut WikiPageDoc, data: &Value) {
    if let Some(page) = query_list(data, "pages").first() {
        for title in category_titles(page) {
            if !doc.categories.contains(&title) {
                doc.categories.push(title);
            }
        }
    }
}

fn http_info(response: &Response) -> HttpInfo {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    HttpInfo {
        status: Some(response.status().as_u16()),
        etag: header("etag"),
        last_modified: header("last-modified"),
        headers: response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect(),
    }
}

fn reqwest_error_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_body() {
        "body"
    } else if err.is_decode() {
        "decode"
    } else if err.is_request() {
        "request"
    } else {
        "other"
    }
}
