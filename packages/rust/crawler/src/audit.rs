//! Append-only JSONL log of every wiki API call attempt.
//!
//! One file per run (`api_calls_<run_id>.jsonl`). Writers share one lock, so
//! concurrent fetch tasks never interleave partial lines.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::Mutex;
use wikiharvest_shared::{HarvestError, PageId, Result};

/// Final classification of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    HttpError,
    RetryableError,
    FatalError,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub base_url: String,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpInfo {
    pub status: Option<u16>,
    pub etag: String,
    pub last_modified: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Timing {
    pub started_at: String,
    pub finished_at: String,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct ApiCallEvent {
    pub run_id: String,
    pub operation: String,
    pub page_id: Option<PageId>,
    pub attempt: u32,
    pub request: RequestInfo,
    pub http: Option<HttpInfo>,
    pub response_json: Option<serde_json::Value>,
    pub response_text: Option<String>,
    pub warnings: Option<serde_json::Value>,
    pub continue_token: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub timing: Timing,
    pub outcome: CallOutcome,
}

/// JSONL audit sink for one run.
pub struct ApiCallLog {
    path: PathBuf,
    run_id: String,
    file: Mutex<Option<File>>,
}

impl ApiCallLog {
    /// Create `dir` if needed and open `api_calls_<run_id>.jsonl` for appending.
    pub fn open(dir: &Path, run_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| HarvestError::io(dir, e))?;
        let path = dir.join(format!("api_calls_{run_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HarvestError::io(&path, e))?;

        Ok(Self {
            path,
            run_id: run_id.to_string(),
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Events without a run id get this log's run id.
    pub async fn write_event(&self, mut event: ApiCallEvent) -> Result<()> {
        if event.run_id.is_empty() {
            event.run_id = self.run_id.clone();
        }
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| HarvestError::validation("API call log is closed"))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| HarvestError::io(&self.path, e))
    }

    /// Flush and release the file. Later writes fail.
    pub async fn close(&self) {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn event(operation: &str, attempt: u32) -> ApiCallEvent {
        ApiCallEvent {
            run_id: String::new(),
            operation: operation.into(),
            page_id: Some(7),
            attempt,
            request: RequestInfo {
                base_url: "https://wiki.example.org/w/api.php".into(),
                params: BTreeMap::from([("action".into(), "query".into())]),
            },
            http: None,
            response_json: None,
            response_text: None,
            warnings: None,
            continue_token: None,
            error: Some(ErrorInfo {
                kind: "timeout".into(),
                message: "timed out".into(),
            }),
            timing: Timing {
                started_at: "t0".into(),
                finished_at: "t1".into(),
            },
            outcome: CallOutcome::RetryableError,
        }
    }

    #[tokio::test]
    async fn concurrent_writes_produce_whole_lines() {
        let dir = std::env::temp_dir().join(format!("wh_audit_{}", Uuid::now_v7()));
        let log = Arc::new(ApiCallLog::open(&dir, "run-1").expect("open log"));

        let mut handles = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.write_event(event("fetch_page_doc", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("write event");
        }
        log.close().await;

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 20);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            assert_eq!(value["run_id"], "run-1");
            assert_eq!(value["outcome"], "retryable_error");
            assert_eq!(value["error"]["type"], "timeout");
        }
        assert!(log.path().ends_with("api_calls_run-1.jsonl"));
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let dir = std::env::temp_dir().join(format!("wh_audit_{}", Uuid::now_v7()));
        let log = ApiCallLog::open(&dir, "run-2").unwrap();
        log.close().await;
        assert!(log.write_event(event("fetch_categories", 1)).await.is_err());
    }
}
