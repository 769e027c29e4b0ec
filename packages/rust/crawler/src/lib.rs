//! MediaWiki crawling: discovery, revision diffing, and page fetch.
//!
//! This crate provides:
//! - [`client`]: API client with retry, pagination, and per-call audit
//! - [`engine`]: the incremental [`CrawlWorkflow`] and its [`CrawlProgress`] hook
//! - [`documents`]: per-page JSON documents on disk
//! - [`audit`]: append-only JSONL log of every API attempt

pub mod audit;
pub mod client;
pub mod documents;
pub mod engine;
pub mod retry;

pub use audit::{ApiCallEvent, ApiCallLog, CallOutcome};
pub use client::{ApiResponse, MediaWikiClient, Params, RemoteListing};
pub use documents::DocumentStore;
pub use engine::{CrawlProgress, CrawlWorkflow, PageOutcome, SilentProgress, compute_work_set};
pub use retry::RetryPolicy;
