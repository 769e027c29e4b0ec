//! Orchestration for wikiharvest.
//!
//! This crate ties the crawler, classifier, and storage crates into runs:
//! - [`run::run_crawl`] / [`run::run_categories`]: crawl-side entry points
//! - [`run::run_classify`]: the classification pipeline wired to files and state
//! - [`ports`]: the capabilities the pipeline depends on
//! - [`sources`] and [`sinks`]: concrete page sources and outputs

pub mod pipeline;
pub mod ports;
pub mod run;
pub mod sinks;
pub mod sources;

pub use pipeline::{ClassificationPipeline, PipelineOptions};
pub use ports::{
    ClassificationLabelRecord, ClassificationReport, ClassificationSink, LoadedPage, PageSource,
    ReportSink, SourceRef, StateStore, StateStoreReport, StateStoreStatus,
};
pub use run::{run_categories, run_classify, run_crawl};
pub use sinks::{ClassifiedMirrorSink, CompositeSink, JsonReportSink, JsonlSink};
pub use sources::{AnyPageSource, FilePageSource, RegistryPageSource};
pub use wikiharvest_crawler::{CrawlProgress, SilentProgress};
