//! Rule-based wiki page classification.
//!
//! - [`RuleBasedClassifier`]: weighted rules, tie-break, low-margin downgrade, subtype tags
//! - [`incremental::decide`]: skip pages whose fingerprint has not changed
//! - [`rules`]: the rule tables and [`STRATEGY_VERSION`]

pub mod classifier;
pub mod entity;
pub mod incremental;
pub mod rules;

pub use classifier::{RuleBasedClassifier, slugify};
pub use entity::{Classification, EntityType, WikiPage};
pub use incremental::{DecisionReason, IncrementalDecision, decide};
pub use rules::{LOW_MARGIN_THRESHOLD, STRATEGY_VERSION};
