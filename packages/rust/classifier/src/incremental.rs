//! Decides whether a page must be reclassified given its last recorded fingerprint.
//!
//! The revision id is the primary change signal; the content hash backs it up
//! and is the only signal for pages without a revision.

use std::fmt;

use wikiharvest_shared::{PageFingerprint, StateFingerprint};

/// Why a page was (or was not) reclassified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionReason {
    StateMiss,
    SourceModeChanged,
    StrategyVersionChanged,
    HashMissing,
    ExistingRevidMissing,
    RevidChanged,
    ExistingHashMissing,
    ContentHashChangedSameRevid,
    RevidAndHashHit,
    ContentHashChanged,
    ContentHashHit,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateMiss => "state_miss",
            Self::SourceModeChanged => "source_mode_changed",
            Self::StrategyVersionChanged => "strategy_version_changed",
            Self::HashMissing => "hash_missing",
            Self::ExistingRevidMissing => "existing_revid_missing",
            Self::RevidChanged => "revid_changed",
            Self::ExistingHashMissing => "existing_hash_missing",
            Self::ContentHashChangedSameRevid => "content_hash_changed_same_revid",
            Self::RevidAndHashHit => "revid_and_hash_hit",
            Self::ContentHashChanged => "content_hash_changed",
            Self::ContentHashHit => "content_hash_hit",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalDecision {
    pub should_classify: bool,
    pub reason: DecisionReason,
}

impl IncrementalDecision {
    fn classify(reason: DecisionReason) -> Self {
        Self {
            should_classify: true,
            reason,
        }
    }

    fn skip(reason: DecisionReason) -> Self {
        Self {
            should_classify: false,
            reason,
        }
    }
}

/// Compare the stored fingerprint (if any) with the current one.
pub fn decide(existing: Option<&StateFingerprint>, current: &PageFingerprint) -> IncrementalDecision {
    use DecisionReason::*;

    let Some(existing) = existing else {
        return IncrementalDecision::classify(StateMiss);
    };
    if existing.source_mode != current.source_mode {
        return IncrementalDecision::classify(SourceModeChanged);
    }
    if existing.strategy_version != current.strategy_version {
        return IncrementalDecision::classify(StrategyVersionChanged);
    }
    let Some(current_hash) = current.content_hash.as_deref() else {
        return IncrementalDecision::classify(HashMissing);
    };

    match current.revision_id {
        Some(current_revid) => {
            let Some(existing_revid) = existing.revision_id else {
                return IncrementalDecision::classify(ExistingRevidMissing);
            };
            if existing_revid != current_revid {
                return IncrementalDecision::classify(RevidChanged);
            }
            match existing.content_hash.as_deref() {
                None => IncrementalDecision::classify(ExistingHashMissing),
                Some(h) if h != current_hash => {
                    IncrementalDecision::classify(ContentHashChangedSameRevid)
                }
                Some(_) => IncrementalDecision::skip(RevidAndHashHit),
            }
        }
        None if existing.content_hash.as_deref() == Some(current_hash) => {
            IncrementalDecision::skip(ContentHashHit)
        }
        None => IncrementalDecision::classify(ContentHashChanged),
    }
}
