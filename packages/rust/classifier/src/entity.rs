//! Classification inputs and outputs.

use std::fmt;

use serde::{Deserialize, Serialize};
use wikiharvest_shared::{PageId, RevisionId};

use crate::rules::STRATEGY_VERSION;

/// The closed set of entity types a page can be labeled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Update,
    Cat,
    Enemy,
    Stage,
    List,
    Mechanic,
    Misc,
    Invalid,
}

impl EntityType {
    /// Every type, in report order.
    pub const ALL: [EntityType; 8] = [
        Self::Cat,
        Self::Enemy,
        Self::Stage,
        Self::Update,
        Self::Mechanic,
        Self::List,
        Self::Misc,
        Self::Invalid,
    ];

    /// Types that can win a scoring round, in tie-break order.
    pub const SCORED: [EntityType; 7] = [
        Self::Update,
        Self::Cat,
        Self::Enemy,
        Self::Stage,
        Self::List,
        Self::Mechanic,
        Self::Misc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Cat => "cat",
            Self::Enemy => "enemy",
            Self::Stage => "stage",
            Self::List => "list",
            Self::Mechanic => "mechanic",
            Self::Misc => "misc",
            Self::Invalid => "invalid",
        }
    }

    /// Lower wins when two types score equally.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Update => 0,
            Self::Cat => 1,
            Self::Enemy => 2,
            Self::Stage => 3,
            Self::List => 4,
            Self::Mechanic => 5,
            Self::Misc => 6,
            Self::Invalid => 7,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A page as seen by the classifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WikiPage {
    pub pageid: Option<PageId>,
    pub title: String,
    pub revid: Option<RevisionId>,
    pub timestamp: Option<String>,
    pub canonical_url: Option<String>,
    pub categories: Vec<String>,
    pub content: String,
    pub is_redirect: bool,
}

impl WikiPage {
    /// Stable key for state and mirror bookkeeping: the page id, else the title.
    pub fn doc_id(&self) -> String {
        match self.pageid {
            Some(id) => id.to_string(),
            None => self.title.clone(),
        }
    }
}

/// Result of classifying one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub entity_type: EntityType,
    /// Sorted and de-duplicated.
    pub subtypes: Vec<String>,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub matched_rules: Vec<String>,
    pub strategy_version: String,
    /// Set when the top two scores were too close to trust the winner.
    pub is_ambiguous: bool,
}

impl Classification {
    /// Label for a page that carries no usable page identifier.
    pub fn invalid(reason: &str) -> Self {
        Self {
            entity_type: EntityType::Invalid,
            subtypes: Vec::new(),
            confidence: 0.0,
            reasons: vec![reason.to_string()],
            matched_rules: Vec::new(),
            strategy_version: STRATEGY_VERSION.to_string(),
            is_ambiguous: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_prefers_page_id() {
        let mut page = WikiPage {
            pageid: Some(12),
            title: "Cat".into(),
            ..Default::default()
        };
        assert_eq!(page.doc_id(), "12");
        page.pageid = None;
        assert_eq!(page.doc_id(), "Cat");
    }

    #[test]
    fn entity_type_serializes_lowercase() {
        let json = serde_json::to_string(&EntityType::Mechanic).unwrap();
        assert_eq!(json, "\"mechanic\"");
        assert_eq!(EntityType::Invalid.to_string(), "invalid");
    }

    #[test]
    fn invalid_label_carries_reason() {
        let c = Classification::invalid("missing_pageid");
        assert_eq!(c.entity_type, EntityType::Invalid);
        assert_eq!(c.reasons, vec!["missing_pageid"]);
        assert_eq!(c.confidence, 0.0);
    }
}
