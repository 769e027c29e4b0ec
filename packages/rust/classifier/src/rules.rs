//! Rule tables: weighted primary rules and per-type subtype patterns.
//!
//! Bump [`STRATEGY_VERSION`] whenever any table here changes; the incremental
//! engine uses it to force reclassification.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::entity::EntityType;

/// Version tag of the current rule set.
pub const STRATEGY_VERSION: &str = "1.1.0";

/// Default best-versus-runner-up gap below which a result is ambiguous.
pub const LOW_MARGIN_THRESHOLD: f64 = 0.15;

/// Which part of a page a primary rule is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    /// Any single normalized category.
    Category,
    Title,
    Content,
    /// Title, content, and categories joined by newlines.
    Combined,
}

/// A weighted rule voting for one entity type.
#[derive(Debug)]
pub struct Rule {
    pub id: &'static str,
    pub target: EntityType,
    pub weight: f64,
    pub source: RuleSource,
    pub pattern: Regex,
}

/// Pattern to tag template; `{1}`, `{2}` … are replaced by slugified capture groups.
#[derive(Debug)]
pub struct SubtypePattern {
    pub pattern: Regex,
    pub template: &'static str,
}

fn rx(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|e| panic!("invalid built-in pattern {pattern:?}: {e}"))
}

fn rule(
    id: &'static str,
    target: EntityType,
    weight: f64,
    source: RuleSource,
    pattern: &str,
) -> Rule {
    Rule {
        id,
        target,
        weight,
        source,
        pattern: rx(pattern),
    }
}

fn table(entries: &[(&str, &'static str)]) -> Vec<SubtypePattern> {
    entries
        .iter()
        .map(|&(pattern, template)| SubtypePattern {
            pattern: rx(pattern),
            template,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Primary rules
// ---------------------------------------------------------------------------

pub static PRIMARY_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use EntityType::*;
    use RuleSource::*;
    vec![
        rule("update_category_versions", Update, 1.0, Category, r"^category:versions$"),
        rule(
            "update_title_or_content",
            Update,
            0.85,
            Combined,
            r"(version\s*\d+\.\d+|update|patch\s*notes?)",
        ),
        rule("cat_units", Cat, 1.0, Category, r"^category:cat units$"),
        rule("cat_general", Cat, 0.8, Category, r"^category:.*cats$"),
        rule("enemy_units", Enemy, 1.0, Category, r"^category:enemy units$"),
        rule("enemy_general", Enemy, 0.8, Category, r"^category:.*enemies$"),
        rule("stage_general", Stage, 0.95, Category, r"^category:.*stages$"),
        rule(
            "list_title",
            List,
            0.85,
            Title,
            r"^(list of|.*(comparison|release order|drop table).*)$",
        ),
        rule(
            "list_content",
            List,
            0.75,
            Content,
            r"(==\s*list of|release order|drop table)",
        ),
        rule(
            "mechanic_title_or_category",
            Mechanic,
            0.7,
            Combined,
            r"(mechanic|ability|trait|talent|damage|range)",
        ),
    ]
});

// ---------------------------------------------------------------------------
// Subtype tables
// ---------------------------------------------------------------------------

static CAT_SUBTYPES: LazyLock<Vec<SubtypePattern>> = LazyLock::new(|| {
    table(&[
        (r"category:normal cats", "rarity:normal"),
        (r"category:special cats", "rarity:special"),
        (r"category:rare cats", "rarity:rare"),
        (r"category:super rare cats", "rarity:super_rare"),
        (r"category:uber rare cats", "rarity:uber_rare"),
        (r"category:legend rare cats", "rarity:legend_rare"),
        (r"category:anti-(.+) cats", "target_trait:{1}"),
        (r"category:(.+)-class cats", "role_class:{1}"),
        (r"category:single attack cats", "attack_type:single"),
        (r"category:area attack cats", "attack_type:area"),
        (r"category:long distance cats", "attack_type:long_distance"),
        (r"category:omni strike cats", "attack_type:omni"),
        (r"category:surge attack cats", "attack_type:surge"),
        (r"category:wave attack cats", "attack_type:wave"),
        (r"category:.*killer cats", "ability:killer"),
        (r"category:.*slayer cats", "ability:slayer"),
        (r"category:event capsule cats", "source:event_capsule"),
        (r"category:gacha cats", "source:gacha"),
        (r"category:collaboration event cats", "source:collaboration"),
    ])
});

static ENEMY_SUBTYPES: LazyLock<Vec<SubtypePattern>> = LazyLock::new(|| {
    table(&[
        (r"category:(.+) enemies", "trait:{1}"),
        (r"category:enemies with (.+) ability", "ability:{1}"),
        (r"category:enemies with (.+)", "ability:{1}"),
        (r"category:event enemies", "campaign_scope:event"),
        (r"category:empire of cats enemies", "campaign_scope:eoc"),
        (r"category:into the future enemies", "campaign_scope:itf"),
        (r"category:stories of legend enemies", "campaign_scope:sol"),
        (r"category:uncanny legends enemies", "campaign_scope:ul"),
        (r"category:zero legends enemies", "campaign_scope:zl"),
    ])
});

static STAGE_SUBTYPES: LazyLock<Vec<SubtypePattern>> = LazyLock::new(|| {
    table(&[
        (r"category:(.+) stages", "stage_family:{1}"),
        (r"category:empire of cats stages", "progression:eoc"),
        (r"category:into the future stages", "progression:itf"),
        (r"category:stories of legend stages", "progression:sol"),
        (r"category:uncanny legends stages", "progression:ul"),
        (r"category:zero legends stages", "progression:zl"),
        (r"category:sub-chapter (\d+) stages", "progression:subchapter_{1}"),
        (r"category:timed score stages", "modifier:timed_score"),
        (r"category:no continue stages", "modifier:no_continue"),
        (r"category:continuation stages", "modifier:continuation"),
    ])
});

static UPDATE_SUBTYPES: LazyLock<Vec<SubtypePattern>> = LazyLock::new(|| {
    table(&[
        (r"version\s*(\d+\.\d+)", "version_line:{1}"),
        (r"patch\s*notes?", "content_kind:patch_notes"),
        (r"balance", "content_kind:balance"),
    ])
});

static MECHANIC_SUBTYPES: LazyLock<Vec<SubtypePattern>> = LazyLock::new(|| {
    table(&[
        (r"trait", "mechanic_domain:trait"),
        (r"ability", "mechanic_domain:ability"),
        (r"talent", "mechanic_domain:talent"),
        (r"damage|range", "mechanic_domain:combat"),
    ])
});

static LIST_SUBTYPES: LazyLock<Vec<SubtypePattern>> = LazyLock::new(|| {
    table(&[
        (r"list of enemies", "list_kind:enemy_list"),
        (r"list of stages", "list_kind:stage_list"),
        (r"drop table", "list_kind:drop_table"),
        (r"release order", "list_kind:release_order"),
        (r"comparison", "list_kind:comparison"),
    ])
});

/// Subtype patterns for `entity`: (matched per category, matched against title + content).
pub fn subtype_patterns(
    entity: EntityType,
) -> (&'static [SubtypePattern], &'static [SubtypePattern]) {
    match entity {
        EntityType::Cat => (CAT_SUBTYPES.as_slice(), &[]),
        EntityType::Enemy => (ENEMY_SUBTYPES.as_slice(), &[]),
        EntityType::Stage => (STAGE_SUBTYPES.as_slice(), &[]),
        EntityType::Update => (&[], UPDATE_SUBTYPES.as_slice()),
        EntityType::Mechanic => (&[], MECHANIC_SUBTYPES.as_slice()),
        EntityType::List => (&[], LIST_SUBTYPES.as_slice()),
        EntityType::Misc | EntityType::Invalid => (&[], &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_tables_compile() {
        assert_eq!(PRIMARY_RULES.len(), 10);
        for entity in EntityType::ALL {
            let _ = subtype_patterns(entity);
        }
    }

    #[test]
    fn rule_ids_are_unique() {
        let mut ids: Vec<_> = PRIMARY_RULES.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), PRIMARY_RULES.len());
    }

    #[test]
    fn patterns_are_case_insensitive() {
        let cat_units = PRIMARY_RULES.iter().find(|r| r.id == "cat_units").unwrap();
        assert!(cat_units.pattern.is_match("Category:Cat Units"));
        assert!(!cat_units.pattern.is_match("category:cat units extra"));
    }
}
