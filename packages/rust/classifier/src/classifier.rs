//! Deterministic rule-based page classifier.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use regex::Captures;

use crate::entity::{Classification, EntityType, WikiPage};
use crate::rules::{
    LOW_MARGIN_THRESHOLD, PRIMARY_RULES, Rule, RuleSource, STRATEGY_VERSION, SubtypePattern,
    subtype_patterns,
};

/// Lower bound on the confidence denominator.
const MIN_DENOMINATOR: f64 = 1e-6;

/// Scores pages against [`PRIMARY_RULES`] and extracts subtype tags for the winner.
#[derive(Debug, Clone)]
pub struct RuleBasedClassifier {
    low_margin_threshold: f64,
}

impl Default for RuleBasedClassifier {
    fn default() -> Self {
        Self::new(LOW_MARGIN_THRESHOLD)
    }
}

impl RuleBasedClassifier {
    pub fn new(low_margin_threshold: f64) -> Self {
        Self {
            low_margin_threshold,
        }
    }

    pub fn low_margin_threshold(&self) -> f64 {
        self.low_margin_threshold
    }

    /// Classify one page. Pure: the same page always yields the same result.
    pub fn classify(&self, page: &WikiPage) -> Classification {
        let categories: Vec<String> = page
            .categories
            .iter()
            .map(|c| c.trim().to_lowercase())
            .collect();

        let mut scores = [0.0_f64; EntityType::SCORED.len()];
        let mut matched: [Vec<&'static str>; EntityType::SCORED.len()] = Default::default();

        for rule in PRIMARY_RULES.iter() {
            if rule_matches(rule, &categories, &page.title, &page.content) {
                let slot = rule.target.priority() as usize;
                scores[slot] += rule.weight;
                matched[slot].push(rule.id);
            }
        }

        let (best, second) = top_two(&scores);
        let best_score = scores[best.priority() as usize];
        let second_score = scores[second.priority() as usize];

        if best == EntityType::Misc || best_score <= 0.0 {
            return Classification {
                entity_type: EntityType::Misc,
                subtypes: Vec::new(),
                confidence: 0.0,
                reasons: vec!["no_rule_match".to_string()],
                matched_rules: Vec::new(),
                strategy_version: STRATEGY_VERSION.to_string(),
                is_ambiguous: false,
            };
        }

        let confidence = best_score / (best_score + second_score).max(MIN_DENOMINATOR);
        let margin = best_score - second_score;

        if margin < self.low_margin_threshold {
            let rules: BTreeSet<&str> = matched[best.priority() as usize]
                .iter()
                .chain(matched[second.priority() as usize].iter())
                .copied()
                .collect();
            return Classification {
                entity_type: EntityType::Misc,
                subtypes: Vec::new(),
                confidence,
                reasons: vec![format!("low_margin_conflict:{best}_vs_{second}")],
                matched_rules: rules.into_iter().map(String::from).collect(),
                strategy_version: STRATEGY_VERSION.to_string(),
                is_ambiguous: true,
            };
        }

        let rules: BTreeSet<&str> = matched[best.priority() as usize].iter().copied().collect();
        Classification {
            entity_type: best,
            subtypes: extract_subtypes(best, &categories, &page.title, &page.content),
            confidence,
            reasons: Vec::new(),
            matched_rules: rules.into_iter().map(String::from).collect(),
            strategy_version: STRATEGY_VERSION.to_string(),
            is_ambiguous: false,
        }
    }
}

fn rule_matches(rule: &Rule, categories: &[String], title: &str, content: &str) -> bool {
    match rule.source {
        RuleSource::Category => categories.iter().any(|c| rule.pattern.is_match(c)),
        RuleSource::Title => rule.pattern.is_match(title),
        RuleSource::Content => rule.pattern.is_match(content),
        RuleSource::Combined => {
            let combined = format!("{title}\n{content}\n{}", categories.join("\n"));
            rule.pattern.is_match(&combined)
        }
    }
}

/// Highest and second-highest scoring types; ties go to the lower priority value.
fn top_two(scores: &[f64]) -> (EntityType, EntityType) {
    let mut ranked = EntityType::SCORED;
    ranked.sort_by(|a, b| {
        let sa = scores[a.priority() as usize];
        let sb = scores[b.priority() as usize];
        sb.partial_cmp(&sa)
            .unwrap_or(Ordering::Equal)
            .then(a.priority().cmp(&b.priority()))
    });
    (ranked[0], ranked[1])
}

fn extract_subtypes(
    entity: EntityType,
    categories: &[String],
    title: &str,
    content: &str,
) -> Vec<String> {
    let (per_category, per_text) = subtype_patterns(entity);
    let mut tags = BTreeSet::new();

    for category in categories {
        collect_tags(category, per_category, &mut tags);
    }
    collect_tags(&format!("{title}\n{content}"), per_text, &mut tags);

    tags.into_iter().collect()
}

fn collect_tags(text: &str, patterns: &[SubtypePattern], tags: &mut BTreeSet<String>) {
    for entry in patterns {
        if let Some(caps) = entry.pattern.captures(text) {
            tags.insert(render_template(entry.template, &caps));
        }
    }
}

fn render_template(template: &str, caps: &Captures<'_>) -> String {
    let mut tag = template.to_string();
    for idx in 1..caps.len() {
        let value = caps.get(idx).map_or("", |m| m.as_str());
        tag = tag.replace(&format!("{{{idx}}}"), &slugify(value));
    }
    tag
}

/// Lowercase, trim, map spaces, hyphens, and slashes to `_`, and drop apostrophes.
pub fn slugify(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'')
        .map(|c| if matches!(c, ' ' | '-' | '/') { '_' } else { c })
        .collect()
}
