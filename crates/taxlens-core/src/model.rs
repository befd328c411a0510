//! Learned patterns, global rules, and deployable models.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::fragment::NarrationKey;

/// Scope-private mapping from a narration fragment to a category.
///
/// Confidence is always derived from the two counters, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub scope_id: String,
    pub fragment: String,
    pub category: Category,
    pub occurrence_count: i64,
    pub correct_predictions: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Pattern {
    pub fn confidence(&self) -> f64 {
        if self.occurrence_count <= 0 {
            return 0.0;
        }
        (self.correct_predictions as f64 / self.occurrence_count as f64).clamp(0.0, 1.0)
    }

    /// Ordering used when several patterns match one narration:
    /// higher confidence, then more recently used, then longer fragment.
    pub fn rank(&self, other: &Self) -> Ordering {
        self.confidence()
            .total_cmp(&other.confidence())
            .then_with(|| self.last_used_at.cmp(&other.last_used_at))
            .then_with(|| self.fragment.len().cmp(&other.fragment.len()))
    }
}

/// Best-ranked pattern among those matching `key`.
pub fn select_pattern<'a>(patterns: &'a [Pattern], key: &NarrationKey) -> Option<&'a Pattern> {
    patterns
        .iter()
        .filter(|p| key.matches(&p.fragment))
        .max_by(|a, b| a.rank(b))
}

/// One entry of a model's rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Normalised fragment.
    pub pattern: String,
    pub category: Category,
    pub confidence: f64,
}

/// Best-ranked rule matching `key`: highest confidence, then longest pattern,
/// then earliest position in the rule set.
pub fn select_rule<'a>(rules: &'a [Rule], key: &NarrationKey) -> Option<&'a Rule> {
    let mut best: Option<&Rule> = None;
    for rule in rules.iter().filter(|r| key.matches(&r.pattern)) {
        best = match best {
            None => Some(rule),
            Some(current) => {
                let ord = rule
                    .confidence
                    .total_cmp(&current.confidence)
                    .then_with(|| rule.pattern.len().cmp(&current.pattern.len()));
                if ord == Ordering::Greater {
                    Some(rule)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

/// Sort a rule set into matching priority order.
pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.pattern.len().cmp(&a.pattern.len()))
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Trained,
    Deployed,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trained => "trained",
            Self::Deployed => "deployed",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trained" => Ok(Self::Trained),
            "deployed" => Ok(Self::Deployed),
            other => Err(format!("unknown model status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// A globally applicable rule set. At most one is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub status: ModelStatus,
    pub is_active: bool,
    pub metrics: ModelMetrics,
    pub training_data_count: i64,
    pub rules: Vec<Rule>,
    pub trained_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Candidate produced by training, ready for the atomic deploy step.
#[derive(Debug, Clone, PartialEq)]
pub struct NewModel {
    pub name: String,
    pub metrics: ModelMetrics,
    pub training_data_count: i64,
    pub rules: Vec<Rule>,
    pub trained_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn pattern(fragment: &str, category: Category, occ: i64, correct: i64) -> Pattern {
        Pattern {
            scope_id: "s".into(),
            fragment: fragment.into(),
            category,
            occurrence_count: occ,
            correct_predictions: correct,
            created_at: t0(),
            last_used_at: t0(),
        }
    }

    fn rule(p: &str, category: Category, confidence: f64) -> Rule {
        Rule {
            pattern: p.into(),
            category,
            confidence,
        }
    }

    #[test]
    fn confidence_is_ratio() {
        assert_eq!(pattern("a", Category::Food, 4, 3).confidence(), 0.75);
        assert_eq!(pattern("a", Category::Food, 0, 0).confidence(), 0.0);
    }

    #[test]
    fn select_prefers_confidence() {
        let key = NarrationKey::new("SHOPRITE LEKKI MALL");
        let patterns = vec![
            pattern("shoprite lekki", Category::Food, 4, 2),
            pattern("shoprite", Category::Supplies, 2, 2),
        ];
        assert_eq!(
            select_pattern(&patterns, &key).unwrap().category,
            Category::Supplies
        );
    }

    #[test]
    fn select_breaks_ties_on_recency_then_length() {
        let key = NarrationKey::new("SHOPRITE LEKKI MALL");
        let mut older = pattern("shoprite lekki", Category::Food, 1, 1);
        let mut newer = pattern("shoprite", Category::Supplies, 1, 1);
        newer.last_used_at = t0() + Duration::days(1);
        let patterns = vec![older.clone(), newer.clone()];
        assert_eq!(
            select_pattern(&patterns, &key).unwrap().category,
            Category::Supplies
        );

        older.last_used_at = newer.last_used_at;
        let patterns = vec![newer, older];
        assert_eq!(
            select_pattern(&patterns, &key).unwrap().fragment,
            "shoprite lekki"
        );
    }

    #[test]
    fn select_ignores_non_matching() {
        let key = NarrationKey::new("DSTV SUBSCRIPTION");
        let patterns = vec![pattern("shoprite", Category::Supplies, 1, 1)];
        assert!(select_pattern(&patterns, &key).is_none());
    }

    #[test]
    fn select_rule_prefers_confidence_then_length() {
        let key = NarrationKey::new("TOTAL FILLING STATION IKOYI");
        let rules = vec![
            rule("total", Category::Transport, 0.7),
            rule("total filling", Category::Transport, 0.7),
            rule("filling station", Category::Supplies, 0.65),
        ];
        assert_eq!(select_rule(&rules, &key).unwrap().pattern, "total filling");
    }

    #[test]
    fn sort_rules_orders_by_priority() {
        let mut rules = vec![
            rule("a", Category::Food, 0.6),
            rule("bb", Category::Food, 0.9),
            rule("ccc", Category::Food, 0.6),
        ];
        sort_rules(&mut rules);
        let order: Vec<&str> = rules.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(order, vec!["bb", "ccc", "a"]);
    }

    #[test]
    fn status_round_trip() {
        assert_eq!("deployed".parse::<ModelStatus>().unwrap(), ModelStatus::Deployed);
        assert!("retired".parse::<ModelStatus>().is_err());
    }
}
