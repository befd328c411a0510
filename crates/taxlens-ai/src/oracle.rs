//! Contracts for the two outbound AI calls and validation of what comes back.
//!
//! Neither response is trusted: every field is checked against the closed
//! category set and the [0, 1] confidence range before it reaches the
//! classifier or the training pipeline.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taxlens_core::fragment::normalize_text;
use taxlens_core::{Amount, BusinessContext, Category, Direction, Rule};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response failed validation: {0}")]
    Schema(String),

    #[error("LLM endpoint is not configured")]
    NotConfigured,
}

impl From<serde_json::Error> for OracleError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// What the AI tier sends for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiRequest {
    pub narration: String,
    pub amount: Amount,
    pub direction: Direction,
    pub context: Option<BusinessContext>,
}

/// A validated classification suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct AiSuggestion {
    pub category: Category,
    pub confidence: f64,
    pub reasoning: String,
}

/// One labelled example handed to rule generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingSample {
    pub description: String,
    pub category: Category,
}

/// External classification service used by the AI tier.
#[async_trait]
pub trait CategoryOracle: Send + Sync {
    async fn suggest(&self, request: &AiRequest) -> Result<AiSuggestion, OracleError>;
}

/// External rule-generation service used during training. Advisory only.
#[async_trait]
pub trait RuleGenerator: Send + Sync {
    async fn generate_rules(&self, samples: &[TrainingSample]) -> Result<Vec<Rule>, OracleError>;
}

#[derive(Deserialize)]
struct RawSuggestion {
    category: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct RawRuleSet {
    rules: Vec<RawRule>,
}

#[derive(Deserialize)]
struct RawRule {
    pattern: String,
    category: String,
    confidence: f64,
}

/// Parse and validate a classification response body.
pub fn parse_suggestion(text: &str) -> Result<AiSuggestion, OracleError> {
    let raw: RawSuggestion = serde_json::from_str(strip_fences(text))?;
    let category = raw
        .category
        .parse::<Category>()
        .map_err(|e| OracleError::Schema(e.to_string()))?;
    check_confidence(raw.confidence)?;
    Ok(AiSuggestion {
        category,
        confidence: raw.confidence,
        reasoning: raw.reasoning.trim().to_string(),
    })
}

/// Parse and validate a rule-generation response body.
///
/// All-or-nothing: one invalid rule rejects the whole set. Patterns are
/// normalised so they match the way learned fragments do; duplicates keep
/// their first occurrence.
pub fn parse_rules(text: &str) -> Result<Vec<Rule>, OracleError> {
    let raw: RawRuleSet = serde_json::from_str(strip_fences(text))?;
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(raw.rules.len());
    for (i, r) in raw.rules.into_iter().enumerate() {
        let pattern = normalize_text(&r.pattern);
        if pattern.is_empty() {
            return Err(OracleError::Schema(format!("rule {i}: empty pattern")));
        }
        let category = r
            .category
            .parse::<Category>()
            .map_err(|e| OracleError::Schema(format!("rule {i}: {e}")))?;
        check_confidence(r.confidence)
            .map_err(|e| OracleError::Schema(format!("rule {i}: {e}")))?;
        if seen.insert(pattern.clone()) {
            rules.push(Rule {
                pattern,
                category,
                confidence: r.confidence,
            });
        }
    }
    Ok(rules)
}

fn check_confidence(c: f64) -> Result<(), OracleError> {
    if c.is_finite() && (0.0..=1.0).contains(&c) {
        Ok(())
    } else {
        Err(OracleError::Schema(format!("confidence {c} is outside [0, 1]")))
    }
}

/// Drop a surrounding markdown code fence, which models add despite being
/// told not to.
fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
