//! Confidence & review policy: decides whether a classification can be booked
//! automatically or must be confirmed by a human.

use serde::{Deserialize, Serialize};

use crate::category::{Category, Tier};
use crate::config::ReviewConfig;
use crate::fragment::{normalize_text, significant_tokens};
use crate::transaction::Amount;

/// Words that make a narration too vague to trust an AI guess on.
const VAGUE_WORDS: &[&str] = &[
    "misc",
    "miscellaneous",
    "sundry",
    "sundries",
    "various",
    "general",
    "others",
    "cash",
    "item",
    "items",
    "stuff",
    "goods",
    "bill",
    "expenses",
    "settlement",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    AutoInclude,
    AutoExclude,
    AskUser,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoInclude => "auto_include",
            Self::AutoExclude => "auto_exclude",
            Self::AskUser => "ask_user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub action: ReviewAction,
    pub reason: String,
}

impl ReviewDecision {
    pub fn needs_confirmation(&self) -> bool {
        self.action == ReviewAction::AskUser
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReviewInput<'a> {
    pub category: Category,
    pub confidence: f64,
    pub tier: Tier,
    pub amount: Amount,
    pub narration: &'a str,
    /// Typical transaction size for the scope, if known.
    pub typical_amount: Option<Amount>,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewPolicy {
    config: ReviewConfig,
}

impl ReviewPolicy {
    pub fn new(config: ReviewConfig) -> Self {
        Self { config }
    }

    /// Evaluate a classification. Pure: same input, same decision.
    pub fn evaluate(&self, input: &ReviewInput<'_>) -> ReviewDecision {
        let cfg = &self.config;

        if input.category.is_exclusion() {
            return decision(
                ReviewAction::AutoExclude,
                format!("{} is excluded from taxable records", input.category),
            );
        }

        if input.tier == Tier::Ai {
            if is_vague(input.narration) {
                return decision(
                    ReviewAction::AskUser,
                    "AI guess on a vague narration".to_string(),
                );
            }
            if self.is_large_round(input.amount, input.typical_amount) {
                return decision(
                    ReviewAction::AskUser,
                    format!("AI guess on a large round amount ({})", input.amount),
                );
            }
        }

        if input.confidence >= cfg.high_threshold {
            return decision(
                ReviewAction::AutoInclude,
                format!(
                    "high confidence {:.2} from {} tier",
                    input.confidence, input.tier
                ),
            );
        }

        if input.confidence < cfg.low_threshold {
            return decision(
                ReviewAction::AskUser,
                format!(
                    "low confidence {:.2} from {} tier",
                    input.confidence, input.tier
                ),
            );
        }

        decision(
            ReviewAction::AutoInclude,
            format!(
                "moderate confidence {:.2} from {} tier",
                input.confidence, input.tier
            ),
        )
    }

    /// Large relative to the scope's typical activity, and a round figure.
    pub fn is_large_round(&self, amount: Amount, typical: Option<Amount>) -> bool {
        let cfg = &self.config;
        if !amount.is_multiple_of(cfg.round_step_minor) {
            return false;
        }
        match typical {
            Some(t) if t.is_positive() => {
                amount.minor() as f64 >= t.minor() as f64 * cfg.large_amount_multiple
            }
            _ => amount.minor() >= cfg.large_amount_minor,
        }
    }
}

/// Narration carries a vague keyword, or nothing but channel noise.
pub fn is_vague(narration: &str) -> bool {
    let normalized = normalize_text(narration);
    if normalized.split(' ').any(|t| VAGUE_WORDS.contains(&t)) {
        return true;
    }
    significant_tokens(narration).is_empty()
}

fn decision(action: ReviewAction, reason: String) -> ReviewDecision {
    ReviewDecision { action, reason }
}
