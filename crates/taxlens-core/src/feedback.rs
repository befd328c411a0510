//! User corrections and confirmations: the raw material for learning.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};

use crate::category::{Category, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionType {
    /// User accepted the predicted category.
    Confirmation,
    /// User adjusted the prediction.
    PartialEdit,
    /// User replaced the prediction outright.
    FullOverride,
}

impl CorrectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::PartialEdit => "partial_edit",
            Self::FullOverride => "full_override",
        }
    }
}

impl fmt::Display for CorrectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "confirmation" | "confirm" => Ok(Self::Confirmation),
            "partial_edit" | "edit" => Ok(Self::PartialEdit),
            "full_override" | "override" => Ok(Self::FullOverride),
            other => Err(format!("unknown correction type: {other}")),
        }
    }
}

/// What the classifier said at the time the user acted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub category: Category,
    pub confidence: f64,
    pub tier: Tier,
}

/// A confirm/correct action as submitted by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub scope_id: String,
    pub description: String,
    pub predicted: Prediction,
    pub corrected: Category,
    pub correction_type: CorrectionType,
    /// Caller-side identity of the event (e.g. transaction id). Two
    /// corrections with the same reference are the same event.
    #[serde(default)]
    pub reference: Option<String>,
}

impl Correction {
    /// Whether this correction should touch the pattern store.
    pub fn teaches(&self) -> bool {
        self.correction_type == CorrectionType::Confirmation
            || self.corrected != self.predicted.category
    }

    /// Stable key identifying this event across retries.
    ///
    /// The caller's reference when given, otherwise a SHA-256 fingerprint of
    /// every field.
    pub fn idempotency_key(&self) -> String {
        if let Some(r) = self.reference.as_deref().map(str::trim)
            && !r.is_empty()
        {
            return format!("ref:{}:{}", self.scope_id, r);
        }

        let material = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{:.4}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.scope_id,
            self.description,
            self.predicted.category,
            self.predicted.confidence,
            self.predicted.tier,
            self.corrected,
            self.correction_type,
        );
        let hash = digest(&SHA256, material.as_bytes());
        let hex: String = hash.as_ref().iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256:{hex}")
    }
}

/// A persisted correction.
///
/// Immutable except for `used_in_training` / `training_batch_id`, which the
/// training pipeline sets once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: i64,
    pub idempotency_key: String,
    pub scope_id: String,
    pub description: String,
    pub predicted: Prediction,
    pub corrected: Category,
    pub correction_type: CorrectionType,
    pub used_in_training: bool,
    pub training_batch_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate view over the feedback ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackStats {
    pub total: usize,
    pub unused: usize,
    pub confirmations: usize,
    pub partial_edits: usize,
    pub full_overrides: usize,
}

impl FeedbackStats {
    /// Share of feedback where the user agreed with the prediction.
    pub fn confirmation_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.confirmations as f64 / self.total as f64)
    }
}
