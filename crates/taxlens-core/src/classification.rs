//! The classifier's output contract.

use serde::{Deserialize, Serialize};

use crate::category::{Category, Tier};
use crate::flags::{Flags, TaxImplications};
use crate::policy::{ReviewAction, ReviewDecision};

/// Classification of a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    /// Always within [0, 1].
    pub confidence: f64,
    pub tier: Tier,
    /// Why the resolving tier picked this category.
    pub reason: String,
    pub flags: Flags,
    pub tax_implications: TaxImplications,
    pub action: ReviewAction,
    pub needs_confirmation: bool,
    /// Why the review policy chose `action`.
    pub review_reason: String,
}

impl ClassificationResult {
    pub fn new(
        category: Category,
        confidence: f64,
        tier: Tier,
        reason: String,
        flags: Flags,
        tax_implications: TaxImplications,
        review: ReviewDecision,
    ) -> Self {
        Self {
            category,
            confidence: clamp_confidence(confidence),
            tier,
            reason,
            flags,
            tax_implications,
            needs_confirmation: review.needs_confirmation(),
            action: review.action,
            review_reason: review.reason,
        }
    }
}

/// Clamp into [0, 1], mapping NaN to 0.
pub fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}
