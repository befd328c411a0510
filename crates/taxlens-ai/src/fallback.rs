//! Static keyword table: the classifier's terminal tier.

use taxlens_core::{Category, NarrationKey};

use crate::classifier::TierMatch;

/// Confidence of every fallback result, matched or not.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Whole-word phrases checked in order; the first hit wins. Statutory
/// charges come first so "EMTL CHARGE" is not read as a merchant.
const KEYWORDS: &[(&str, Category)] = &[
    ("emtl", Category::Financial),
    ("stamp duty", Category::Financial),
    ("sms alert", Category::Financial),
    ("reversal", Category::Refund),
    ("refund", Category::Refund),
    ("shoprite", Category::Supplies),
    ("spar", Category::Supplies),
    ("supermarket", Category::Supplies),
    ("stationery", Category::Supplies),
    ("chicken republic", Category::Food),
    ("restaurant", Category::Food),
    ("eatery", Category::Food),
    ("kfc", Category::Food),
    ("food", Category::Food),
    ("dstv", Category::Utilities),
    ("gotv", Category::Utilities),
    ("phcn", Category::Utilities),
    ("ikeja electric", Category::Utilities),
    ("ekedc", Category::Utilities),
    ("electricity", Category::Utilities),
    ("water", Category::Utilities),
    ("airtime", Category::Utilities),
    ("data", Category::Utilities),
    ("mtn", Category::Utilities),
    ("glo", Category::Utilities),
    ("airtel", Category::Utilities),
    ("uber", Category::Transport),
    ("bolt", Category::Transport),
    ("fuel", Category::Transport),
    ("petrol", Category::Transport),
    ("filling station", Category::Transport),
    ("transport", Category::Transport),
    ("school fees", Category::Education),
    ("tuition", Category::Education),
    ("hospital", Category::Medical),
    ("pharmacy", Category::Medical),
    ("clinic", Category::Medical),
    ("insurance", Category::Insurance),
    ("premium", Category::Insurance),
    ("rent", Category::Rent),
    ("landlord", Category::Rent),
    ("salary", Category::Services),
    ("consultant", Category::Services),
    ("professional fee", Category::Services),
    ("cement", Category::Materials),
    ("building materials", Category::Materials),
    ("laptop", Category::Equipment),
    ("generator", Category::Equipment),
    ("equipment", Category::Equipment),
    ("interest", Category::Financial),
    ("loan", Category::Financial),
    ("commission", Category::Financial),
    ("bank charges", Category::Financial),
    ("bank charge", Category::Financial),
    ("maintenance fee", Category::Financial),
];

/// Look the narration up in the keyword table. Never fails: a miss yields
/// [`Category::Other`].
pub fn fallback_match(key: &NarrationKey) -> TierMatch {
    let padded = format!(" {} ", key.normalized());
    let hit = KEYWORDS
        .iter()
        .find(|(keyword, _)| padded.contains(&format!(" {keyword} ")));

    match hit {
        Some((keyword, category)) => TierMatch {
            category: *category,
            confidence: FALLBACK_CONFIDENCE,
            reason: format!("keyword '{keyword}'"),
        },
        None => TierMatch {
            category: Category::Other,
            confidence: FALLBACK_CONFIDENCE,
            reason: "no keyword matched".to_string(),
        },
    }
}
