//! Narration normalisation and fragment derivation.
//!
//! Bank narrations mix channel noise ("POS PURCHASE AT", "NIP/TRF TO"),
//! reference numbers and the part that actually identifies the counterparty.
//! Learned patterns are keyed on the identifying part only, so the same
//! merchant seen through different channels maps to the same fragment.
//!
//! # Algorithm
//!
//! 1. Lowercase, replace every non-alphanumeric character with a space,
//!    collapse runs of whitespace ("normalised text").
//! 2. Drop channel/noise words and any token containing a digit
//!    ("significant tokens").
//! 3. Base fragment = first [`BASE_FRAGMENT_TOKENS`] significant tokens;
//!    specific fragment = first [`SPECIFIC_FRAGMENT_TOKENS`].
//! 4. With no significant tokens, fall back to the normalised text.

/// Tokens in a base fragment.
pub const BASE_FRAGMENT_TOKENS: usize = 3;

/// Tokens in a specific fragment, used when a base fragment is contested.
pub const SPECIFIC_FRAGMENT_TOKENS: usize = 6;

/// Channel and filler words that carry no counterparty information.
const NOISE_WORDS: &[&str] = &[
    "pos", "purchase", "purch", "payment", "pymt", "pmt", "trf", "tfr", "transfer", "nip",
    "nibss", "web", "ussd", "mobile", "app", "at", "to", "from", "for", "the", "of", "and",
    "by", "via", "in", "on", "ref", "reference", "txn", "trx", "trans", "ft", "debit",
    "credit", "dr", "cr", "ng", "nga", "lagos", "abuja", "wdl", "withdrawal", "tran",
];

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalised tokens with noise words and digit-bearing tokens removed.
pub fn significant_tokens(s: &str) -> Vec<String> {
    normalize_text(s)
        .split(' ')
        .filter(|t| !t.is_empty())
        .filter(|t| !t.chars().any(|c| c.is_ascii_digit()))
        .filter(|t| !NOISE_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn fragment_of(description: &str, tokens: usize) -> Option<String> {
    let significant = significant_tokens(description);
    let fragment = if significant.is_empty() {
        normalize_text(description)
    } else {
        significant
            .into_iter()
            .take(tokens)
            .collect::<Vec<_>>()
            .join(" ")
    };
    (!fragment.is_empty()).then_some(fragment)
}

/// Base fragment a correction on `description` is learned under.
///
/// Returns `None` when the description has no usable characters at all.
pub fn derive_fragment(description: &str) -> Option<String> {
    fragment_of(description, BASE_FRAGMENT_TOKENS)
}

/// Longer fragment used to disambiguate a contested base fragment.
pub fn specific_fragment(description: &str) -> Option<String> {
    fragment_of(description, SPECIFIC_FRAGMENT_TOKENS)
}

/// Pre-computed views of a narration for fragment matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrationKey {
    normalized: String,
    significant: String,
}

impl NarrationKey {
    pub fn new(narration: &str) -> Self {
        Self {
            normalized: normalize_text(narration),
            significant: significant_tokens(narration).join(" "),
        }
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn significant(&self) -> &str {
        &self.significant
    }

    /// Case-insensitive substring match against either view.
    ///
    /// `fragment` must already be normalised (as stored fragments and
    /// validated rule patterns are). Empty fragments never match.
    pub fn matches(&self, fragment: &str) -> bool {
        !fragment.is_empty()
            && (self.normalized.contains(fragment) || self.significant.contains(fragment))
    }
}
