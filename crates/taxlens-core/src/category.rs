//! Tax-relevant categories and the resolution tiers that assign them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

/// Closed set of categories a transaction can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Food,
    Equipment,
    Services,
    Materials,
    Utilities,
    Supplies,
    Medical,
    Education,
    Agriculture,
    Export,
    Rent,
    Financial,
    Insurance,
    Transport,
    NonTaxable,
    Capital,
    Gift,
    Refund,
    /// Movement between the owner's own accounts.
    Transfer,
    Other,
}

impl Category {
    pub const ALL: &'static [Category] = &[
        Self::Food,
        Self::Equipment,
        Self::Services,
        Self::Materials,
        Self::Utilities,
        Self::Supplies,
        Self::Medical,
        Self::Education,
        Self::Agriculture,
        Self::Export,
        Self::Rent,
        Self::Financial,
        Self::Insurance,
        Self::Transport,
        Self::NonTaxable,
        Self::Capital,
        Self::Gift,
        Self::Refund,
        Self::Transfer,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Food => "food",
            Self::Equipment => "equipment",
            Self::Services => "services",
            Self::Materials => "materials",
            Self::Utilities => "utilities",
            Self::Supplies => "supplies",
            Self::Medical => "medical",
            Self::Education => "education",
            Self::Agriculture => "agriculture",
            Self::Export => "export",
            Self::Rent => "rent",
            Self::Financial => "financial",
            Self::Insurance => "insurance",
            Self::Transport => "transport",
            Self::NonTaxable => "non_taxable",
            Self::Capital => "capital",
            Self::Gift => "gift",
            Self::Refund => "refund",
            Self::Transfer => "transfer",
            Self::Other => "other",
        }
    }

    /// Categories that never enter the taxable ledger, whatever the confidence.
    pub fn is_exclusion(&self) -> bool {
        matches!(
            self,
            Self::Gift | Self::Refund | Self::Transfer | Self::NonTaxable
        )
    }

    /// Categories outside the VAT net.
    pub fn is_vat_exempt(&self) -> bool {
        matches!(
            self,
            Self::Financial
                | Self::Insurance
                | Self::Rent
                | Self::Export
                | Self::NonTaxable
                | Self::Gift
                | Self::Refund
                | Self::Transfer
        )
    }

    /// Categories subject to withholding tax when paid out.
    pub fn attracts_withholding(&self) -> bool {
        matches!(self, Self::Services | Self::Rent)
    }

    /// Operating-expense categories that reduce taxable profit when paid out.
    ///
    /// Capital purchases go through capital allowances instead, and `other`
    /// is unknown by definition.
    pub fn is_business_expense(&self) -> bool {
        matches!(
            self,
            Self::Food
                | Self::Equipment
                | Self::Services
                | Self::Materials
                | Self::Utilities
                | Self::Supplies
                | Self::Medical
                | Self::Education
                | Self::Agriculture
                | Self::Rent
                | Self::Financial
                | Self::Insurance
                | Self::Transport
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnknownCategory;

    /// Accepts any casing and `-`/space separators, plus a few common aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let category = match key.as_str() {
            "internal_transfer" | "own_transfer" => Self::Transfer,
            "nontaxable" | "non_taxable_income" => Self::NonTaxable,
            "utility" => Self::Utilities,
            "supply" => Self::Supplies,
            _ => Self::ALL
                .iter()
                .copied()
                .find(|c| c.as_str() == key)
                .ok_or_else(|| UnknownCategory(s.to_string()))?,
        };
        Ok(category)
    }
}

/// Resolution stage that produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Scope-private learned pattern.
    Pattern,
    /// Rule from the active global model.
    Model,
    /// External classification service.
    Ai,
    /// Static keyword table.
    Fallback,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Model => "model",
            Self::Ai => "ai",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pattern" => Ok(Self::Pattern),
            "model" => Ok(Self::Model),
            "ai" => Ok(Self::Ai),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}
