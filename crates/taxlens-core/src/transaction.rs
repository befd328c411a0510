//! Raw bank transactions as supplied by ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("narration is empty")]
    EmptyNarration,

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("invalid amount: {0:?}")]
    InvalidAmount(String),

    #[error("invalid direction: {0:?} (expected credit or debit)")]
    InvalidDirection(String),
}

/// Monetary amount in minor units (kobo for NGN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn from_major(major: i64) -> Self {
        Self(major * 100)
    }

    pub const fn minor(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Whether the amount is an exact multiple of `step_minor`.
    pub fn is_multiple_of(&self, step_minor: i64) -> bool {
        step_minor > 0 && self.0 % step_minor == 0
    }

    /// Parse a decimal string with at most two fractional digits.
    ///
    /// Accepts thousands separators (`15,000.50`) and a leading `-`.
    pub fn parse(s: &str) -> Result<Self, TransactionError> {
        let invalid = || TransactionError::InvalidAmount(s.to_string());

        let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
        let (negative, digits) = match cleaned.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, cleaned.as_str()),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole_val: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_val: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        let minor = whole_val
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac_val))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -minor } else { minor }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Amount {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "credit" | "cr" => Ok(Self::Credit),
            "debit" | "dr" => Ok(Self::Debit),
            _ => Err(TransactionError::InvalidDirection(s.to_string())),
        }
    }
}

/// A single bank transaction. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub narration: String,
    pub amount: Amount,
    pub direction: Direction,
    pub date: NaiveDate,
    /// Business or user boundary for learned patterns.
    #[serde(default)]
    pub scope_id: Option<String>,
}

impl Transaction {
    pub fn new(
        narration: impl Into<String>,
        amount: Amount,
        direction: Direction,
        date: NaiveDate,
    ) -> Self {
        Self {
            narration: narration.into(),
            amount,
            direction,
            date,
            scope_id: None,
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Reject transactions the classifier cannot work with.
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.narration.trim().is_empty() {
            return Err(TransactionError::EmptyNarration);
        }
        if !self.amount.is_positive() {
            return Err(TransactionError::NonPositiveAmount(self.amount));
        }
        Ok(())
    }
}

/// Optional business profile supplied alongside a scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessContext {
    pub name: Option<String>,
    pub industry: Option<String>,
    /// Typical single-transaction size for this business.
    pub typical_amount: Option<Amount>,
}
