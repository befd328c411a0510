//! Jurisdiction-specific transaction flags (Nigeria) and derived tax treatment.
//!
//! Detection is pure keyword/pattern matching over the narration. Tax
//! implications are derived from the flags plus the resolved category and
//! direction; nothing here learns, calls out, or mutates.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::transaction::{Amount, Direction};

/// Statutory flat amount of both the EMTL and the stamp duty line (₦50.00).
pub const FLAT_LEVY_AMOUNT: Amount = Amount::from_major(50);

static POS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bpos\b").unwrap());

static USSD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bussd\b|\*\d{3,4}[*#]").unwrap());

static MOBILE_MONEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(opay|palmpay|palm\s+pay|moniepoint|paga|carbon|fairmoney|momo|mtn\s+momo|9\s?psb|smartcash)\b",
    )
    .unwrap()
});

static BANK_CHARGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(sms\s+(alert|charges?|notification)|(account|acct|card)\s+maint(enance)?|maint(enance)?\s+fee|com(mission)?\s+on\s+turnover|cot|(nip|trf|transfer|atm|withdrawal)\s+(fee|charges?|commission)|(bank|acct|account|card|cheque|chq|token)\s+charges?)\b",
    )
    .unwrap()
});

static FOREIGN_CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(usd|gbp|eur|cad|aud|zar|cny|ghs|kes|fx|forex|dom|domiciliary)\b|[$£€]",
    )
    .unwrap()
});

static EMTL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(emtl|electronic\s+money\s+transfer\s+levy|e-?levy)\b").unwrap()
});

static STAMP_DUTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\bstamp\s+duty\b|\bs/duty\b|\bsduty\b)").unwrap());

static LEVY_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blevy\b").unwrap());

static DUTY_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bduty\b").unwrap());

/// Boolean markers detected from a narration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub is_pos_transaction: bool,
    pub is_ussd_transaction: bool,
    pub is_mobile_money: bool,
    pub is_bank_charge: bool,
    pub is_foreign_currency: bool,
    /// Electronic Money Transfer Levy.
    pub is_emtl: bool,
    pub is_stamp_duty: bool,
}

impl Flags {
    /// Names of the flags that are set, in declaration order.
    pub fn active(&self) -> Vec<&'static str> {
        [
            (self.is_pos_transaction, "pos"),
            (self.is_ussd_transaction, "ussd"),
            (self.is_mobile_money, "mobile_money"),
            (self.is_bank_charge, "bank_charge"),
            (self.is_foreign_currency, "foreign_currency"),
            (self.is_emtl, "emtl"),
            (self.is_stamp_duty, "stamp_duty"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }

    /// Statutory charge lines that sit outside the VAT net.
    pub fn is_statutory_charge(&self) -> bool {
        self.is_bank_charge || self.is_emtl || self.is_stamp_duty
    }
}

/// Tax treatment derived from flags, category and direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxImplications {
    pub vat_applicable: bool,
    pub withholding_applicable: bool,
    pub levy_charged: bool,
    pub stamp_duty_charged: bool,
    pub deductible: bool,
}

impl TaxImplications {
    pub fn derive(category: Category, direction: Direction, flags: &Flags) -> Self {
        let debit = direction == Direction::Debit;
        Self {
            vat_applicable: !category.is_vat_exempt() && !flags.is_statutory_charge(),
            withholding_applicable: debit
                && category.attracts_withholding()
                && !flags.is_bank_charge,
            levy_charged: flags.is_emtl,
            stamp_duty_charged: flags.is_stamp_duty,
            deductible: debit && category.is_business_expense(),
        }
    }
}

/// Detect every flag present in `narration`.
///
/// `amount` disambiguates bare "LEVY"/"DUTY" lines, which banks post at the
/// statutory flat amount.
pub fn detect_flags(narration: &str, amount: Amount) -> Flags {
    let flat = amount == FLAT_LEVY_AMOUNT;
    Flags {
        is_pos_transaction: POS.is_match(narration),
        is_ussd_transaction: USSD.is_match(narration),
        is_mobile_money: MOBILE_MONEY.is_match(narration),
        is_bank_charge: BANK_CHARGE.is_match(narration),
        is_foreign_currency: FOREIGN_CURRENCY.is_match(narration),
        is_emtl: EMTL.is_match(narration) || (flat && LEVY_WORD.is_match(narration)),
        is_stamp_duty: STAMP_DUTY.is_match(narration)
            || (flat && DUTY_WORD.is_match(narration)),
    }
}
