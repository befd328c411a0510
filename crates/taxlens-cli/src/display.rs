//! Terminal rendering for CLI output.
//!
//! Single records print as vertical cards grouped into sections; collections
//! print as fixed-width tables. Builders return lines so the layout is
//! testable without capturing stdout.

use taxlens_ai::TrainReport;
use taxlens_core::{ClassificationResult, FeedbackStats, Model, Pattern, Transaction};
use taxlens_store::RecordOutcome;

const LABEL_WIDTH: usize = 22;

// ── Public API ──

pub fn print_classification(tx: &Transaction, result: &ClassificationResult) {
    print_lines(&classification_card(tx, result));
}

pub fn print_record_outcome(outcome: &RecordOutcome) {
    print_lines(&record_outcome_card(outcome));
}

pub fn print_train_report(report: &TrainReport) {
    print_lines(&train_report_card(report));
}

pub fn print_patterns(patterns: &[Pattern]) {
    print_lines(&pattern_table(patterns));
}

pub fn print_models(models: &[Model]) {
    print_lines(&model_table(models));
}

pub fn print_stats(stats: &FeedbackStats, pattern_count: usize, active: Option<&Model>) {
    print_lines(&stats_card(stats, pattern_count, active));
}

// ── Cards ──

fn classification_card(tx: &Transaction, result: &ClassificationResult) -> Vec<String> {
    let mut lines = vec![
        format!("=== {} ===", tx.narration),
        format!("{} {} on {}", tx.direction, tx.amount, tx.date),
        String::new(),
    ];

    section(
        &mut lines,
        "Classification",
        &[
            ("category", result.category.to_string()),
            ("confidence", format!("{:.2}", result.confidence)),
            ("tier", result.tier.to_string()),
            ("reason", result.reason.clone()),
        ],
    );
    section(
        &mut lines,
        "Review",
        &[
            ("action", result.action.as_str().to_string()),
            ("needs_confirmation", yes_no(result.needs_confirmation)),
            ("reason", result.review_reason.clone()),
        ],
    );

    let active = result.flags.active();
    section(
        &mut lines,
        "Flags",
        &[(
            "set",
            if active.is_empty() {
                "none".to_string()
            } else {
                active.join(", ")
            },
        )],
    );

    let tax = &result.tax_implications;
    section(
        &mut lines,
        "Tax Implications",
        &[
            ("vat_applicable", yes_no(tax.vat_applicable)),
            ("withholding_applicable", yes_no(tax.withholding_applicable)),
            ("levy_charged", yes_no(tax.levy_charged)),
            ("stamp_duty_charged", yes_no(tax.stamp_duty_charged)),
            ("deductible", yes_no(tax.deductible)),
        ],
    );
    lines
}

fn record_outcome_card(outcome: &RecordOutcome) -> Vec<String> {
    if outcome.duplicate {
        return vec![format!(
            "Already recorded as feedback #{}; nothing changed.",
            outcome.feedback_id
        )];
    }

    let mut lines = vec![format!("Recorded feedback #{}", outcome.feedback_id)];
    if outcome.changes.is_empty() {
        lines.push("  no pattern changes".to_string());
    }
    for change in &outcome.changes {
        lines.push(format!(
            "  {:<12} {:<36} -> {}",
            change.kind.as_str(),
            change.fragment,
            change.category
        ));
    }
    lines
}

fn train_report_card(report: &TrainReport) -> Vec<String> {
    let mut lines = vec![
        format!("=== training ({}) ===", report.mode),
        String::new(),
    ];

    let mut outcome = vec![
        ("trained", yes_no(report.trained)),
        ("feedback", report.feedback_count.to_string()),
        ("rules", report.rule_count.to_string()),
    ];
    if let Some(id) = report.model_id {
        outcome.push(("model_id", id.to_string()));
    }
    if let Some(reason) = &report.reason {
        outcome.push(("reason", reason.clone()));
    }
    if let Some(detail) = &report.detail {
        outcome.push(("detail", detail.clone()));
    }
    section(&mut lines, "Outcome", &outcome);

    if let Some(m) = &report.metrics {
        section(
            &mut lines,
            "Validation",
            &[
                ("accuracy", format!("{:.3}", m.accuracy)),
                ("precision", format!("{:.3}", m.precision)),
                ("recall", format!("{:.3}", m.recall)),
                ("f1", format!("{:.3}", m.f1)),
            ],
        );
    }
    lines
}

fn stats_card(stats: &FeedbackStats, pattern_count: usize, active: Option<&Model>) -> Vec<String> {
    let mut lines = Vec::new();
    section(
        &mut lines,
        "Feedback",
        &[
            ("total", stats.total.to_string()),
            ("unused", stats.unused.to_string()),
            ("confirmations", stats.confirmations.to_string()),
            ("partial_edits", stats.partial_edits.to_string()),
            ("full_overrides", stats.full_overrides.to_string()),
            (
                "confirmation_rate",
                stats
                    .confirmation_rate()
                    .map(|r| format!("{:.1}%", r * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ],
    );
    section(&mut lines, "Patterns", &[("total", pattern_count.to_string())]);

    match active {
        Some(m) => section(
            &mut lines,
            "Active Model",
            &[
                ("id", m.id.to_string()),
                ("version", m.version.clone()),
                ("accuracy", format!("{:.3}", m.metrics.accuracy)),
                ("rules", m.rules.len().to_string()),
                ("training_data_count", m.training_data_count.to_string()),
            ],
        ),
        None => section(&mut lines, "Active Model", &[("id", "none".to_string())]),
    }
    lines
}

// ── Tables ──

fn pattern_table(patterns: &[Pattern]) -> Vec<String> {
    if patterns.is_empty() {
        return vec!["no patterns".to_string()];
    }
    let mut lines = vec![format!(
        "{:<16} {:<36} {:<12} {:>6} {:>8} {:>6}  {}",
        "scope", "fragment", "category", "seen", "correct", "conf", "last used"
    )];
    for p in patterns {
        lines.push(format!(
            "{:<16} {:<36} {:<12} {:>6} {:>8} {:>6.2}  {}",
            p.scope_id,
            p.fragment,
            p.category.as_str(),
            p.occurrence_count,
            p.correct_predictions,
            p.confidence(),
            p.last_used_at.format("%Y-%m-%d %H:%M")
        ));
    }
    lines
}

fn model_table(models: &[Model]) -> Vec<String> {
    if models.is_empty() {
        return vec!["no models".to_string()];
    }
    let mut lines = vec![format!(
        "{:>4} {:<22} {:<7} {:>8} {:>6} {:>6} {:>8}  {}",
        "id", "version", "active", "accuracy", "f1", "rules", "samples", "deployed"
    )];
    for m in models {
        lines.push(format!(
            "{:>4} {:<22} {:<7} {:>8.3} {:>6.3} {:>6} {:>8}  {}",
            m.id,
            m.version,
            if m.is_active { "*" } else { "" },
            m.metrics.accuracy,
            m.metrics.f1,
            m.rules.len(),
            m.training_data_count,
            m.deployed_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        ));
    }
    lines
}

// ── Helpers ──

fn section(lines: &mut Vec<String>, header: &str, rows: &[(&str, String)]) {
    lines.push(header.to_string());
    for (label, value) in rows {
        lines.push(format!("  {:<width$} {}", label, value, width = LABEL_WIDTH));
    }
    lines.push(String::new());
}

fn yes_no(b: bool) -> String {
    if b { "yes" } else { "no" }.to_string()
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{NaiveDate, TimeZone, Utc};
    use taxlens_ai::TrainMode;
    use taxlens_core::{
        Amount, Category, Direction, Flags, ModelMetrics, ModelStatus, ReviewAction,
        ReviewDecision, TaxImplications, Tier,
    };
    use taxlens_store::{PatternChange, PatternChangeKind};

    fn has_row(lines: &[String], label: &str, value: &str) -> bool {
        lines
            .iter()
            .any(|l| l.trim_start().starts_with(label) && l.trim_end().ends_with(value))
    }

    #[test]
    fn classification_card_groups_sections() {
        let tx = Transaction::new(
            "POS PURCHASE AT SHOPRITE LAGOS",
            Amount::from_major(15_000),
            Direction::Debit,
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
        );
        let result = ClassificationResult::new(
            Category::Supplies,
            0.5,
            Tier::Fallback,
            "keyword 'shoprite'".into(),
            Flags {
                is_pos_transaction: true,
                ..Default::default()
            },
            TaxImplications::default(),
            ReviewDecision {
                action: ReviewAction::AskUser,
                reason: "low confidence 0.50 from fallback tier".into(),
            },
        );

        let lines = classification_card(&tx, &result);
        assert_eq!(lines[0], "=== POS PURCHASE AT SHOPRITE LAGOS ===");
        assert_eq!(lines[1], "debit 15000.00 on 2026-03-14");
        assert!(lines.iter().any(|l| l == "Tax Implications"));
        assert!(has_row(&lines, "category", "supplies"));
        assert!(has_row(&lines, "needs_confirmation", "yes"));
        assert!(has_row(&lines, "set", "pos"));
    }

    #[test]
    fn duplicate_outcome_is_one_line() {
        let lines = record_outcome_card(&RecordOutcome {
            feedback_id: 7,
            duplicate: true,
            changes: Vec::new(),
        });
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("#7"));
    }

    #[test]
    fn outcome_lists_changes() {
        let lines = record_outcome_card(&RecordOutcome {
            feedback_id: 3,
            duplicate: false,
            changes: vec![PatternChange {
                fragment: "uber trip".into(),
                category: Category::Transport,
                kind: PatternChangeKind::Created,
            }],
        });
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("uber trip"));
        assert!(lines[1].ends_with("transport"));
    }

    #[test]
    fn halted_report_shows_reason_without_metrics() {
        let report = TrainReport {
            mode: TrainMode::Immediate,
            trained: false,
            accuracy: None,
            reason: Some("insufficient data".into()),
            detail: Some("40 unused feedback records, 100 required".into()),
            model_id: None,
            feedback_count: 40,
            rule_count: 0,
            metrics: None,
        };
        let lines = train_report_card(&report);
        assert_eq!(lines[0], "=== training (immediate) ===");
        assert!(has_row(&lines, "reason", "insufficient data"));
        assert!(!lines.iter().any(|l| l == "Validation"));
    }

    #[test]
    fn empty_collections_say_so() {
        assert_eq!(pattern_table(&[]), vec!["no patterns".to_string()]);
        assert_eq!(model_table(&[]), vec!["no models".to_string()]);
    }

    #[test]
    fn model_table_marks_active() {
        let at = Utc.with_ymd_and_hms(2026, 10, 1, 9, 30, 0).unwrap();
        let model = Model {
            id: 2,
            name: "narration-rules".into(),
            version: "20261001.093000.2".into(),
            status: ModelStatus::Deployed,
            is_active: true,
            metrics: ModelMetrics {
                accuracy: 0.9,
                ..Default::default()
            },
            training_data_count: 120,
            rules: Vec::new(),
            trained_at: at,
            deployed_at: Some(at),
        };
        let lines = model_table(&[model]);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("20261001.093000.2"));
        assert!(lines[1].contains('*'));
        assert!(lines[1].ends_with("2026-10-01 09:30"));
    }

    #[test]
    fn stats_without_active_model() {
        let lines = stats_card(&FeedbackStats::default(), 0, None);
        assert!(has_row(&lines, "confirmation_rate", "-"));
        assert!(has_row(&lines, "id", "none"));
    }
}
