//! Feedback ledger: records corrections and applies what they teach to the
//! scope's patterns, in one transaction.

use arrow::record_batch::RecordBatch;
use chrono::Utc;
use duckdb::{Connection, params};
use taxlens_core::fragment::{derive_fragment, specific_fragment};
use taxlens_core::{
    Category, Correction, CorrectionType, FeedbackRecord, FeedbackStats, Pattern, Prediction,
};
use tracing::{debug, info};

use crate::duck::{find_pattern, parse_category};
use crate::rows::{decode, get_bool, get_f64, get_i64, get_string, get_timestamp, required};
use crate::{DuckStore, StoreError};

const FEEDBACK_COLUMNS: &str = "id, idempotency_key, scope_id, description, predicted_category, \
     predicted_confidence, predicted_tier, corrected_category, correction_type, \
     used_in_training, training_batch_id, epoch_ms(created_at) AS created_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternChangeKind {
    /// New pattern at 1/1.
    Created,
    /// Seen again and agreed with: both counters incremented.
    Reinforced,
    /// Seen again and disagreed with: only the occurrence count grows.
    Weakened,
    /// Young pattern pointed at a new category and reset to 1/1.
    Retargeted,
}

impl PatternChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Reinforced => "reinforced",
            Self::Weakened => "weakened",
            Self::Retargeted => "retargeted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternChange {
    pub fragment: String,
    /// Category the pattern holds after the change.
    pub category: Category,
    pub kind: PatternChangeKind,
}

/// Result of [`DuckStore::record_correction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub feedback_id: i64,
    /// The event was already recorded; nothing was written.
    pub duplicate: bool,
    pub changes: Vec<PatternChange>,
}

impl DuckStore {
    /// Append a correction to the ledger and update the scope's patterns.
    ///
    /// The feedback row and every pattern write commit together or not at
    /// all. Replaying an event with the same idempotency key returns the
    /// original feedback id with `duplicate = true` and changes nothing.
    pub fn record_correction(
        &self,
        correction: &Correction,
        retarget_limit: i64,
    ) -> Result<RecordOutcome, StoreError> {
        validate_correction(correction)?;
        let key = correction.idempotency_key();

        let outcome = self.with_retry("record_correction", |conn| {
            let tx = conn.transaction()?;

            if let Some(existing) = feedback_id_for_key(&tx, &key)? {
                return Ok(RecordOutcome {
                    feedback_id: existing,
                    duplicate: true,
                    changes: Vec::new(),
                });
            }

            let now_ms = Utc::now().timestamp_millis();
            let feedback_id = insert_feedback(&tx, correction, &key, now_ms)?;

            let changes = if correction.teaches() {
                let changes = plan_for(&tx, correction, retarget_limit)?;
                for change in &changes {
                    apply_change(&tx, &correction.scope_id, change, now_ms)?;
                }
                changes
            } else {
                Vec::new()
            };

            tx.commit()?;
            Ok(RecordOutcome {
                feedback_id,
                duplicate: false,
                changes,
            })
        })?;

        if outcome.duplicate {
            debug!(
                feedback_id = outcome.feedback_id,
                key = %key,
                "correction already recorded"
            );
        } else {
            info!(
                feedback_id = outcome.feedback_id,
                scope = %correction.scope_id,
                correction_type = %correction.correction_type,
                changes = outcome.changes.len(),
                "recorded correction"
            );
        }
        Ok(outcome)
    }

    // ── Reads ──

    /// Feedback not yet consumed by a training run, oldest first.
    pub fn unused_feedback(&self) -> Result<Vec<FeedbackRecord>, StoreError> {
        let conn = self.lock()?;
        load_feedback(
            &conn,
            &format!(
                "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE NOT used_in_training ORDER BY id"
            ),
            [],
        )
    }

    /// Feedback consumed by the training run that produced model `batch_id`.
    pub fn feedback_for_batch(&self, batch_id: i64) -> Result<Vec<FeedbackRecord>, StoreError> {
        let conn = self.lock()?;
        load_feedback(
            &conn,
            &format!("SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE training_batch_id = ? ORDER BY id"),
            [batch_id],
        )
    }

    pub fn feedback_count(&self) -> Result<usize, StoreError> {
        self.count("SELECT count(*)::BIGINT FROM feedback")
    }

    pub fn unused_feedback_count(&self) -> Result<usize, StoreError> {
        self.count("SELECT count(*)::BIGINT FROM feedback WHERE NOT used_in_training")
    }

    pub fn feedback_stats(&self) -> Result<FeedbackStats, StoreError> {
        let conn = self.lock()?;
        let stats = conn.query_row(
            "SELECT
                count(*)::BIGINT,
                CAST(count(*) FILTER (WHERE NOT used_in_training) AS BIGINT),
                CAST(count(*) FILTER (WHERE correction_type = 'confirmation') AS BIGINT),
                CAST(count(*) FILTER (WHERE correction_type = 'partial_edit') AS BIGINT),
                CAST(count(*) FILTER (WHERE correction_type = 'full_override') AS BIGINT)
             FROM feedback",
            [],
            |row| {
                Ok(FeedbackStats {
                    total: row.get::<_, i64>(0)? as usize,
                    unused: row.get::<_, i64>(1)? as usize,
                    confirmations: row.get::<_, i64>(2)? as usize,
                    partial_edits: row.get::<_, i64>(3)? as usize,
                    full_overrides: row.get::<_, i64>(4)? as usize,
                })
            },
        )?;
        Ok(stats)
    }
}

fn validate_correction(c: &Correction) -> Result<(), StoreError> {
    if c.scope_id.trim().is_empty() {
        return Err(StoreError::InvalidCorrection("scope_id is empty".into()));
    }
    if !c.predicted.confidence.is_finite() {
        return Err(StoreError::InvalidCorrection(
            "predicted confidence is not a number".into(),
        ));
    }
    Ok(())
}

fn feedback_id_for_key(conn: &Connection, key: &str) -> Result<Option<i64>, StoreError> {
    let mut stmt = conn.prepare("SELECT id FROM feedback WHERE idempotency_key = ?")?;
    let mut rows = stmt.query([key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn insert_feedback(
    conn: &Connection,
    c: &Correction,
    key: &str,
    now_ms: i64,
) -> Result<i64, StoreError> {
    let id = conn.query_row(
        "INSERT INTO feedback (idempotency_key, scope_id, description, predicted_category,
             predicted_confidence, predicted_tier, corrected_category, correction_type, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, epoch_ms(?::BIGINT))
         RETURNING id",
        params![
            key,
            c.scope_id,
            c.description,
            c.predicted.category.as_str(),
            c.predicted.confidence.clamp(0.0, 1.0),
            c.predicted.tier.as_str(),
            c.corrected.as_str(),
            c.correction_type.as_str(),
            now_ms,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn plan_for(
    conn: &Connection,
    c: &Correction,
    retarget_limit: i64,
) -> Result<Vec<PatternChange>, StoreError> {
    // Nothing to learn under; the feedback row is still written.
    let Some(base_fragment) = derive_fragment(&c.description) else {
        return Ok(Vec::new());
    };
    let specific = specific_fragment(&c.description).filter(|s| *s != base_fragment);

    let base = find_pattern(conn, &c.scope_id, &base_fragment)?;
    let specific_existing = match &specific {
        Some(s) => find_pattern(conn, &c.scope_id, s)?,
        None => None,
    };

    Ok(plan_changes(
        &base_fragment,
        base.as_ref(),
        specific.as_deref(),
        specific_existing.as_ref(),
        c.corrected,
        c.correction_type,
        retarget_limit,
    ))
}

/// Decide which pattern writes a teaching correction produces.
///
/// Only a full override may change a pattern's category. A pattern seen at
/// most `retarget_limit` times is retargeted outright; an established one
/// keeps its category and the override is learned under the longer
/// `specific` fragment instead.
pub(crate) fn plan_changes(
    base_fragment: &str,
    base: Option<&Pattern>,
    specific: Option<&str>,
    specific_existing: Option<&Pattern>,
    target: Category,
    kind: CorrectionType,
    retarget_limit: i64,
) -> Vec<PatternChange> {
    let change = |fragment: &str, category: Category, kind: PatternChangeKind| PatternChange {
        fragment: fragment.to_string(),
        category,
        kind,
    };

    let Some(base) = base else {
        return vec![change(base_fragment, target, PatternChangeKind::Created)];
    };
    if base.category == target {
        return vec![change(base_fragment, target, PatternChangeKind::Reinforced)];
    }
    if kind != CorrectionType::FullOverride {
        return vec![change(base_fragment, base.category, PatternChangeKind::Weakened)];
    }
    if base.occurrence_count <= retarget_limit {
        return vec![change(base_fragment, target, PatternChangeKind::Retargeted)];
    }

    match specific {
        Some(fragment) => {
            let specific_change = match specific_existing {
                None => change(fragment, target, PatternChangeKind::Created),
                Some(p) if p.category == target => {
                    change(fragment, target, PatternChangeKind::Reinforced)
                }
                Some(_) => change(fragment, target, PatternChangeKind::Retargeted),
            };
            vec![
                change(base_fragment, base.category, PatternChangeKind::Weakened),
                specific_change,
            ]
        }
        None => vec![change(base_fragment, target, PatternChangeKind::Retargeted)],
    }
}

fn apply_change(
    conn: &Connection,
    scope_id: &str,
    change: &PatternChange,
    now_ms: i64,
) -> Result<(), StoreError> {
    let fragment = change.fragment.as_str();
    let category = change.category.as_str();
    match change.kind {
        PatternChangeKind::Created => conn.execute(
            "INSERT INTO patterns (scope_id, fragment, category, occurrence_count,
                 correct_predictions, created_at, last_used_at)
             VALUES (?, ?, ?, 1, 1, epoch_ms(?::BIGINT), epoch_ms(?::BIGINT))",
            params![scope_id, fragment, category, now_ms, now_ms],
        )?,
        PatternChangeKind::Reinforced => conn.execute(
            "UPDATE patterns
             SET occurrence_count = occurrence_count + 1,
                 correct_predictions = correct_predictions + 1,
                 last_used_at = epoch_ms(?::BIGINT)
             WHERE scope_id = ? AND fragment = ?",
            params![now_ms, scope_id, fragment],
        )?,
        PatternChangeKind::Weakened => conn.execute(
            "UPDATE patterns
             SET occurrence_count = occurrence_count + 1,
                 last_used_at = epoch_ms(?::BIGINT)
             WHERE scope_id = ? AND fragment = ?",
            params![now_ms, scope_id, fragment],
        )?,
        PatternChangeKind::Retargeted => conn.execute(
            "UPDATE patterns
             SET category = ?, occurrence_count = 1, correct_predictions = 1,
                 last_used_at = epoch_ms(?::BIGINT)
             WHERE scope_id = ? AND fragment = ?",
            params![category, now_ms, scope_id, fragment],
        )?,
    };
    debug!(
        scope = scope_id,
        fragment,
        category,
        change = change.kind.as_str(),
        "pattern updated"
    );
    Ok(())
}

fn load_feedback<P: duckdb::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<FeedbackRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let batches: Vec<RecordBatch> = stmt.query_arrow(params)?.collect();
    let mut out = Vec::new();
    for batch in &batches {
        for row in 0..batch.num_rows() {
            out.push(feedback_from_row(batch, row)?);
        }
    }
    Ok(out)
}

fn feedback_from_row(batch: &RecordBatch, row: usize) -> Result<FeedbackRecord, StoreError> {
    let tier = required(get_string(batch, "predicted_tier", row)?, "predicted_tier")?
        .parse()
        .map_err(|e: String| decode("predicted_tier", &e))?;
    let correction_type = required(get_string(batch, "correction_type", row)?, "correction_type")?
        .parse()
        .map_err(|e: String| decode("correction_type", &e))?;

    Ok(FeedbackRecord {
        id: required(get_i64(batch, "id", row)?, "id")?,
        idempotency_key: required(get_string(batch, "idempotency_key", row)?, "idempotency_key")?,
        scope_id: required(get_string(batch, "scope_id", row)?, "scope_id")?,
        description: required(get_string(batch, "description", row)?, "description")?,
        predicted: Prediction {
            category: parse_category(batch, "predicted_category", row)?,
            confidence: required(
                get_f64(batch, "predicted_confidence", row)?,
                "predicted_confidence",
            )?,
            tier,
        },
        corrected: parse_category(batch, "corrected_category", row)?,
        correction_type,
        used_in_training: required(get_bool(batch, "used_in_training", row)?, "used_in_training")?,
        training_batch_id: get_i64(batch, "training_batch_id", row)?,
        created_at: required(get_timestamp(batch, "created_ms", row)?, "created_ms")?,
    })
}
