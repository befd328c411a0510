//! Model registry: trained rule sets and the single-active invariant.

use arrow::record_batch::RecordBatch;
use chrono::Utc;
use duckdb::{Connection, params};
use taxlens_core::{Model, ModelMetrics, ModelStatus, NewModel, Rule};
use tracing::info;

use crate::rows::{decode, get_bool, get_f64, get_i64, get_string, get_timestamp, required};
use crate::{DuckStore, StoreError};

const MODEL_COLUMNS: &str = "id, name, version, status, is_active, accuracy, precision_score, \
     recall_score, f1_score, training_data_count, rules, \
     epoch_ms(trained_at) AS trained_ms, epoch_ms(deployed_at) AS deployed_ms";

impl DuckStore {
    /// The active model, if one has been deployed.
    pub fn active_model(&self) -> Result<Option<Model>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {MODEL_COLUMNS} FROM models WHERE is_active");
        Ok(load_models(&conn, &sql, [])?.into_iter().next())
    }

    /// Id of the active model. Cheap enough to call on every classification.
    pub fn active_model_id(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM models WHERE is_active")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn model(&self, id: i64) -> Result<Option<Model>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?");
        Ok(load_models(&conn, &sql, [id])?.into_iter().next())
    }

    /// Every model ever deployed, newest first.
    pub fn list_models(&self) -> Result<Vec<Model>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {MODEL_COLUMNS} FROM models ORDER BY id DESC");
        load_models(&conn, &sql, [])
    }

    pub fn active_model_count(&self) -> Result<usize, StoreError> {
        self.count("SELECT count(*)::BIGINT FROM models WHERE is_active")
    }

    /// Deploy a candidate as the new active model.
    ///
    /// In one transaction: consume the feedback batch (tagging every record
    /// with the new model id), deactivate the previous model, and insert the
    /// candidate as active. If any record in `feedback_ids` was already used
    /// by another run the whole deploy rolls back with
    /// [`StoreError::BatchConsumed`].
    pub fn deploy_model(
        &self,
        candidate: &NewModel,
        feedback_ids: &[i64],
    ) -> Result<Model, StoreError> {
        let rules_json = serde_json::to_string(&candidate.rules)?;

        let id = self.with_retry("deploy_model", |conn| {
            let tx = conn.transaction()?;
            let id: i64 = tx.query_row("SELECT nextval('model_id_seq')", [], |row| row.get(0))?;

            let marked = mark_feedback_used(&tx, id, feedback_ids)?;
            if marked != feedback_ids.len() {
                return Err(StoreError::BatchConsumed {
                    expected: feedback_ids.len(),
                    marked,
                });
            }

            let version = format!("{}.{id}", candidate.trained_at.format("%Y%m%d.%H%M%S"));
            let now_ms = Utc::now().timestamp_millis();
            tx.execute("UPDATE models SET is_active = false WHERE is_active", [])?;
            tx.execute(
                "INSERT INTO models (id, name, version, status, is_active, accuracy,
                     precision_score, recall_score, f1_score, training_data_count, rules,
                     trained_at, deployed_at)
                 VALUES (?, ?, ?, ?, true, ?, ?, ?, ?, ?, ?,
                     epoch_ms(?::BIGINT), epoch_ms(?::BIGINT))",
                params![
                    id,
                    candidate.name,
                    version,
                    ModelStatus::Deployed.as_str(),
                    candidate.metrics.accuracy,
                    candidate.metrics.precision,
                    candidate.metrics.recall,
                    candidate.metrics.f1,
                    candidate.training_data_count,
                    rules_json,
                    candidate.trained_at.timestamp_millis(),
                    now_ms,
                ],
            )?;
            tx.commit()?;
            Ok(id)
        })?;

        let model = self.model(id)?.ok_or(StoreError::NoResults)?;
        info!(
            model_id = model.id,
            version = %model.version,
            rules = model.rules.len(),
            feedback = feedback_ids.len(),
            accuracy = model.metrics.accuracy,
            "deployed model"
        );
        Ok(model)
    }
}

fn mark_feedback_used(
    conn: &Connection,
    batch_id: i64,
    feedback_ids: &[i64],
) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare(
        "UPDATE feedback SET used_in_training = true, training_batch_id = ?
         WHERE id = ? AND NOT used_in_training",
    )?;
    let mut marked = 0;
    for id in feedback_ids {
        marked += stmt.execute(params![batch_id, id])?;
    }
    Ok(marked)
}

fn load_models<P: duckdb::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Model>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let batches: Vec<RecordBatch> = stmt.query_arrow(params)?.collect();
    let mut out = Vec::new();
    for batch in &batches {
        for row in 0..batch.num_rows() {
            out.push(model_from_row(batch, row)?);
        }
    }
    Ok(out)
}

fn model_from_row(batch: &RecordBatch, row: usize) -> Result<Model, StoreError> {
    let status = required(get_string(batch, "status", row)?, "status")?
        .parse::<ModelStatus>()
        .map_err(|e| decode("status", &e))?;
    let rules_json = required(get_string(batch, "rules", row)?, "rules")?;
    let rules: Vec<Rule> = serde_json::from_str(&rules_json)?;

    Ok(Model {
        id: required(get_i64(batch, "id", row)?, "id")?,
        name: required(get_string(batch, "name", row)?, "name")?,
        version: required(get_string(batch, "version", row)?, "version")?,
        status,
        is_active: required(get_bool(batch, "is_active", row)?, "is_active")?,
        metrics: ModelMetrics {
            accuracy: required(get_f64(batch, "accuracy", row)?, "accuracy")?,
            precision: required(get_f64(batch, "precision_score", row)?, "precision_score")?,
            recall: required(get_f64(batch, "recall_score", row)?, "recall_score")?,
            f1: required(get_f64(batch, "f1_score", row)?, "f1_score")?,
        },
        training_data_count: required(
            get_i64(batch, "training_data_count", row)?,
            "training_data_count",
        )?,
        rules,
        trained_at: required(get_timestamp(batch, "trained_ms", row)?, "trained_ms")?,
        deployed_at: get_timestamp(batch, "deployed_ms", row)?,
    })
}
