//! DuckDB store for the pattern store, feedback ledger, and model registry.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use duckdb::{Connection, Params};
use taxlens_core::{Category, NarrationKey, Pattern, StoreConfig};
use tracing::{debug, info, warn};

use crate::StoreError;
use crate::rows::{decode, get_i64, get_string, get_timestamp, required};

/// Write attempts before a conflict is surfaced to the caller.
const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

const SCHEMA: &str = "
CREATE SEQUENCE IF NOT EXISTS feedback_id_seq START 1;
CREATE SEQUENCE IF NOT EXISTS model_id_seq START 1;

CREATE TABLE IF NOT EXISTS patterns (
    scope_id            VARCHAR   NOT NULL,
    fragment            VARCHAR   NOT NULL,
    category            VARCHAR   NOT NULL,
    occurrence_count    BIGINT    NOT NULL,
    correct_predictions BIGINT    NOT NULL,
    created_at          TIMESTAMP NOT NULL,
    last_used_at        TIMESTAMP NOT NULL,
    PRIMARY KEY (scope_id, fragment)
);

CREATE TABLE IF NOT EXISTS feedback (
    id                   BIGINT    PRIMARY KEY DEFAULT nextval('feedback_id_seq'),
    idempotency_key      VARCHAR   NOT NULL UNIQUE,
    scope_id             VARCHAR   NOT NULL,
    description          VARCHAR   NOT NULL,
    predicted_category   VARCHAR   NOT NULL,
    predicted_confidence DOUBLE    NOT NULL,
    predicted_tier       VARCHAR   NOT NULL,
    corrected_category   VARCHAR   NOT NULL,
    correction_type      VARCHAR   NOT NULL,
    used_in_training     BOOLEAN   NOT NULL DEFAULT false,
    training_batch_id    BIGINT,
    created_at           TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS models (
    id                  BIGINT    PRIMARY KEY,
    name                VARCHAR   NOT NULL,
    version             VARCHAR   NOT NULL UNIQUE,
    status              VARCHAR   NOT NULL,
    is_active           BOOLEAN   NOT NULL,
    accuracy            DOUBLE    NOT NULL,
    precision_score     DOUBLE    NOT NULL,
    recall_score        DOUBLE    NOT NULL,
    f1_score            DOUBLE    NOT NULL,
    training_data_count BIGINT    NOT NULL,
    rules               VARCHAR   NOT NULL,
    trained_at          TIMESTAMP NOT NULL,
    deployed_at         TIMESTAMP
);
";

pub(crate) const PATTERN_COLUMNS: &str = "scope_id, fragment, category, occurrence_count, \
     correct_predictions, epoch_ms(created_at) AS created_ms, \
     epoch_ms(last_used_at) AS last_used_ms";

/// DuckDB store shared by the classifier, the feedback path, and training.
///
/// Three tables:
/// - `patterns`: scope-private fragment → category mappings, keyed by
///   `(scope_id, fragment)`.
/// - `feedback`: the append-only correction ledger, deduplicated on
///   `idempotency_key`.
/// - `models`: trained rule sets; at most one row has `is_active`.
///
/// Every multi-row write runs in one DuckDB transaction. The connection sits
/// behind a mutex so the store can be shared across tasks.
pub struct DuckStore {
    conn: Mutex<Connection>,
}

impl DuckStore {
    /// Open an in-memory database with the schema applied.
    pub fn open() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open or create a persistent database at the given path.
    ///
    /// Tables created by an earlier run are reused as-is.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.migrate()?;
        info!(path = %path.display(), "opened persistent store");
        Ok(store)
    }

    /// Persistent when the config names a path, in-memory otherwise.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        match &config.path {
            Some(path) => Self::open_persistent(path),
            None => Self::open(),
        }
    }

    /// Create sequences and tables that do not exist yet.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(SCHEMA)?;
        debug!("schema ready");
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run a write, retrying with backoff while DuckDB reports a conflict.
    pub(crate) fn with_retry<T>(
        &self,
        op: &str,
        mut f: impl FnMut(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            let result = {
                let mut conn = self.lock()?;
                f(&mut conn)
            };
            match result {
                Err(e) if e.is_conflict() => {
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        return Err(StoreError::Conflict(format!(
                            "{op} failed after {attempt} attempts: {e}"
                        )));
                    }
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "write conflict, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ── Patterns ──

    /// Patterns in `scope_id` whose fragment occurs in the narration.
    ///
    /// Filters on the normalised and the noise-free form, the same two forms
    /// [`NarrationKey::matches`] checks.
    pub fn scope_patterns_matching(
        &self,
        scope_id: &str,
        key: &NarrationKey,
    ) -> Result<Vec<Pattern>, StoreError> {
        let sql = format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns \
             WHERE scope_id = ? AND (contains(?, fragment) OR contains(?, fragment))"
        );
        let conn = self.lock()?;
        let patterns = load_patterns(
            &conn,
            &sql,
            [scope_id, key.normalized(), key.significant()],
        )?;
        Ok(patterns
            .into_iter()
            .filter(|p| key.matches(&p.fragment))
            .collect())
    }

    /// One pattern by its natural key.
    pub fn pattern(&self, scope_id: &str, fragment: &str) -> Result<Option<Pattern>, StoreError> {
        let conn = self.lock()?;
        find_pattern(&conn, scope_id, fragment)
    }

    /// All patterns, optionally limited to one scope, most used first.
    pub fn list_patterns(&self, scope_id: Option<&str>) -> Result<Vec<Pattern>, StoreError> {
        let conn = self.lock()?;
        match scope_id {
            Some(scope) => load_patterns(
                &conn,
                &format!(
                    "SELECT {PATTERN_COLUMNS} FROM patterns WHERE scope_id = ? \
                     ORDER BY occurrence_count DESC, fragment"
                ),
                [scope],
            ),
            None => load_patterns(
                &conn,
                &format!(
                    "SELECT {PATTERN_COLUMNS} FROM patterns \
                     ORDER BY scope_id, occurrence_count DESC, fragment"
                ),
                [],
            ),
        }
    }

    pub fn pattern_count(&self) -> Result<usize, StoreError> {
        self.count("SELECT count(*)::BIGINT FROM patterns")
    }

    // ── Counts ──

    pub(crate) fn count(&self, sql: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    // ── Escape hatch ──

    /// Execute arbitrary read-only SQL and return Arrow RecordBatches.
    pub fn query_arrow(&self, sql: &str) -> Result<Vec<RecordBatch>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
        Ok(batches)
    }
}

pub(crate) fn find_pattern(
    conn: &Connection,
    scope_id: &str,
    fragment: &str,
) -> Result<Option<Pattern>, StoreError> {
    let sql = format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE scope_id = ? AND fragment = ?");
    Ok(load_patterns(conn, &sql, [scope_id, fragment])?.into_iter().next())
}

fn load_patterns<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Pattern>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let batches: Vec<RecordBatch> = stmt.query_arrow(params)?.collect();
    let mut out = Vec::new();
    for batch in &batches {
        for row in 0..batch.num_rows() {
            out.push(pattern_from_row(batch, row)?);
        }
    }
    Ok(out)
}

fn pattern_from_row(batch: &RecordBatch, row: usize) -> Result<Pattern, StoreError> {
    Ok(Pattern {
        scope_id: required(get_string(batch, "scope_id", row)?, "scope_id")?,
        fragment: required(get_string(batch, "fragment", row)?, "fragment")?,
        category: parse_category(batch, "category", row)?,
        occurrence_count: required(get_i64(batch, "occurrence_count", row)?, "occurrence_count")?,
        correct_predictions: required(
            get_i64(batch, "correct_predictions", row)?,
            "correct_predictions",
        )?,
        created_at: required(get_timestamp(batch, "created_ms", row)?, "created_ms")?,
        last_used_at: required(get_timestamp(batch, "last_used_ms", row)?, "last_used_ms")?,
    })
}

pub(crate) fn parse_category(
    batch: &RecordBatch,
    name: &str,
    row: usize,
) -> Result<Category, StoreError> {
    let raw = required(get_string(batch, name, row)?, name)?;
    raw.parse::<Category>()
        .map_err(|e| decode(name, &e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxlens_core::{Correction, CorrectionType, Prediction, Tier};

    fn confirm(scope: &str, narration: &str, category: Category) -> Correction {
        Correction {
            scope_id: scope.into(),
            description: narration.into(),
            predicted: Prediction {
                category,
                confidence: 0.5,
                tier: Tier::Fallback,
            },
            corrected: category,
            correction_type: CorrectionType::Confirmation,
            reference: None,
        }
    }

    #[test]
    fn open_in_memory_has_empty_tables() {
        let store = DuckStore::open().unwrap();
        assert_eq!(store.pattern_count().unwrap(), 0);
        assert_eq!(store.feedback_count().unwrap(), 0);
        assert_eq!(store.active_model_count().unwrap(), 0);
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = DuckStore::open().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
        let batches = store.query_arrow("SELECT 1 AS x").unwrap();
        assert_eq!(batches[0].num_rows(), 1);
    }

    #[test]
    fn matching_filters_by_scope_and_fragment() {
        let store = DuckStore::open().unwrap();
        store
            .record_correction(&confirm("a", "POS PURCHASE SHOPRITE LEKKI", Category::Supplies), 2)
            .unwrap();
        store
            .record_correction(&confirm("b", "POS PURCHASE SHOPRITE LEKKI", Category::Food), 2)
            .unwrap();
        store
            .record_correction(&confirm("a", "DSTV SUBSCRIPTION", Category::Utilities), 2)
            .unwrap();

        let key = NarrationKey::new("POS/WEB PURCHASE @ SHOPRITE LEKKI 0042");
        let hits = store.scope_patterns_matching("a", &key).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, Category::Supplies);
        assert_eq!(hits[0].fragment, "shoprite lekki");

        let none = store
            .scope_patterns_matching("c", &key)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn list_patterns_by_scope() {
        let store = DuckStore::open().unwrap();
        store
            .record_correction(&confirm("a", "DSTV SUBSCRIPTION", Category::Utilities), 2)
            .unwrap();
        store
            .record_correction(&confirm("b", "UBER TRIP LAGOS", Category::Transport), 2)
            .unwrap();
        assert_eq!(store.list_patterns(None).unwrap().len(), 2);
        let scoped = store.list_patterns(Some("b")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].fragment, "uber trip");
    }

    // ── Persistent storage tests ──

    #[test]
    fn open_persistent_creates_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("taxlens.duckdb");
        assert!(!db_path.exists());

        let store = DuckStore::open_persistent(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(store.pattern_count().unwrap(), 0);
    }

    #[test]
    fn persistent_reopen_keeps_learning() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("taxlens.duckdb");

        let store = DuckStore::open_persistent(&db_path).unwrap();
        store
            .record_correction(&confirm("a", "DSTV SUBSCRIPTION", Category::Utilities), 2)
            .unwrap();
        drop(store);

        let store = DuckStore::from_config(&StoreConfig {
            path: Some(db_path.clone()),
        })
        .unwrap();
        let p = store.pattern("a", "dstv subscription").unwrap().unwrap();
        assert_eq!(p.category, Category::Utilities);
        assert_eq!(store.feedback_count().unwrap(), 1);
    }
}
