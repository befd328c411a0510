//! Tiered classifier: learned pattern → active model rule → AI → keyword
//! fallback, short-circuiting on the first tier that clears its floor.
//!
//! Classification never writes. Store read failures and AI failures are
//! logged and treated as a miss, so any valid transaction gets exactly one
//! result.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use taxlens_core::model::{select_pattern, select_rule};
use taxlens_core::{
    BusinessContext, Category, ClassificationResult, ClassifierConfig, NarrationKey,
    ReviewConfig, ReviewInput, ReviewPolicy, Rule, TaxImplications, Tier, Transaction,
    TransactionError, detect_flags,
};
use taxlens_store::{DuckStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fallback::fallback_match;
use crate::oracle::{AiRequest, CategoryOracle, OracleError};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),
}

/// A tier's answer before flags and review are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct TierMatch {
    pub category: Category,
    pub confidence: f64,
    pub reason: String,
}

/// What one tier produced for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TierOutcome {
    Matched(TierMatch),
    /// Nothing at or above the tier's floor.
    NoMatch,
    /// The tier could not answer this time; the next tier is tried.
    TransientError(String),
}

struct CachedRules {
    model_id: i64,
    rules: Arc<Vec<Rule>>,
}

/// Classifies transactions against a shared [`DuckStore`] and an optional
/// external oracle.
pub struct TieredClassifier {
    store: Arc<DuckStore>,
    oracle: Option<Arc<dyn CategoryOracle>>,
    config: ClassifierConfig,
    policy: ReviewPolicy,
    rules: RwLock<Option<CachedRules>>,
}

impl TieredClassifier {
    pub fn new(store: Arc<DuckStore>, config: ClassifierConfig, review: ReviewConfig) -> Self {
        Self {
            store,
            oracle: None,
            config,
            policy: ReviewPolicy::new(review),
            rules: RwLock::new(None),
        }
    }

    /// Enable the AI tier.
    pub fn with_oracle(mut self, oracle: Arc<dyn CategoryOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Classify one transaction.
    ///
    /// The only error is a malformed transaction; everything past validation
    /// degrades to a lower tier instead of failing.
    pub async fn classify(
        &self,
        tx: &Transaction,
        context: Option<&BusinessContext>,
    ) -> Result<ClassificationResult, ClassifyError> {
        tx.validate()?;
        let key = NarrationKey::new(&tx.narration);
        let (tier, matched) = self.resolve(tx, &key, context).await;

        let flags = detect_flags(&tx.narration, tx.amount);
        let implications = TaxImplications::derive(matched.category, tx.direction, &flags);
        let review = self.policy.evaluate(&ReviewInput {
            category: matched.category,
            confidence: matched.confidence,
            tier,
            amount: tx.amount,
            narration: &tx.narration,
            typical_amount: context.and_then(|c| c.typical_amount),
        });

        debug!(
            tier = %tier,
            category = %matched.category,
            confidence = matched.confidence,
            action = review.action.as_str(),
            "classified"
        );
        Ok(ClassificationResult::new(
            matched.category,
            matched.confidence,
            tier,
            matched.reason,
            flags,
            implications,
            review,
        ))
    }

    /// Classify many transactions concurrently, results in input order.
    pub async fn classify_batch(
        &self,
        txs: &[Transaction],
        context: Option<&BusinessContext>,
    ) -> Vec<Result<ClassificationResult, ClassifyError>> {
        futures::stream::iter(txs.iter().map(|tx| self.classify(tx, context)))
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await
    }

    async fn resolve(
        &self,
        tx: &Transaction,
        key: &NarrationKey,
        context: Option<&BusinessContext>,
    ) -> (Tier, TierMatch) {
        if let Some(m) = settle(Tier::Pattern, self.pattern_tier(tx, key)) {
            return (Tier::Pattern, m);
        }
        if let Some(m) = settle(Tier::Model, self.model_tier(key)) {
            return (Tier::Model, m);
        }
        if let Some(m) = settle(Tier::Ai, self.ai_tier(tx, context).await) {
            return (Tier::Ai, m);
        }
        (Tier::Fallback, fallback_match(key))
    }

    /// Tier 1: the scope's learned patterns.
    pub fn pattern_tier(&self, tx: &Transaction, key: &NarrationKey) -> TierOutcome {
        let Some(scope) = tx.scope_id.as_deref().filter(|s| !s.trim().is_empty()) else {
            return TierOutcome::NoMatch;
        };
        let patterns = match self.store.scope_patterns_matching(scope, key) {
            Ok(p) => p,
            Err(e) => return TierOutcome::TransientError(format!("pattern lookup failed: {e}")),
        };
        match select_pattern(&patterns, key) {
            Some(p) if p.confidence() >= self.config.pattern_floor => {
                TierOutcome::Matched(TierMatch {
                    category: p.category,
                    confidence: p.confidence(),
                    reason: format!(
                        "learned pattern '{}' ({}/{} confirmed)",
                        p.fragment, p.correct_predictions, p.occurrence_count
                    ),
                })
            }
            _ => TierOutcome::NoMatch,
        }
    }

    /// Tier 2: rules of the active global model.
    pub fn model_tier(&self, key: &NarrationKey) -> TierOutcome {
        let rules = match self.active_rules() {
            Ok(Some(rules)) => rules,
            Ok(None) => return TierOutcome::NoMatch,
            Err(e) => return TierOutcome::TransientError(format!("model lookup failed: {e}")),
        };
        match select_rule(&rules, key) {
            Some(r) if r.confidence >= self.config.model_floor => {
                TierOutcome::Matched(TierMatch {
                    category: r.category,
                    confidence: r.confidence,
                    reason: format!("model rule '{}'", r.pattern),
                })
            }
            _ => TierOutcome::NoMatch,
        }
    }

    /// Tier 3: the external oracle, bounded by the configured timeout.
    pub async fn ai_tier(
        &self,
        tx: &Transaction,
        context: Option<&BusinessContext>,
    ) -> TierOutcome {
        let Some(oracle) = &self.oracle else {
            return TierOutcome::NoMatch;
        };
        let request = AiRequest {
            narration: tx.narration.clone(),
            amount: tx.amount,
            direction: tx.direction,
            context: context.cloned(),
        };
        let limit = Duration::from_millis(self.config.ai_timeout_ms);

        let suggestion = tokio::time::timeout(limit, oracle.suggest(&request))
            .await
            .unwrap_or(Err(OracleError::Timeout(limit)));
        match suggestion {
            Err(e) => TierOutcome::TransientError(e.to_string()),
            Ok(s) if s.confidence >= self.config.ai_floor => {
                let reason = if s.reasoning.is_empty() {
                    "AI suggestion".to_string()
                } else {
                    s.reasoning
                };
                TierOutcome::Matched(TierMatch {
                    category: s.category,
                    confidence: s.confidence,
                    reason,
                })
            }
            Ok(s) => {
                debug!(
                    category = %s.category,
                    confidence = s.confidence,
                    "AI suggestion below floor"
                );
                TierOutcome::NoMatch
            }
        }
    }

    /// Rules of the active model, reloaded only when the active id changes.
    fn active_rules(&self) -> Result<Option<Arc<Vec<Rule>>>, StoreError> {
        let Some(active_id) = self.store.active_model_id()? else {
            return Ok(None);
        };
        if let Ok(guard) = self.rules.read()
            && let Some(cached) = guard.as_ref()
            && cached.model_id == active_id
        {
            return Ok(Some(Arc::clone(&cached.rules)));
        }

        let Some(model) = self.store.active_model()? else {
            return Ok(None);
        };
        let rules = Arc::new(model.rules);
        if let Ok(mut guard) = self.rules.write() {
            *guard = Some(CachedRules {
                model_id: model.id,
                rules: Arc::clone(&rules),
            });
        }
        debug!(model_id = model.id, rules = rules.len(), "loaded active model rules");
        Ok(Some(rules))
    }
}

fn settle(tier: Tier, outcome: TierOutcome) -> Option<TierMatch> {
    match outcome {
        TierOutcome::Matched(m) => Some(m),
        TierOutcome::NoMatch => None,
        TierOutcome::TransientError(e) => {
            warn!(tier = %tier, error = %e, "tier failed, falling through");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use taxlens_core::{
        Amount, Correction, CorrectionType, Direction, ModelMetrics, NewModel, Prediction,
        ReviewAction,
    };

    use crate::fallback::FALLBACK_CONFIDENCE;
    use crate::oracle::AiSuggestion;

    struct FixedOracle {
        category: Category,
        confidence: f64,
        calls: AtomicUsize,
    }

    impl FixedOracle {
        fn new(category: Category, confidence: f64) -> Self {
            Self {
                category,
                confidence,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CategoryOracle for FixedOracle {
        async fn suggest(&self, _request: &AiRequest) -> Result<AiSuggestion, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AiSuggestion {
                category: self.category,
                confidence: self.confidence,
                reasoning: "looks like it".into(),
            })
        }
    }

    struct FailingOracle;

    #[async_trait]
    impl CategoryOracle for FailingOracle {
        async fn suggest(&self, _request: &AiRequest) -> Result<AiSuggestion, OracleError> {
            Err(OracleError::Status {
                status: 429,
                body: "quota exceeded".into(),
            })
        }
    }

    struct SlowOracle;

    #[async_trait]
    impl CategoryOracle for SlowOracle {
        async fn suggest(&self, _request: &AiRequest) -> Result<AiSuggestion, OracleError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(AiSuggestion {
                category: Category::Capital,
                confidence: 0.99,
                reasoning: String::new(),
            })
        }
    }

    fn classifier(store: &Arc<DuckStore>) -> TieredClassifier {
        TieredClassifier::new(
            Arc::clone(store),
            ClassifierConfig::default(),
            ReviewConfig::default(),
        )
    }

    fn tx(narration: &str, major: i64) -> Transaction {
        Transaction::new(
            narration,
            Amount::from_major(major),
            Direction::Debit,
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
        )
    }

    fn override_to(store: &DuckStore, scope: &str, narration: &str, category: Category) {
        store
            .record_correction(
                &Correction {
                    scope_id: scope.into(),
                    description: narration.into(),
                    predicted: Prediction {
                        category: Category::Other,
                        confidence: FALLBACK_CONFIDENCE,
                        tier: Tier::Fallback,
                    },
                    corrected: category,
                    correction_type: CorrectionType::FullOverride,
                    reference: None,
                },
                2,
            )
            .unwrap();
    }

    fn deploy_rules(store: &DuckStore, rules: Vec<Rule>) -> i64 {
        store
            .deploy_model(
                &NewModel {
                    name: "test".into(),
                    metrics: ModelMetrics::default(),
                    training_data_count: 0,
                    rules,
                    trained_at: Utc::now(),
                },
                &[],
            )
            .unwrap()
            .id
    }

    fn rule(pattern: &str, category: Category, confidence: f64) -> Rule {
        Rule {
            pattern: pattern.into(),
            category,
            confidence,
        }
    }

    #[tokio::test]
    async fn pos_purchase_resolves_through_fallback() {
        let store = Arc::new(DuckStore::open().unwrap());
        let result = classifier(&store)
            .classify(&tx("POS PURCHASE AT SHOPRITE LAGOS", 15_000), None)
            .await
            .unwrap();

        assert_eq!(result.category, Category::Supplies);
        assert_eq!(result.tier, Tier::Fallback);
        assert_eq!(result.confidence, FALLBACK_CONFIDENCE);
        assert!(result.flags.is_pos_transaction);
        assert!(result.tax_implications.vat_applicable);
        assert!(result.needs_confirmation);
    }

    #[tokio::test]
    async fn emtl_line_is_a_levy_without_vat() {
        let store = Arc::new(DuckStore::open().unwrap());
        let result = classifier(&store)
            .classify(&tx("EMTL CHARGE", 50), None)
            .await
            .unwrap();

        assert!(result.flags.is_emtl);
        assert!(result.tax_implications.levy_charged);
        assert!(!result.tax_implications.vat_applicable);
        assert_eq!(result.category, Category::Financial);
    }

    #[tokio::test]
    async fn learned_pattern_wins_over_every_other_tier() {
        let store = Arc::new(DuckStore::open().unwrap());
        override_to(&store, "biz-1", "ADEBAYO STORES OJOTA", Category::Materials);
        deploy_rules(&store, vec![rule("adebayo stores", Category::Food, 0.95)]);
        let oracle = Arc::new(FixedOracle::new(Category::Capital, 0.99));
        let c = classifier(&store).with_oracle(oracle.clone());

        let result = c
            .classify(&tx("NIP TRF ADEBAYO STORES OJOTA 0099", 80_000).with_scope("biz-1"), None)
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Pattern);
        assert_eq!(result.category, Category::Materials);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn override_round_trips_to_one_of_one() {
        let store = Arc::new(DuckStore::open().unwrap());
        let narration = "KINGS BAKERY SURULERE";
        let c = classifier(&store);

        let before = c
            .classify(&tx(narration, 4_000).with_scope("biz-9"), None)
            .await
            .unwrap();
        assert_eq!(before.tier, Tier::Fallback);

        override_to(&store, "biz-9", narration, Category::Food);
        let after = c
            .classify(&tx(narration, 4_000).with_scope("biz-9"), None)
            .await
            .unwrap();
        assert_eq!(after.tier, Tier::Pattern);
        assert_eq!(after.category, Category::Food);
        assert_eq!(after.confidence, 1.0);
        assert!(after.reason.contains("1/1"));
    }

    #[tokio::test]
    async fn patterns_are_private_to_their_scope() {
        let store = Arc::new(DuckStore::open().unwrap());
        override_to(&store, "biz-1", "KINGS BAKERY SURULERE", Category::Food);

        let result = classifier(&store)
            .classify(&tx("KINGS BAKERY SURULERE", 4_000).with_scope("biz-2"), None)
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Fallback);

        let unscoped = classifier(&store)
            .classify(&tx("KINGS BAKERY SURULERE", 4_000), None)
            .await
            .unwrap();
        assert_eq!(unscoped.tier, Tier::Fallback);
    }

    #[tokio::test]
    async fn model_rule_resolves_and_respects_floor() {
        let store = Arc::new(DuckStore::open().unwrap());
        deploy_rules(
            &store,
            vec![
                rule("dangote cement", Category::Materials, 0.9),
                rule("zenith vendor", Category::Supplies, 0.4),
            ],
        );
        let c = classifier(&store);

        let hit = c
            .classify(&tx("DANGOTE CEMENT DEPOT", 300_000), None)
            .await
            .unwrap();
        assert_eq!(hit.tier, Tier::Model);
        assert_eq!(hit.category, Category::Materials);
        assert_eq!(hit.confidence, 0.9);
        assert_eq!(hit.action, ReviewAction::AutoInclude);

        let below_floor = c
            .classify(&tx("ZENITH VENDOR PAYOUT", 10_000), None)
            .await
            .unwrap();
        assert_eq!(below_floor.tier, Tier::Fallback);
    }

    #[tokio::test]
    async fn new_deploy_is_picked_up() {
        let store = Arc::new(DuckStore::open().unwrap());
        let c = classifier(&store);
        deploy_rules(&store, vec![rule("acme", Category::Equipment, 0.9)]);
        let first = c.classify(&tx("ACME LTD", 1_000), None).await.unwrap();
        assert_eq!(first.category, Category::Equipment);

        deploy_rules(&store, vec![rule("acme", Category::Services, 0.9)]);
        let second = c.classify(&tx("ACME LTD", 1_000), None).await.unwrap();
        assert_eq!(second.category, Category::Services);
    }

    #[tokio::test]
    async fn ai_tier_answers_when_nothing_learned() {
        let store = Arc::new(DuckStore::open().unwrap());
        let c = classifier(&store).with_oracle(Arc::new(FixedOracle::new(Category::Services, 0.9)));
        let result = c
            .classify(&tx("OKONKWO AND PARTNERS", 120_500), None)
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Ai);
        assert_eq!(result.category, Category::Services);
        assert_eq!(result.reason, "looks like it");
        assert_eq!(result.action, ReviewAction::AutoInclude);
    }

    #[tokio::test]
    async fn ai_on_vague_narration_needs_confirmation() {
        let store = Arc::new(DuckStore::open().unwrap());
        let c = classifier(&store).with_oracle(Arc::new(FixedOracle::new(Category::Supplies, 0.95)));
        let result = c
            .classify(&tx("MISC SETTLEMENT", 7_500), None)
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Ai);
        assert!(result.needs_confirmation);
    }

    #[tokio::test]
    async fn ai_below_floor_falls_through() {
        let store = Arc::new(DuckStore::open().unwrap());
        let c = classifier(&store).with_oracle(Arc::new(FixedOracle::new(Category::Services, 0.3)));
        let result = c
            .classify(&tx("DSTV SUBSCRIPTION", 9_000), None)
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Fallback);
        assert_eq!(result.category, Category::Utilities);
    }

    #[tokio::test]
    async fn ai_failure_falls_through_to_fallback() {
        let store = Arc::new(DuckStore::open().unwrap());
        let c = classifier(&store).with_oracle(Arc::new(FailingOracle));
        let result = c
            .classify(&tx("DSTV SUBSCRIPTION", 9_000), None)
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Fallback);
        assert_eq!(result.category, Category::Utilities);
    }

    #[tokio::test]
    async fn ai_timeout_falls_through_to_fallback() {
        let store = Arc::new(DuckStore::open().unwrap());
        let config = ClassifierConfig {
            ai_timeout_ms: 20,
            ..Default::default()
        };
        let c = TieredClassifier::new(Arc::clone(&store), config, ReviewConfig::default())
            .with_oracle(Arc::new(SlowOracle));

        let outcome = c.ai_tier(&tx("UNKNOWN VENDOR", 1_000), None).await;
        assert!(matches!(outcome, TierOutcome::TransientError(e) if e.contains("timed out")));

        let result = c.classify(&tx("UNKNOWN VENDOR", 1_000), None).await.unwrap();
        assert_eq!(result.tier, Tier::Fallback);
        assert_eq!(result.category, Category::Other);
    }

    #[tokio::test]
    async fn exclusion_category_is_auto_excluded() {
        let store = Arc::new(DuckStore::open().unwrap());
        let result = classifier(&store)
            .classify(&tx("REVERSAL OF FAILED TRF", 5_000), None)
            .await
            .unwrap();
        assert_eq!(result.category, Category::Refund);
        assert_eq!(result.action, ReviewAction::AutoExclude);
        assert!(!result.needs_confirmation);
    }

    #[tokio::test]
    async fn invalid_transaction_is_rejected() {
        let store = Arc::new(DuckStore::open().unwrap());
        let c = classifier(&store);
        assert!(matches!(
            c.classify(&tx("   ", 100), None).await,
            Err(ClassifyError::InvalidTransaction(TransactionError::EmptyNarration))
        ));
        assert!(matches!(
            c.classify(&tx("DSTV", 0), None).await,
            Err(ClassifyError::InvalidTransaction(TransactionError::NonPositiveAmount(_)))
        ));
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let store = Arc::new(DuckStore::open().unwrap());
        let txs = vec![
            tx("DSTV SUBSCRIPTION", 9_000),
            tx("", 1),
            tx("UBER TRIP", 2_500),
            tx("KFC IKEJA", 6_000),
        ];
        let results = classifier(&store).classify_batch(&txs, None).await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().category, Category::Utilities);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().category, Category::Transport);
        assert_eq!(results[3].as_ref().unwrap().category, Category::Food);
    }

    #[tokio::test]
    async fn every_result_has_bounded_confidence() {
        let store = Arc::new(DuckStore::open().unwrap());
        let c = classifier(&store).with_oracle(Arc::new(FailingOracle));
        for narration in ["", "x", "***", "NIP TRF 0023112", "SALARY MARCH"] {
            if let Ok(r) = c.classify(&tx(narration, 10), None).await {
                assert!((0.0..=1.0).contains(&r.confidence));
            }
        }
    }
}
