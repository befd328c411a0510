//! Offline training: turn unused feedback into a validated global model.
//!
//! # Stages
//!
//! 1. **collecting**: load feedback not yet used by a training run.
//! 2. **gated**: immediate mode needs at least `min_feedback` records.
//! 3. **splitting**: shuffle, hold out `validation_fraction` for validation.
//! 4. **rule synthesis**: majority category per base fragment, plus
//!    advisory rules from an optional [`RuleGenerator`] for fragments the
//!    statistics did not cover. Merged over the previous model's rules.
//! 5. **validation**: replay held-out samples through the candidate rules,
//!    with the keyword fallback on a miss.
//! 6. **decision / deploy**: force always deploys; otherwise accuracy must
//!    reach `accuracy_floor`. Deploy is one store transaction.
//!
//! Dry runs stop after validation and never write.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use taxlens_core::fragment::{derive_fragment, normalize_text};
use taxlens_core::model::{select_rule, sort_rules};
use taxlens_core::{Category, FeedbackRecord, ModelMetrics, NarrationKey, NewModel, Rule, TrainingConfig};
use taxlens_store::{DuckStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

use crate::fallback::fallback_match;
use crate::oracle::{OracleError, RuleGenerator, TrainingSample};

const NO_FEEDBACK: &str = "no unused feedback";
const INSUFFICIENT_DATA: &str = "insufficient data";
const DRY_RUN: &str = "dry run";
const BELOW_FLOOR: &str = "accuracy below threshold";
const BATCH_CONSUMED: &str = "feedback batch already consumed";

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrainMode {
    /// Run every stage up to validation, report, write nothing.
    DryRun,
    /// Train only with enough new feedback; deploy only above the floor.
    Immediate,
    /// Train on whatever is there and deploy regardless of accuracy.
    Force,
}

impl TrainMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Immediate => "immediate",
            Self::Force => "force",
        }
    }
}

impl fmt::Display for TrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "dry-run" | "dryrun" => Ok(Self::DryRun),
            "immediate" => Ok(Self::Immediate),
            "force" => Ok(Self::Force),
            other => Err(format!("unknown training mode: {other}")),
        }
    }
}

/// Outcome of one training invocation. Gating is reported here, not as an
/// error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainReport {
    pub mode: TrainMode,
    pub trained: bool,
    pub accuracy: Option<f64>,
    pub reason: Option<String>,
    pub detail: Option<String>,
    pub model_id: Option<i64>,
    pub feedback_count: usize,
    pub rule_count: usize,
    pub metrics: Option<ModelMetrics>,
}

impl TrainReport {
    fn halted(mode: TrainMode, reason: &str, detail: Option<String>, feedback_count: usize) -> Self {
        Self {
            mode,
            trained: false,
            accuracy: None,
            reason: Some(reason.to_string()),
            detail,
            model_id: None,
            feedback_count,
            rule_count: 0,
            metrics: None,
        }
    }
}

pub struct TrainingPipeline {
    store: Arc<DuckStore>,
    generator: Option<Arc<dyn RuleGenerator>>,
    config: TrainingConfig,
}

impl TrainingPipeline {
    pub fn new(store: Arc<DuckStore>, config: TrainingConfig) -> Self {
        Self {
            store,
            generator: None,
            config,
        }
    }

    /// Enable AI-assisted rule synthesis.
    pub fn with_generator(mut self, generator: Arc<dyn RuleGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub async fn train(&self, mode: TrainMode) -> Result<TrainReport, TrainingError> {
        let cfg = &self.config;

        // collecting
        let feedback = self.store.unused_feedback()?;
        let total = feedback.len();
        info!(mode = %mode, unused = total, "training: collected feedback");
        if total == 0 {
            return Ok(TrainReport::halted(mode, NO_FEEDBACK, None, 0));
        }

        // gated
        if mode == TrainMode::Immediate && total < cfg.min_feedback {
            let detail = format!(
                "{total} unused feedback records, {} required",
                cfg.min_feedback
            );
            info!(unused = total, required = cfg.min_feedback, "training: gated");
            return Ok(TrainReport::halted(mode, INSUFFICIENT_DATA, Some(detail), total));
        }

        // splitting
        let feedback_ids: Vec<i64> = feedback.iter().map(|f| f.id).collect();
        let (train, validation) = split(feedback, cfg.validation_fraction, cfg.seed);
        info!(
            train = train.len(),
            validation = validation.len(),
            "training: split feedback"
        );

        // rule synthesis
        let derived = derive_rules(&train, cfg.min_rule_support);
        let advisory = self.advisory_rules(&train, &derived).await;
        let previous = self
            .store
            .active_model()?
            .map(|m| m.rules)
            .unwrap_or_default();
        info!(
            derived = derived.len(),
            advisory = advisory.len(),
            previous = previous.len(),
            "training: synthesised rules"
        );
        let candidate = merge_rules(previous, derived, advisory);

        // validation
        let holdout = if validation.is_empty() { &train } else { &validation };
        let metrics = evaluate(&candidate, holdout);
        info!(
            accuracy = metrics.accuracy,
            f1 = metrics.f1,
            rules = candidate.len(),
            "training: validated candidate"
        );

        let report = TrainReport {
            mode,
            trained: false,
            accuracy: Some(metrics.accuracy),
            reason: None,
            detail: None,
            model_id: None,
            feedback_count: total,
            rule_count: candidate.len(),
            metrics: Some(metrics),
        };

        // decision
        if mode == TrainMode::DryRun {
            return Ok(TrainReport {
                reason: Some(DRY_RUN.to_string()),
                ..report
            });
        }
        if !should_deploy(mode, metrics.accuracy, cfg.accuracy_floor) {
            info!(
                accuracy = metrics.accuracy,
                floor = cfg.accuracy_floor,
                "training: below deployment floor"
            );
            return Ok(TrainReport {
                reason: Some(BELOW_FLOOR.to_string()),
                detail: Some(format!(
                    "accuracy {:.3} is below the {:.3} floor",
                    metrics.accuracy, cfg.accuracy_floor
                )),
                ..report
            });
        }

        // deploy
        let model = NewModel {
            name: cfg.model_name.clone(),
            metrics,
            training_data_count: total as i64,
            rules: candidate,
            trained_at: Utc::now(),
        };
        match self.store.deploy_model(&model, &feedback_ids) {
            Ok(deployed) => Ok(TrainReport {
                trained: true,
                model_id: Some(deployed.id),
                ..report
            }),
            Err(StoreError::BatchConsumed { expected, marked }) => {
                warn!(expected, marked, "training: feedback consumed by a concurrent run");
                Ok(TrainReport {
                    reason: Some(BATCH_CONSUMED.to_string()),
                    detail: Some(format!("{marked} of {expected} records were still unused")),
                    ..report
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rules proposed by the generator for fragments `derived` does not
    /// cover, confidence capped. Any failure yields no rules.
    async fn advisory_rules(&self, train: &[FeedbackRecord], derived: &[Rule]) -> Vec<Rule> {
        let Some(generator) = &self.generator else {
            return Vec::new();
        };
        let samples: Vec<TrainingSample> = train
            .iter()
            .map(|f| TrainingSample {
                description: f.description.clone(),
                category: f.corrected,
            })
            .collect();
        let limit = Duration::from_millis(self.config.synthesis_timeout_ms);

        let proposed = match tokio::time::timeout(limit, generator.generate_rules(&samples))
            .await
            .unwrap_or(Err(OracleError::Timeout(limit)))
        {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "advisory rule generation failed");
                return Vec::new();
            }
        };
        if let Err(reason) = check_advisory(&proposed) {
            warn!(reason = %reason, "advisory rules rejected");
            return Vec::new();
        }

        let covered: BTreeSet<&str> = derived.iter().map(|r| r.pattern.as_str()).collect();
        let cap = self.config.advisory_confidence_cap;
        proposed
            .into_iter()
            .filter(|r| !covered.contains(r.pattern.as_str()))
            .map(|r| Rule {
                confidence: r.confidence.min(cap),
                ..r
            })
            .collect()
    }
}

/// Shuffle and hold out `fraction` (at least one record, never all) for
/// validation. A single record is never held out.
pub(crate) fn split(
    mut feedback: Vec<FeedbackRecord>,
    fraction: f64,
    seed: Option<u64>,
) -> (Vec<FeedbackRecord>, Vec<FeedbackRecord>) {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    feedback.shuffle(&mut rng);
    let n = feedback.len();
    let held_out = if n < 2 {
        0
    } else {
        ((n as f64 * fraction).ceil() as usize).clamp(1, n - 1)
    };
    let validation = feedback.split_off(n - held_out);
    (feedback, validation)
}

/// One rule per base fragment with at least `min_support` samples: the
/// majority corrected category, confidence = majority share.
pub(crate) fn derive_rules(samples: &[FeedbackRecord], min_support: usize) -> Vec<Rule> {
    let mut tally: BTreeMap<String, BTreeMap<Category, usize>> = BTreeMap::new();
    for f in samples {
        if let Some(fragment) = derive_fragment(&f.description) {
            *tally
                .entry(fragment)
                .or_default()
                .entry(f.corrected)
                .or_default() += 1;
        }
    }

    tally
        .into_iter()
        .filter_map(|(pattern, counts)| {
            let support: usize = counts.values().sum();
            if support < min_support.max(1) {
                return None;
            }
            let (category, hits) = counts
                .into_iter()
                .fold(None, |best: Option<(Category, usize)>, (c, n)| match best {
                    Some((_, top)) if top >= n => best,
                    _ => Some((c, n)),
                })?;
            Some(Rule {
                pattern,
                category,
                confidence: hits as f64 / support as f64,
            })
        })
        .collect()
}

/// Previous rules, overridden by newly derived ones on the same pattern,
/// plus advisory rules for patterns neither covers.
pub(crate) fn merge_rules(previous: Vec<Rule>, derived: Vec<Rule>, advisory: Vec<Rule>) -> Vec<Rule> {
    let mut by_pattern: BTreeMap<String, Rule> = previous
        .into_iter()
        .map(|r| (r.pattern.clone(), r))
        .collect();
    for r in derived {
        by_pattern.insert(r.pattern.clone(), r);
    }
    for r in advisory {
        by_pattern.entry(r.pattern.clone()).or_insert(r);
    }
    let mut rules: Vec<Rule> = by_pattern.into_values().collect();
    sort_rules(&mut rules);
    rules
}

fn check_advisory(rules: &[Rule]) -> Result<(), String> {
    for (i, r) in rules.iter().enumerate() {
        if r.pattern.is_empty() || normalize_text(&r.pattern) != r.pattern {
            return Err(format!("rule {i}: pattern '{}' is not normalised", r.pattern));
        }
        if !(r.confidence.is_finite() && (0.0..=1.0).contains(&r.confidence)) {
            return Err(format!("rule {i}: confidence {} is outside [0, 1]", r.confidence));
        }
    }
    Ok(())
}

/// Accuracy plus macro precision/recall/F1 over the categories present in
/// `samples`.
pub(crate) fn evaluate(rules: &[Rule], samples: &[FeedbackRecord]) -> ModelMetrics {
    if samples.is_empty() {
        return ModelMetrics::default();
    }
    let pairs: Vec<(Category, Category)> = samples
        .iter()
        .map(|f| {
            let key = NarrationKey::new(&f.description);
            let predicted = select_rule(rules, &key)
                .map(|r| r.category)
                .unwrap_or_else(|| fallback_match(&key).category);
            (predicted, f.corrected)
        })
        .collect();

    let correct = pairs.iter().filter(|(p, a)| p == a).count();
    let accuracy = correct as f64 / pairs.len() as f64;

    let classes: BTreeSet<Category> = pairs.iter().map(|(_, a)| *a).collect();
    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for class in &classes {
        let tp = pairs.iter().filter(|(p, a)| p == class && a == class).count() as f64;
        let predicted = pairs.iter().filter(|(p, _)| p == class).count() as f64;
        let actual = pairs.iter().filter(|(_, a)| a == class).count() as f64;
        let p = if predicted > 0.0 { tp / predicted } else { 0.0 };
        let r = if actual > 0.0 { tp / actual } else { 0.0 };
        precision += p;
        recall += r;
        f1 += if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 };
    }
    let k = classes.len() as f64;
    ModelMetrics {
        accuracy,
        precision: precision / k,
        recall: recall / k,
        f1: f1 / k,
    }
}

pub(crate) fn should_deploy(mode: TrainMode, accuracy: f64, floor: f64) -> bool {
    match mode {
        TrainMode::Force => true,
        TrainMode::Immediate => accuracy >= floor,
        TrainMode::DryRun => false,
    }
}
