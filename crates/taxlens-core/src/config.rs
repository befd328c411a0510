//! Layered configuration loading using figment.
//!
//! Sources, highest precedence last:
//! 1. Built-in defaults
//! 2. A TOML file (`taxlens.toml` in the working directory, or an explicit path)
//! 3. Environment variables (`TAXLENS_` prefix, `__` separating sections),
//!    e.g. `TAXLENS_TRAINING__MIN_FEEDBACK=50`.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "taxlens.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Figment(Box::new(e))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaxlensConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// DuckDB file; in-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub pattern_floor: f64,
    pub model_floor: f64,
    pub ai_floor: f64,
    pub ai_timeout_ms: u64,
    pub batch_concurrency: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            pattern_floor: 0.0,
            model_floor: 0.6,
            ai_floor: 0.5,
            ai_timeout_ms: 8_000,
            batch_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub high_threshold: f64,
    pub low_threshold: f64,
    /// Multiple of the scope's typical amount that counts as large.
    pub large_amount_multiple: f64,
    /// Absolute large amount (minor units) when no typical amount is known.
    pub large_amount_minor: i64,
    /// Amounts that are a multiple of this (minor units) count as round.
    pub round_step_minor: i64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.85,
            low_threshold: 0.70,
            large_amount_multiple: 5.0,
            large_amount_minor: 100_000_000,
            round_step_minor: 100_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LearningConfig {
    /// A full override retargets a pattern seen at most this many times.
    pub retarget_limit: i64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self { retarget_limit: 2 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub min_feedback: usize,
    pub accuracy_floor: f64,
    pub validation_fraction: f64,
    pub min_rule_support: usize,
    pub synthesis_timeout_ms: u64,
    pub advisory_confidence_cap: f64,
    pub seed: Option<u64>,
    pub model_name: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_feedback: 100,
            accuracy_floor: 0.8,
            validation_fraction: 0.2,
            min_rule_support: 2,
            synthesis_timeout_ms: 30_000,
            advisory_confidence_cap: 0.8,
            seed: None,
            model_name: "narration-rules".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint root, e.g. `https://api.openai.com/v1`.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

impl TaxlensConfig {
    /// Load from defaults, an optional TOML file, and the environment.
    ///
    /// With `path = None`, `taxlens.toml` in the working directory is used
    /// when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Build the provider chain. Public so tests can layer extra providers.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        match path {
            Some(p) => {
                debug!(path = %p.display(), "layering config file");
                figment = figment.merge(Toml::file(p));
            }
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    debug!(path = %local.display(), "layering config file");
                    figment = figment.merge(Toml::file(local));
                }
            }
        }

        figment.merge(Env::prefixed("TAXLENS_").split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |field: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(invalid(field, format!("{v} is outside [0, 1]")))
            }
        };
        unit("classifier.pattern_floor", self.classifier.pattern_floor)?;
        unit("classifier.model_floor", self.classifier.model_floor)?;
        unit("classifier.ai_floor", self.classifier.ai_floor)?;
        unit("review.high_threshold", self.review.high_threshold)?;
        unit("review.low_threshold", self.review.low_threshold)?;
        unit("training.accuracy_floor", self.training.accuracy_floor)?;
        unit(
            "training.advisory_confidence_cap",
            self.training.advisory_confidence_cap,
        )?;

        if self.review.low_threshold > self.review.high_threshold {
            return Err(invalid(
                "review.low_threshold",
                "must not exceed review.high_threshold".into(),
            ));
        }
        let fraction = self.training.validation_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(invalid(
                "training.validation_fraction",
                format!("{fraction} is outside (0, 1)"),
            ));
        }
        if self.classifier.batch_concurrency == 0 {
            return Err(invalid("classifier.batch_concurrency", "must be > 0".into()));
        }
        if self.review.round_step_minor <= 0 {
            return Err(invalid("review.round_step_minor", "must be > 0".into()));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = TaxlensConfig::default();
        config.validate().unwrap();
        assert_eq!(config.training.min_feedback, 100);
        assert_eq!(config.review.high_threshold, 0.85);
        assert!(!config.llm.is_configured());
        assert!(config.store.path.is_none());
    }

    #[test]
    fn env_overrides_nested_keys() {
        Jail::expect_with(|jail| {
            jail.set_env("TAXLENS_TRAINING__MIN_FEEDBACK", "40");
            jail.set_env("TAXLENS_LLM__BASE_URL", "http://localhost:11434/v1");
            let config = TaxlensConfig::load(None).expect("config loads");
            assert_eq!(config.training.min_feedback, 40);
            assert!(config.llm.is_configured());
            Ok(())
        });
    }

    #[test]
    fn toml_file_is_layered_under_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "taxlens.toml",
                r#"
                [review]
                high_threshold = 0.9

                [training]
                accuracy_floor = 0.75
                "#,
            )?;
            jail.set_env("TAXLENS_TRAINING__ACCURACY_FLOOR", "0.7");
            let config = TaxlensConfig::load(None).expect("config loads");
            assert_eq!(config.review.high_threshold, 0.9);
            assert_eq!(config.training.accuracy_floor, 0.7);
            // untouched keys keep their defaults
            assert_eq!(config.review.low_threshold, 0.70);
            Ok(())
        });
    }

    #[test]
    fn out_of_range_floor_is_rejected() {
        let mut config = TaxlensConfig::default();
        config.classifier.model_floor = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "classifier.model_floor"
        ));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = TaxlensConfig::default();
        config.review.low_threshold = 0.95;
        assert!(config.validate().is_err());
    }
}
