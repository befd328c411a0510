//! Classification and learning: the tiered classifier, the LLM-backed AI
//! tier, and the offline training pipeline that produces global models.

mod classifier;
mod fallback;
mod llm;
mod oracle;
mod training;

pub use classifier::{ClassifyError, TierMatch, TierOutcome, TieredClassifier};
pub use fallback::{FALLBACK_CONFIDENCE, fallback_match};
pub use llm::ChatClient;
pub use oracle::{
    AiRequest, AiSuggestion, CategoryOracle, OracleError, RuleGenerator, TrainingSample,
    parse_rules, parse_suggestion,
};
pub use training::{TrainMode, TrainReport, TrainingError, TrainingPipeline};
