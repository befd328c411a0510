//! Core types and pure logic shared by every taxlens layer.

pub mod category;
pub mod classification;
pub mod config;
pub mod feedback;
pub mod flags;
pub mod fragment;
pub mod model;
pub mod policy;
pub mod transaction;

pub use category::{Category, Tier, UnknownCategory};
pub use classification::ClassificationResult;
pub use config::{
    ClassifierConfig, ConfigError, LearningConfig, LlmConfig, ReviewConfig, StoreConfig,
    TaxlensConfig, TrainingConfig,
};
pub use feedback::{Correction, CorrectionType, FeedbackRecord, FeedbackStats, Prediction};
pub use flags::{Flags, TaxImplications, detect_flags};
pub use fragment::NarrationKey;
pub use model::{Model, ModelMetrics, ModelStatus, NewModel, Pattern, Rule};
pub use policy::{ReviewAction, ReviewDecision, ReviewInput, ReviewPolicy};
pub use transaction::{Amount, BusinessContext, Direction, Transaction, TransactionError};
