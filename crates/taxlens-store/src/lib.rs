//! Storage layer: DuckDB-backed patterns, feedback ledger, and model registry.

mod duck;
mod error;
mod ledger;
mod registry;
mod rows;

pub use duck::DuckStore;
pub use error::StoreError;
pub use ledger::{PatternChange, PatternChangeKind, RecordOutcome};
