mod display;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use taxlens_ai::{ChatClient, TieredClassifier, TrainMode, TrainingPipeline};
use taxlens_core::{
    Amount, BusinessContext, Category, Correction, CorrectionType, Direction, Prediction,
    TaxlensConfig, Tier, Transaction,
};
use taxlens_store::DuckStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taxlens", version, about = "Tax classification for bank transaction narrations")]
struct Cli {
    /// Configuration file; ./taxlens.toml is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// DuckDB file, overriding `store.path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Classify a single transaction.
    Classify(ClassifyArgs),
    /// Record a confirmation or correction of an earlier classification.
    Correct(CorrectArgs),
    /// Train a global model from unused feedback.
    Train {
        /// dry-run, immediate or force.
        #[arg(long, default_value = "immediate")]
        mode: TrainMode,
        #[arg(long)]
        json: bool,
    },
    /// List learned patterns.
    Patterns {
        /// Only this scope's patterns.
        #[arg(long)]
        scope: Option<String>,
    },
    /// List models, newest first.
    Models,
    /// Summarise the feedback ledger and the active model.
    Stats,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[arg(long)]
    narration: String,
    /// Major units, e.g. 15000.00.
    #[arg(long)]
    amount: Amount,
    #[arg(long, default_value = "debit")]
    direction: Direction,
    /// Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    scope: Option<String>,
    /// Business name passed to the AI tier.
    #[arg(long)]
    business: Option<String>,
    #[arg(long)]
    industry: Option<String>,
    #[arg(long)]
    typical_amount: Option<Amount>,
    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CorrectArgs {
    #[arg(long)]
    scope: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    predicted: Category,
    #[arg(long, default_value_t = 0.5)]
    predicted_confidence: f64,
    #[arg(long, default_value = "fallback")]
    predicted_tier: Tier,
    #[arg(long)]
    corrected: Category,
    /// confirmation, partial_edit or full_override.
    #[arg(long = "type")]
    correction_type: CorrectionType,
    /// Caller-side event id; replays with the same reference are ignored.
    #[arg(long)]
    reference: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("taxlens: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let mut config =
        TaxlensConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.store.path = Some(db);
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = ?config.store.path,
        "taxlens starting"
    );
    let store = Arc::new(DuckStore::from_config(&config.store).context("failed to open store")?);

    match cli.command {
        Command::Classify(args) => classify(args, &config, store).await,
        Command::Correct(args) => correct(args, &config, &store),
        Command::Train { mode, json } => train(mode, json, &config, store).await,
        Command::Patterns { scope } => {
            let patterns = store
                .list_patterns(scope.as_deref())
                .context("failed to list patterns")?;
            display::print_patterns(&patterns);
            Ok(())
        }
        Command::Models => {
            let models = store.list_models().context("failed to list models")?;
            display::print_models(&models);
            Ok(())
        }
        Command::Stats => {
            let stats = store.feedback_stats().context("failed to read feedback stats")?;
            let patterns = store.pattern_count().context("failed to count patterns")?;
            let active = store.active_model().context("failed to read active model")?;
            display::print_stats(&stats, patterns, active.as_ref());
            Ok(())
        }
    }
}

async fn classify(
    args: ClassifyArgs,
    config: &TaxlensConfig,
    store: Arc<DuckStore>,
) -> anyhow::Result<()> {
    let mut classifier =
        TieredClassifier::new(store, config.classifier.clone(), config.review.clone());
    if let Some(client) = chat_client(config) {
        classifier = classifier.with_oracle(client);
    }

    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    let mut tx = Transaction::new(args.narration, args.amount, args.direction, date);
    if let Some(scope) = args.scope {
        tx = tx.with_scope(scope);
    }
    let context = if args.business.is_some()
        || args.industry.is_some()
        || args.typical_amount.is_some()
    {
        Some(BusinessContext {
            name: args.business,
            industry: args.industry,
            typical_amount: args.typical_amount,
        })
    } else {
        None
    };

    let result = classifier
        .classify(&tx, context.as_ref())
        .await
        .context("classification failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        display::print_classification(&tx, &result);
    }
    Ok(())
}

fn correct(args: CorrectArgs, config: &TaxlensConfig, store: &DuckStore) -> anyhow::Result<()> {
    let correction = Correction {
        scope_id: args.scope,
        description: args.description,
        predicted: Prediction {
            category: args.predicted,
            confidence: args.predicted_confidence,
            tier: args.predicted_tier,
        },
        corrected: args.corrected,
        correction_type: args.correction_type,
        reference: args.reference,
    };
    let outcome = store
        .record_correction(&correction, config.learning.retarget_limit)
        .context("failed to record correction")?;
    display::print_record_outcome(&outcome);
    Ok(())
}

async fn train(
    mode: TrainMode,
    json: bool,
    config: &TaxlensConfig,
    store: Arc<DuckStore>,
) -> anyhow::Result<()> {
    let mut pipeline = TrainingPipeline::new(store, config.training.clone());
    if let Some(client) = chat_client(config) {
        pipeline = pipeline.with_generator(client);
    }

    let report = pipeline.train(mode).await.context("training failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        display::print_train_report(&report);
    }
    Ok(())
}

/// LLM client when an endpoint is configured. A client that cannot be built
/// disables the AI features rather than failing the command.
fn chat_client(config: &TaxlensConfig) -> Option<Arc<ChatClient>> {
    if !config.llm.is_configured() {
        return None;
    }
    match ChatClient::new(&config.llm) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "LLM client unavailable, AI features disabled");
            None
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_classify() {
        let cli = Cli::try_parse_from([
            "taxlens",
            "--db",
            "/tmp/t.duckdb",
            "classify",
            "--narration",
            "POS PURCHASE AT SHOPRITE LAGOS",
            "--amount",
            "15000.00",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/t.duckdb")));
        let Command::Classify(args) = cli.command else {
            panic!("expected classify");
        };
        assert_eq!(args.amount, Amount::from_major(15_000));
        assert_eq!(args.direction, Direction::Debit);
        assert!(args.date.is_none());
    }

    #[test]
    fn parses_correct_and_train() {
        let cli = Cli::try_parse_from([
            "taxlens",
            "correct",
            "--scope",
            "biz-1",
            "--description",
            "UBER TRIP",
            "--predicted",
            "other",
            "--corrected",
            "transport",
            "--type",
            "full_override",
        ])
        .unwrap();
        let Command::Correct(args) = cli.command else {
            panic!("expected correct");
        };
        assert_eq!(args.corrected, Category::Transport);
        assert_eq!(args.correction_type, CorrectionType::FullOverride);
        assert_eq!(args.predicted_tier, Tier::Fallback);

        let cli = Cli::try_parse_from(["taxlens", "train", "--mode", "dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Train {
                mode: TrainMode::DryRun,
                json: false
            }
        ));
    }

    #[test]
    fn rejects_unknown_category() {
        let parsed = Cli::try_parse_from([
            "taxlens",
            "correct",
            "--scope",
            "biz-1",
            "--description",
            "UBER TRIP",
            "--predicted",
            "other",
            "--corrected",
            "spaceships",
            "--type",
            "confirmation",
        ]);
        assert!(parsed.is_err());
    }
}
