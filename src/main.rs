//! Relearn CLI
//!
//! Runs a demonstration learning session, classifies error messages, and
//! prints the effective configuration.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relearn::{
    BudgetIterationManager, ErrorPatternRecognizer, FileLearningStore, InMemoryLearningStore,
    IterationContext, LearningConfig, LearningStore, LearningTask, MultiTurnLearningCoordinator,
    SessionOptions,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Relearn - multi-turn learning coordination
#[derive(Parser, Debug)]
#[command(name = "relearn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.relearn/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output: debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a synthetic task through the learning loop
    Run {
        /// Quality threshold that ends the session
        #[arg(long)]
        threshold: Option<f64>,

        /// Iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Fail every K-th iteration (0 never fails)
        #[arg(long, default_value_t = 3)]
        fail_every: u32,

        /// Progress gained per successful iteration
        #[arg(long, default_value_t = 0.15)]
        step: f64,

        /// Persist sessions and patterns under this directory
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },

    /// Classify one error message
    Classify {
        message: String,

        /// Stack trace or extra context
        #[arg(long)]
        stack: Option<String>,

        /// Learn against the patterns stored under this directory
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().or_else(LearningConfig::default_path);
    let config = LearningConfig::load_or_default(config_path.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            threshold,
            max_iterations,
            fail_every,
            step,
            store_dir,
        } => {
            let options = SessionOptions {
                quality_threshold: threshold,
                max_iterations,
                ..Default::default()
            };
            run_demo(config, options, fail_every, step, store_dir.as_deref()).await
        }
        Command::Classify {
            message,
            stack,
            store_dir,
        } => classify(config, &message, stack.as_deref(), store_dir.as_deref()).await,
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn open_store(store_dir: Option<&Path>) -> anyhow::Result<Arc<dyn LearningStore>> {
    let store: Arc<dyn LearningStore> = match store_dir {
        Some(dir) => Arc::new(FileLearningStore::new(dir).await?),
        None => Arc::new(InMemoryLearningStore::new()),
    };
    Ok(store)
}

async fn run_demo(
    mut config: LearningConfig,
    options: SessionOptions,
    fail_every: u32,
    step: f64,
    store_dir: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(max) = options.max_iterations {
        config.budget.max_iterations = config.budget.max_iterations.max(max);
    }
    config.validate()?;

    let store = open_store(store_dir).await?;
    let manager = Arc::new(BudgetIterationManager::new(config.budget.clone()));
    let coordinator = MultiTurnLearningCoordinator::new(config, store, manager);
    coordinator.initialize().await;

    let events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    let task = LearningTask::new(
        "demo",
        "relearn-cli",
        json!({
            "prompt": "Fill in every required field of the report.",
            "progress": 0.0,
        }),
        move |state: Value, n: u32| async move {
            if fail_every > 0 && n % fail_every == 0 {
                anyhow::bail!("Validation failed: required field 'summary' missing in report {}", n);
            }
            let progress = state["progress"].as_f64().unwrap_or(0.0);
            let mut next = state.clone();
            next["progress"] = json!((progress + step).min(1.0));
            Ok::<_, anyhow::Error>(next)
        },
        |state: &Value| state["progress"].as_f64().unwrap_or(0.0),
    );

    info!("Running demo task");
    let result = coordinator.start_session(task, options).await;

    // Dropping the coordinator closes the event channel and ends the printer.
    drop(coordinator);
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn classify(
    config: LearningConfig,
    message: &str,
    stack: Option<&str>,
    store_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let store = open_store(store_dir).await?;
    let recognizer = ErrorPatternRecognizer::new(config.patterns, store);
    recognizer.initialize().await;

    let analysis = recognizer
        .analyze_error(&IterationContext::default(), message, stack)
        .await;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}
