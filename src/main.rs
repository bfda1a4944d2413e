//! # llmops CLI
//!
//! ## Usage
//!
//! ```bash
//! llmops --config ./config/llmops.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `llmops init` | Create the SQLite database and run schema migrations |
//! | `llmops dataset create <name>` | Create a knowledge base |
//! | `llmops ingest <file> --dataset <id>` | Upload a file and build it into segments |
//! | `llmops search "<query>" --dataset <id>` | Search one or more datasets |
//! | `llmops workflow validate <graph.json>` | Validate a workflow graph |
//! | `llmops workflow run <graph.json> --input k=v` | Run a graph, streaming node events |
//! | `llmops app auto-create <name>` | Queue an app whose prompt the model writes |
//! | `llmops worker` | Consume background jobs until Ctrl-C |

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llmops::config::{load_config, Config};
use llmops::events::{AppAutoCreate, Event};
use llmops::indexing::ProcessRuleRequest;
use llmops::migrate;
use llmops::platform::Platform;
use llmops::retrieval::SearchRequest;
use llmops_core::search::RetrievalStrategy;

#[derive(Parser)]
#[command(
    name = "llmops",
    about = "LLM application platform backend: indexing, retrieval and workflows",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/llmops.toml")]
    config: PathBuf,

    /// Account that owns created resources and scopes every query.
    #[arg(long, global = true, default_value = "local")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage datasets.
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Upload a file into a dataset and build it.
    ///
    /// By default the document is built inline. With `--queue` a build job
    /// is published for `llmops worker` instead.
    Ingest {
        file: PathBuf,

        #[arg(long)]
        dataset: String,

        /// Publish a `document.build` job instead of building inline.
        #[arg(long)]
        queue: bool,
    },

    /// Search datasets.
    Search {
        query: String,

        /// Dataset to search. Repeatable.
        #[arg(long = "dataset", required = true)]
        datasets: Vec<String>,

        /// `full_text`, `semantic`, or `hybrid`.
        #[arg(long, default_value = "semantic")]
        strategy: String,

        #[arg(long)]
        k: Option<usize>,

        /// Minimum similarity for semantic results.
        #[arg(long)]
        score: Option<f64>,
    },

    /// Validate or run workflow graphs.
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Manage apps.
    App {
        #[command(subcommand)]
        action: AppAction,
    },

    /// Run every background consumer until Ctrl-C.
    Worker,
}

#[derive(Subcommand)]
enum DatasetAction {
    /// Create a dataset and print its ID.
    Create {
        name: String,

        #[arg(long, default_value = "")]
        description: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Validate a graph file and print the normalized graph. Retrieval
    /// nodes keep only datasets owned by `--account`.
    Validate { graph: PathBuf },

    /// Run a graph file, printing one JSON event per line.
    Run {
        graph: PathBuf,

        /// Start input as `name=value`. Values parse as JSON when possible.
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,
    },
}

#[derive(Subcommand)]
enum AppAction {
    /// Publish an `app.auto_create` job.
    AutoCreate {
        name: String,

        #[arg(long, default_value = "")]
        description: String,
    },
}

fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {:?}", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_graph(path: &PathBuf) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read graph file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| "Failed to parse graph JSON")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_tracing(&config);

    if let Commands::Init = cli.command {
        migrate::run_migrations(&config).await?;
        println!("Database initialized at {}", config.db.path.display());
        return Ok(());
    }

    let platform = Platform::open(&config).await?;
    let account = cli.account.as_str();

    match cli.command {
        Commands::Init => {}
        Commands::Workflow {
            action: WorkflowAction::Validate { graph },
        } => {
            let raw = read_graph(&graph)?;
            let graph = platform.workflows.normalize(account, None, &raw).await?;
            println!("{}", serde_json::to_string_pretty(&graph.to_value())?);
        }
        Commands::Dataset {
            action: DatasetAction::Create { name, description },
        } => {
            let dataset = platform
                .indexing
                .create_dataset(account, &name, &description)
                .await?;
            println!("{}", dataset.id);
        }
        Commands::Ingest {
            file,
            dataset,
            queue,
        } => {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file path has no name")?
                .to_string();
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let upload = platform.indexing.upload_file(account, &name, bytes).await?;
            let documents = platform
                .indexing
                .create_documents(
                    account,
                    &dataset,
                    &[upload.id.clone()],
                    ProcessRuleRequest::Automatic,
                )
                .await?;
            for doc in &documents {
                if queue {
                    platform
                        .dispatcher
                        .publish(&Event::build_document(doc.id.clone()))
                        .await?;
                    println!("{} queued", doc.id);
                } else {
                    platform.indexing.build_documents(&[doc.id.clone()]).await;
                    let built = platform
                        .indexing
                        .get_document(account, &doc.id)
                        .await?;
                    println!(
                        "{} {} characters={} tokens={} {}",
                        built.id, built.status, built.character_count, built.token_count, built.error
                    );
                }
            }
        }
        Commands::Search {
            query,
            datasets,
            strategy,
            k,
            score,
        } => {
            let Some(strategy) = RetrievalStrategy::parse(&strategy) else {
                bail!(
                    "Unknown strategy: '{}'. Must be full_text, semantic, or hybrid.",
                    strategy
                );
            };
            let request = SearchRequest::new(account, datasets, &query)
                .strategy(strategy)
                .k(k.unwrap_or(config.retrieval.default_k))
                .score(score.unwrap_or(config.retrieval.default_score));
            let results = platform.retrieval.search(&request).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, doc) in results.iter().enumerate() {
                let score = doc
                    .score()
                    .map_or_else(|| "-".to_string(), |s| format!("{:.3}", s));
                println!(
                    "{}. [{}] segment={}",
                    i + 1,
                    score,
                    doc.meta_str("segment_id").unwrap_or("?")
                );
                println!("    {}", doc.content.replace('\n', " "));
            }
        }
        Commands::Workflow {
            action: WorkflowAction::Run { graph, inputs },
        } => {
            let raw = read_graph(&graph)?;
            let graph = platform.workflows.normalize(account, None, &raw).await?;
            let inputs: Map<String, Value> = inputs.into_iter().collect();

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let (mut events, handle) =
                platform
                    .executor
                    .spawn(account.to_string(), graph, inputs, cancel);
            while let Some(event) = events.recv().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            let outcome = handle.await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "status": outcome.status,
                    "outputs": outcome.outputs,
                    "error": outcome.error,
                    "latency": outcome.latency,
                }))?
            );
            if !outcome.succeeded() {
                platform.close().await;
                std::process::exit(1);
            }
        }
        Commands::App {
            action: AppAction::AutoCreate { name, description },
        } => {
            let id = platform
                .dispatcher
                .publish(&Event::AppAutoCreate(AppAutoCreate {
                    name,
                    description,
                    account_id: account.to_string(),
                }))
                .await?;
            println!("{} queued", id);
        }
        Commands::Worker => {
            platform.dispatcher.start();
            info!("worker running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            platform.dispatcher.shutdown().await;
        }
    }

    platform.close().await;
    Ok(())
}
