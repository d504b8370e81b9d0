#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use query_harness::config::HarnessConfig;
use query_harness::history::{read_history, write_history, EvaluationRecordStore, HistoryItem};
use query_harness::scrubber::{Scrubber, ScrubberConfig};
use query_harness::server::{
    CancellationContext, Dataset, Position, QueryServerClient, TracingProgress,
};
use query_harness::state::SqliteGlobalState;
use query_harness::upgrade::{DirectoryUpgradeCatalog, UpgradeResolver};
use query_harness::{
    DatabaseMetadata, EvaluationRequest, LocalDatabase, OrchestratorConfig, QueryOrchestrator,
};

#[derive(Parser)]
#[command(name = "qharness", version, about = "Query evaluation harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or maintain query history
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
    /// Evaluate a query against a database
    Run {
        #[arg(long)]
        query: PathBuf,
        #[arg(long)]
        database: PathBuf,
        /// Schema file the query's library targets
        #[arg(long)]
        query_schema: PathBuf,
        #[arg(long)]
        library_path: Vec<PathBuf>,
        /// Directories holding database upgrades
        #[arg(long)]
        upgrades: Vec<PathBuf>,
        /// Evaluate only this span: file:line:column:endLine:endColumn
        #[arg(long)]
        quick_eval: Option<Position>,
        #[arg(long)]
        label: Option<String>,
        /// Query server executable (overrides QHARNESS_SERVER_PATH)
        #[arg(long)]
        server: Option<PathBuf>,
        /// History file to append the result to
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Clear the query server's evaluation cache for a database
    ClearCache {
        #[arg(long)]
        database: PathBuf,
        /// Report what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
        /// Query server executable (overrides QHARNESS_SERVER_PATH)
        #[arg(long)]
        server: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// Print every item in a history file
    List {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Delete expired query directories
    Scrub {
        #[arg(long = "dir", required = true)]
        dirs: Vec<PathBuf>,
        #[arg(long)]
        ttl_days: Option<u64>,
        /// Global state database (defaults to one under the storage dir)
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HarnessConfig::from_env()?;

    match cli.command {
        Commands::History { command } => match command {
            HistoryCommands::List { file } => {
                let path = file.unwrap_or_else(|| config.history.history_path());
                let items = read_history(&path).await;
                if items.is_empty() {
                    println!("no history in {}", path.display());
                }
                for item in &items {
                    println!(
                        "{}\t{}\t{:?}\t{}",
                        item_kind(item),
                        item.id(),
                        item.state(),
                        item.label()
                    );
                }
            }
            HistoryCommands::Scrub {
                dirs,
                ttl_days,
                state,
            } => {
                let state_path = state.unwrap_or_else(|| config.state_path());
                let state = Arc::new(SqliteGlobalState::new(state_path)?);
                let max_query_age = ttl_days
                    .map(|days| Duration::from_secs(days * 24 * 60 * 60))
                    .unwrap_or(config.history.max_query_age);
                let scrubber = Scrubber::new(
                    ScrubberConfig {
                        max_query_age,
                        roots: dirs,
                        ..ScrubberConfig::from_history(&config.history)
                    },
                    state,
                );
                let report = scrubber.scrub_now().await?;
                println!("deleted {} directories; kept {}", report.deleted, report.kept);
                for error in &report.errors {
                    eprintln!("{error}");
                }
            }
        },
        Commands::Run {
            query,
            database,
            query_schema,
            library_path,
            upgrades,
            quick_eval,
            label,
            server,
            history,
        } => {
            let database = LocalDatabase::open(&database).await?;
            let query_text = tokio::fs::read_to_string(&query).await.map_err(
                |e| -> Box<dyn std::error::Error> {
                    format!("cannot read query {}: {e}", query.display()).into()
                },
            )?;

            let mut server_config = config.server.clone();
            if server.is_some() {
                server_config.server_path = server;
            }
            let client = Arc::new(QueryServerClient::spawn(server_config).await?);
            let resolver = UpgradeResolver::new(
                Arc::new(DirectoryUpgradeCatalog::new(upgrades)),
                config.history.upgrades_dir(),
            );
            let history_path = history.unwrap_or_else(|| config.history.history_path());
            let records = Arc::new(EvaluationRecordStore::with_items(read_history(&history_path).await));
            let orchestrator = QueryOrchestrator::new(
                client.clone(),
                resolver,
                records.clone(),
                OrchestratorConfig {
                    queries_dir: config.history.queries_dir(),
                },
            );

            let mut request = EvaluationRequest::new(&query, &query_schema, &database)
                .with_query_text(query_text)
                .with_library_path(library_path);
            if let Some(position) = quick_eval {
                request = request.with_quick_eval(position);
            }
            if let Some(label) = label {
                request = request.with_label(label);
            }

            let outcome = orchestrator
                .evaluate(request, &database, Some(Arc::new(TracingProgress)))
                .await;
            write_history(&records.snapshot(), &history_path).await?;
            client.shutdown().await;

            let completed = outcome?;
            println!("{}", completed.record.label());
            if let Some(message) = &completed.surfaced_message {
                eprintln!("{message}");
            }
            if let Some(dir) = completed.record.query_save_dir() {
                println!("output: {}", dir.display());
            }
            if !completed.record.successful() {
                return Err(format!("evaluation {}", completed.record.display_status()).into());
            }
        }
        Commands::ClearCache {
            database,
            dry_run,
            server,
        } => {
            let mut server_config = config.server.clone();
            if server.is_some() {
                server_config.server_path = server;
            }
            let database = LocalDatabase::open(&database).await?;
            let client = QueryServerClient::spawn(server_config).await?;
            let outcome = client
                .clear_cache(
                    Dataset::new(database.dataset_path().display().to_string()),
                    dry_run,
                    &CancellationContext::new(),
                )
                .await;
            client.shutdown().await;
            println!("{}", outcome?.deletion_message);
        }
    }
    Ok(())
}

fn item_kind(item: &HistoryItem) -> &'static str {
    match item {
        HistoryItem::Local(_) => "local",
        HistoryItem::VariantAnalysis(_) => "variant-analysis",
    }
}
