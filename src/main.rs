//! # Article Integrator CLI (`integrator`)
//!
//! The `integrator` binary is the operator interface: it initializes the
//! database, runs integrations, inspects articles and promotes staged
//! documents.
//!
//! ## Usage
//!
//! ```bash
//! integrator --config ./config/integrator.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `integrator init` | Create the SQLite database and run schema migrations |
//! | `integrator sources` | List configured sources |
//! | `integrator run` | Run an integration over all (or selected) sources |
//! | `integrator show <id>` | Print an integrated article with provenance |
//! | `integrator lookup <scheme> <value>` | Find the article carrying an identifier |
//! | `integrator stats` | Database overview |
//! | `integrator stage <id> <file>` | Stage a document for promotion |
//! | `integrator push` | Promote the staged document named by a push envelope |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use article_integrator::cancel::CancellationToken;
use article_integrator::pipeline::{run_integration, RunOptions, RunResult};
use article_integrator::progress::ProgressMode;
use article_integrator::sqlite_store::SqliteStore;
use article_integrator::traits::AdapterRegistry;
use article_integrator::{
    adapter_staging, config, db, get, migrate, push, runs, sources, stats,
};

/// Article Integrator CLI: integrate book articles from many sources into
/// one deduplicated dataset.
#[derive(Parser)]
#[command(
    name = "integrator",
    about = "Article Integrator: merge book articles from heterogeneous sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/integrator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// List configured sources and their status.
    Sources,

    /// Run an integration.
    ///
    /// Fetches every selected source, normalizes and resolves records,
    /// merges them into articles and persists the result.
    Run {
        /// Source selector: `all`, a type (`http`), or a label
        /// (`http:openlibrary`). Repeatable; default is all sources.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Ignore stored cursors and fetch everything.
        #[arg(long)]
        full: bool,

        /// Merge without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr: off, human, json. Default: human on a TTY.
        #[arg(long)]
        progress: Option<String>,

        /// Print the run result as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// Print an integrated article.
    Show {
        /// Canonical id (`art_…`).
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Find the live article carrying an identifier.
    Lookup {
        /// Identifier scheme (`isbn`, `doi`, `issn`, …).
        scheme: String,
        value: String,

        #[arg(long)]
        json: bool,
    },

    /// Show database statistics.
    Stats,

    /// Stage a JSON document for promotion.
    Stage {
        /// Staged document id.
        id: String,

        /// JSON file holding the document.
        file: PathBuf,

        #[arg(long, default_value = "processed")]
        status: String,
    },

    /// Promote the staged document named by a push envelope.
    Push {
        /// Envelope file. Reads stdin when omitted.
        #[arg(long)]
        envelope: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Run {
            sources,
            full,
            dry_run,
            progress,
            json,
        } => {
            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(raw) => ProgressMode::parse(raw).with_context(|| {
                    format!("invalid --progress '{}': expected off, human or json", raw)
                })?,
            };
            run(&cfg, &sources, full, dry_run, mode, json).await?;
        }
        Commands::Show { id, json } => {
            get::run_show(&cfg, &id, json).await?;
        }
        Commands::Lookup {
            scheme,
            value,
            json,
        } => {
            get::run_lookup(&cfg, &scheme, &value, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Stage { id, file, status } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&body)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            let pool = db::connect(&cfg).await?;
            adapter_staging::stage_document(&pool, &id, &payload, &status).await?;
            pool.close().await;
            println!("staged {} ({})", id, status);
        }
        Commands::Push { envelope } => {
            let body = match envelope {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut body = String::new();
                    std::io::stdin().read_to_string(&mut body)?;
                    body
                }
            };
            push::run_push(&cfg, &body).await?;
        }
    }

    Ok(())
}

async fn run(
    cfg: &config::Config,
    selectors: &[String],
    full: bool,
    dry_run: bool,
    mode: ProgressMode,
    json: bool,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let registry = AdapterRegistry::from_config(cfg, &pool)?;
    if registry.is_empty() {
        anyhow::bail!("No sources configured. Add [sources.<type>.<name>] tables to the config.");
    }
    let adapters = registry.select(selectors)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let options = RunOptions {
        dry_run,
        full,
        cancel,
        progress: mode.reporter(),
    };

    let started = chrono::Utc::now();
    let result = match run_integration(adapters, store, &cfg.pipeline_config(), options).await {
        Ok(result) => result,
        Err(e) => {
            if !dry_run {
                runs::record_failure(&pool, started, &e.to_string()).await?;
            }
            pool.close().await;
            return Err(e.into());
        }
    };
    if !dry_run {
        runs::record_run(&pool, &result).await?;
    }
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(())
}

fn print_summary(result: &RunResult) {
    println!(
        "run {}{}",
        result.run_id,
        if result.dry_run { " (dry-run)" } else { "" }
    );
    for source in &result.sources {
        println!(
            "  {:<28} {:?}  fetched {}  normalized {}  skipped {}",
            source.source_id, source.status, source.fetched, source.normalized, source.skipped
        );
    }
    println!("  records: {}  groups: {}", result.record_count, result.group_count);
    println!(
        "  articles: {} written, {} unchanged, {} superseded",
        result.written_count, result.unchanged_count, result.superseded_count
    );
    if result.skipped_count > 0 {
        println!("  skipped records: {}", result.skipped_count);
    }
    for failed in &result.failed_sources {
        println!("  failed source {}: {}", failed.source_id, failed.reason);
    }
    if !result.unresolved_conflicts.is_empty() {
        println!("  unresolved conflicts: {}", result.unresolved_conflicts.len());
    }
    for entity in &result.failed_entities {
        println!("  failed article {}: {}", entity.canonical_id, entity.reason);
    }
    println!("{}", result.final_stage);
}
