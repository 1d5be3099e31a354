//! # repo-rag CLI (`rrag`)
//!
//! Commands for database initialization, chunk ingestion, embedding,
//! search, statistics and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! rrag --config ./config/rrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rrag init` | Create the SQLite database and schema |
//! | `rrag ingest <file.json> --repo <id>` | Store extractor output for a repository |
//! | `rrag embed pending [--repo <id>]` | Embed pending chunks and exit |
//! | `rrag search "<query>"` | Search indexed chunks |
//! | `rrag stats [--repo <id>]` | Show index and embedding coverage |
//! | `rrag serve` | Start the HTTP server and the embedding pipeline |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use repo_rag::services::AppServices;
use repo_rag::{config, embed_cmd, ingest, migrate, search, server, stats};

/// repo-rag: embedding pipeline, hybrid code search and grounded chat
/// over source repositories.
#[derive(Parser)]
#[command(
    name = "rrag",
    about = "repo-rag: embedding pipeline, hybrid code search and grounded chat over source repositories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest chunk tuples from a JSON file.
    ///
    /// The file holds either an array of `{file_path, start_line, end_line,
    /// text, language, content_hash?}` objects or a request object with
    /// `chunks` and `removed_files`.
    Ingest {
        file: PathBuf,

        /// Repository id the chunks belong to.
        #[arg(long)]
        repo: String,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search indexed chunks.
    Search {
        query: String,

        /// Search mode: `lexical` (BM25), `vector`, or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Restrict to one repository.
        #[arg(long)]
        repo: Option<String>,

        /// Restrict to one language (e.g. `rust`).
        #[arg(long)]
        language: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show chunk counts, embedding coverage and failed chunks.
    Stats {
        #[arg(long)]
        repo: Option<String>,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing vectors, then exit.
    Pending {
        /// Only this repository.
        #[arg(long)]
        repo: Option<String>,

        /// Show the pending count without embedding.
        #[arg(long)]
        dry_run: bool,
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
        Commands::Ingest { file, repo } => {
            let services = AppServices::build(&cfg).await?;
            ingest::run_ingest(&services, &file, &repo).await?;
            services.pool.close().await;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { repo, dry_run } => {
                embed_cmd::run_embed_pending(&cfg, repo, dry_run).await?;
            }
        },
        Commands::Search {
            query,
            mode,
            repo,
            language,
            limit,
        } => {
            let services = AppServices::build(&cfg).await?;
            search::run_search(&services, &query, &mode, repo, language, limit).await?;
            services.pool.close().await;
        }
        Commands::Stats { repo } => {
            stats::run_stats(&cfg, repo).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
