//! # Context Mesh CLI (`cmx`)
//!
//! The `cmx` binary is the primary interface for Context Mesh. It provides
//! commands for validating configuration, running one-shot queries, and
//! starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! cmx --config ./config/mesh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cmx check` | Load and validate the configuration file |
//! | `cmx query "<text>"` | One-shot retrieval against ingested content |
//! | `cmx serve` | Start the JSON HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Validate configuration
//! cmx check --config ./config/mesh.toml
//!
//! # One-shot query over a JSON corpus file
//! cmx query "authentication flow" --ingest ./corpus.json --agent debugging
//!
//! # Start the HTTP server
//! cmx serve --config ./config/mesh.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;

use context_mesh::config;
use context_mesh::models::EmbeddingMetadata;
use context_mesh::orchestrator::ContextService;
use context_mesh::retrieval::RetrievalRequest;
use context_mesh::server;

/// Context Mesh CLI — a unified context retrieval service for AI coding
/// agents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mesh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cmx",
    about = "Context Mesh — a unified context retrieval service for AI coding agents",
    version,
    long_about = "Context Mesh combines semantic search over embedded content, a TTL working-memory \
    cache, and a structural code graph behind one orchestrator, served over a JSON HTTP API for \
    integration with AI coding agents and editor tooling."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/mesh.toml`. All embedding, cache, retrieval,
    /// and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/mesh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration file.
    ///
    /// Exits non-zero with a descriptive message if any setting is out of
    /// range. Useful as a pre-deploy check.
    Check,

    /// Run a one-shot retrieval query.
    ///
    /// Builds an in-process service, optionally ingests a JSON corpus
    /// file, and prints the ranked results. Intended for local inspection
    /// of ranking and profile behavior.
    Query {
        /// The query text.
        query: String,

        /// Agent type used for profile filtering.
        #[arg(long, default_value = "code-generation")]
        agent: String,

        /// JSON corpus to ingest before querying: an array of
        /// `{ "content": ..., "metadata": ... }` objects.
        #[arg(long)]
        ingest: Option<PathBuf>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Start the JSON HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves
    /// until the process is terminated.
    Serve,
}

/// One corpus entry as stored in an `--ingest` file.
#[derive(Deserialize)]
struct CorpusItem {
    content: String,
    metadata: EmbeddingMetadata,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            println!("Configuration OK: {}", cli.config.display());
            println!(
                "  embedding: provider={} model={} dims={}",
                cfg.embedding.provider, cfg.embedding.model, cfg.embedding.dims
            );
            println!(
                "  cache: ttl={}s budget={}B",
                cfg.cache.ttl_secs, cfg.cache.max_memory_bytes
            );
            println!(
                "  retrieval: threshold={} max_results={}",
                cfg.retrieval.similarity_threshold, cfg.retrieval.max_results
            );
            println!("  server: bind={}", cfg.server.bind);
        }

        Commands::Query {
            query,
            agent,
            ingest,
            limit,
        } => {
            let service = ContextService::from_config(cfg)?;

            if let Some(path) = ingest {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;
                let items: Vec<CorpusItem> =
                    serde_json::from_str(&raw).context("Failed to parse corpus file")?;
                let stored = service
                    .ingest(items.into_iter().map(|i| (i.content, i.metadata)).collect())
                    .await?;
                println!("Ingested {stored} chunks from {}", path.display());
            }

            let mut request = RetrievalRequest::new(query, agent);
            request.max_results = limit;
            let response = service.retrieve_context(&request).await?;

            println!(
                "{} results ({} ms, relevance {:.3})",
                response.total_results, response.query_time_ms, response.relevance_score
            );
            for chunk in &response.chunks {
                let similarity = chunk.similarity.unwrap_or(0.0);
                let path = chunk.metadata.file_path.as_deref().unwrap_or("-");
                println!(
                    "  [{similarity:.3}] q={} {} {}",
                    chunk.metadata.quality,
                    path,
                    chunk.content.lines().next().unwrap_or("")
                );
            }
        }

        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
