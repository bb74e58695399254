use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use wisp::config;
use wisp::enrich::{self, EnrichCtx};
use wisp::extract::{self, ExtractOptions};
use wisp::fetch::Fetcher;
use wisp::{backlink, db, gateway, index, ingest, invoke, migrate, ranking, search};

#[derive(Parser)]
#[command(
    name = "wisp",
    about = "Wisp — a discovery and routing gateway for MCP servers and tools",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./wisp.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and views
    Init,

    /// Pull all server records from the upstream registry
    Ingest {
        /// Search filter forwarded to the registry
        #[arg(long)]
        search: Option<String>,

        /// Stop after N servers
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Insert the curated server list
    Seed,

    /// Run an enrichment worker
    Enrich {
        /// Signal source to enrich from
        source: EnrichSource,

        /// Retry servers with recorded permanent failures
        #[arg(long)]
        clean: bool,
    },

    /// Extract tools from connectable servers
    Extract {
        #[command(subcommand)]
        action: Option<ExtractAction>,

        /// Only remote HTTP/SSE servers
        #[arg(long, conflicts_with = "local_only")]
        remote_only: bool,

        /// Only local stdio servers (npm/pypi/docker)
        #[arg(long)]
        local_only: bool,

        /// Skip servers that require authentication
        #[arg(long)]
        skip_auth: bool,

        /// Re-extract all servers, ignoring previous status
        #[arg(long)]
        clean: bool,

        /// Maximum servers to try
        #[arg(long)]
        limit: Option<usize>,

        /// Connection timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Filter servers by name (substring match)
        #[arg(long)]
        query: Option<String>,
    },

    /// Compute backlink edges and scores
    Score,

    /// Compute marketplace rankings
    Rank,

    /// Manage the search index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search indexed tools
    Search {
        /// Search query
        query: String,

        /// Page number (1-based)
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Results per page
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Call a tool on a server
    Call {
        /// Server name
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Start the HTTP gateway
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum EnrichSource {
    Github,
    Npm,
    Pypi,
    Docker,
    Glama,
    Services,
    Dependents,
    ConfigRefs,
    All,
}

#[derive(Subcommand)]
enum ExtractAction {
    /// Show extraction statistics
    Stats,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild search docs and the keyword index
    Build,
    /// Encode embeddings for docs without one
    Embed,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    // Ctrl-C cancels; workers commit their open transaction and exit.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, finishing current batch...");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { search, limit } => {
            ingest::run_ingest(&cfg, search, limit, &cancel).await?;
        }
        Commands::Seed => {
            ingest::run_seed(&cfg).await?;
        }
        Commands::Enrich { source, clean } => {
            let pool = db::connect(&cfg).await?;
            let fetcher = Fetcher::new(
                Duration::from_secs(cfg.enrichment.fetch_timeout_secs),
                cfg.enrichment.max_retries,
                Duration::from_millis(cfg.enrichment.base_delay_ms),
            )?;
            let ctx = EnrichCtx {
                pool: &pool,
                fetcher: &fetcher,
                config: &cfg,
                cancel: &cancel,
                clean,
            };
            match source {
                EnrichSource::Github => enrich::github::run(&ctx).await?,
                EnrichSource::Npm => enrich::npm::run(&ctx).await?,
                EnrichSource::Pypi => enrich::pypi::run(&ctx).await?,
                EnrichSource::Docker => enrich::docker::run(&ctx).await?,
                EnrichSource::Glama => enrich::glama::run(&ctx).await?,
                EnrichSource::Services => enrich::services::run(&ctx).await?,
                EnrichSource::Dependents => enrich::dependents::run(&ctx).await?,
                EnrichSource::ConfigRefs => enrich::config_refs::run(&ctx).await?,
                EnrichSource::All => enrich::run_all(&ctx).await?,
            }
            pool.close().await;
        }
        Commands::Extract {
            action,
            remote_only,
            local_only,
            skip_auth,
            clean,
            limit,
            timeout,
            query,
        } => match action {
            Some(ExtractAction::Stats) => {
                extract::run_extract_stats(&cfg).await?;
            }
            None => {
                let options = ExtractOptions {
                    remote_only,
                    local_only,
                    skip_auth,
                    clean,
                    limit,
                    timeout_secs: timeout,
                    query,
                };
                extract::run_extract(&cfg, &options, &cancel).await?;
            }
        },
        Commands::Score => {
            backlink::run_score(&cfg, &cancel).await?;
        }
        Commands::Rank => {
            ranking::run_rank(&cfg, &cancel).await?;
        }
        Commands::Index { action } => match action {
            IndexAction::Build => {
                index::run_index_build(&cfg).await?;
            }
            IndexAction::Embed => {
                index::run_index_embed(&cfg, &cancel).await?;
            }
        },
        Commands::Search { query, page, limit } => {
            search::run_search(&cfg, &query, page, limit).await?;
        }
        Commands::Call { server, tool, args } => {
            let arguments: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&args)?;
            let pool = db::connect(&cfg).await?;
            let timeout = Duration::from_secs(cfg.server.call_timeout_secs);
            match invoke::call_tool(&pool, &server, &tool, arguments, timeout).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            }
            pool.close().await;
        }
        Commands::Serve => {
            gateway::run_server(&cfg).await?;
        }
    }

    Ok(())
}
