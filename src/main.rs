//! # Canvas Context CLI (`cvx`)
//!
//! The `cvx` binary drives the ingestion pipeline and exposes the retrieval
//! surface for inspection.
//!
//! ## Usage
//!
//! ```bash
//! cvx --config ./config/cvx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cvx init` | Create the SQLite database and run schema migrations |
//! | `cvx sync` | Walk all courses, extract, embed, and store incrementally |
//! | `cvx status` | Show the tenant's persisted sync progress |
//! | `cvx cancel` | Cooperatively cancel a running sync |
//! | `cvx retrieve "<topic>"` | Top-K stored chunks for a topic in a course |
//! | `cvx context "<topic>"` | Tiered generation context for a topic |
//!
//! Credentials come from environment variables: `CANVAS_API_TOKEN`,
//! `OPENAI_API_KEY` / `COHERE_API_KEY`, `TAVILY_API_KEY`, and AWS keys when
//! the S3 blob backend is configured.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use canvas_context::blob;
use canvas_context::config;
use canvas_context::crawl::HttpFetcher;
use canvas_context::db;
use canvas_context::embedding::{Embedder, ProviderChain};
use canvas_context::fallback::ContextResolver;
use canvas_context::lms::CanvasClient;
use canvas_context::migrate;
use canvas_context::progress::ProgressMode;
use canvas_context::retrieval;
use canvas_context::sync;
use canvas_context::websearch;

/// Canvas Context — course-material ingestion and confidence-tiered
/// retrieval for AI lesson generation.
#[derive(Parser)]
#[command(
    name = "cvx",
    about = "Canvas Context — course-material ingestion and tiered retrieval for AI lesson generation",
    version,
    long_about = "Canvas Context walks LMS courses, extracts text from pages, assignments, \
    files, and linked web pages, incrementally embeds the text into SQLite, and resolves \
    confidence-tiered generation context for lesson generation."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cvx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (chunks,
    /// content_hashes, sync_progress). Idempotent.
    Init,

    /// Walk every course and ingest its material incrementally.
    ///
    /// Unchanged materials (by content hash) are skipped entirely. An
    /// interrupted sync restarted within the staleness window resumes from
    /// its last recorded course.
    Sync {
        /// Tenant whose progress row this sync owns.
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Progress output: auto, off, human, or json (stderr).
        #[arg(long, default_value = "auto")]
        progress: String,

        /// Detach the walk onto a background task and report acceptance
        /// immediately; observe with `cvx status` (or cancel with
        /// `cvx cancel`) from another terminal.
        #[arg(long)]
        detach: bool,
    },

    /// Show the persisted sync progress for a tenant.
    Status {
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Print the raw progress row as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Cooperatively cancel a running sync.
    ///
    /// The walk loop checks its status before each course and stops there.
    Cancel {
        #[arg(long, default_value = "default")]
        tenant: String,
    },

    /// Retrieve the top-K stored chunks for a topic within a course.
    Retrieve {
        /// The topic to search for.
        topic: String,

        /// Course id to search within.
        #[arg(long)]
        course: String,

        /// Maximum number of chunks to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Resolve tiered generation context for a topic within a course.
    ///
    /// Prints the chosen fallback tier, disclaimer, sources, and composed
    /// context.
    Context {
        /// The lesson topic.
        topic: String,

        /// Course id to resolve against.
        #[arg(long)]
        course: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }

        Commands::Sync {
            tenant,
            progress,
            detach,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let mode = match progress.as_str() {
                "auto" if detach => ProgressMode::Off,
                "auto" => ProgressMode::default_for_tty(),
                "off" => ProgressMode::Off,
                "human" => ProgressMode::Human,
                "json" => ProgressMode::Json,
                other => anyhow::bail!("unknown progress mode: {}", other),
            };

            let deps = sync::SyncDeps {
                lms: Arc::new(CanvasClient::from_config(&cfg.lms)?),
                fetcher: Arc::new(HttpFetcher::new(cfg.crawl.timeout_secs)?),
                embedder: Arc::new(ProviderChain::from_config(&cfg.embedding)?),
                blob: Arc::from(blob::create_blob_store(&cfg.blob)?),
                reporter: Arc::from(mode.reporter()),
                pool: pool.clone(),
                config: cfg,
            };

            if detach {
                let handle = sync::spawn_sync(deps, tenant.clone());
                println!(
                    "Sync for '{}' accepted; running in the background. \
                     Observe with `cvx status --tenant {}`.",
                    tenant, tenant
                );
                // Keep the runtime alive until the detached task finishes;
                // every observation goes through the persisted row.
                let _ = handle.await;
            } else {
                sync::run_sync(&deps, &tenant).await?;

                if let Some(row) = sync::load_progress(&pool, &tenant).await? {
                    println!("sync {}", tenant);
                    println!("  status: {}", row.status.as_str());
                    println!("  courses: {}", row.course_total);
                    println!("  materials stored: {}", row.materials_stored);
                    println!("  chunks created: {}", row.chunks_created);
                }
            }
            pool.close().await;
        }

        Commands::Status { tenant, json } => {
            let pool = db::connect(&cfg).await?;
            match sync::load_progress(&pool, &tenant).await? {
                None => println!("No sync recorded for tenant '{}'.", tenant),
                Some(row) if json => println!("{}", serde_json::to_string_pretty(&row)?),
                Some(row) => {
                    println!("sync {}", tenant);
                    println!("  status: {}", row.status.as_str());
                    println!("  phase: {}", row.phase);
                    println!(
                        "  course: {} / {}",
                        row.course_index + 1,
                        row.course_total
                    );
                    println!("  materials stored: {}", row.materials_stored);
                    println!("  chunks created: {}", row.chunks_created);
                    println!("  message: {}", row.message);
                    if let Some(err) = &row.error {
                        println!("  error: {}", err);
                    }
                }
            }
            pool.close().await;
        }

        Commands::Cancel { tenant } => {
            let pool = db::connect(&cfg).await?;
            if sync::cancel_sync(&pool, &tenant).await? {
                println!("Sync for '{}' cancelled; it will stop at the next course boundary.", tenant);
            } else {
                println!("No running sync for '{}'.", tenant);
            }
            pool.close().await;
        }

        Commands::Retrieve {
            topic,
            course,
            limit,
        } => {
            let pool = db::connect(&cfg).await?;
            let embedder = ProviderChain::from_config(&cfg.embedding)?;
            let k = limit.unwrap_or(cfg.retrieval.top_k);
            let results = retrieval::top_chunks(&pool, &embedder, &course, &topic, k).await?;

            if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    let title = r.title.as_deref().unwrap_or("(untitled)");
                    println!("{}. [{:.2}] {}", i + 1, r.score, title);
                    if let Some(url) = &r.source_url {
                        println!("    url: {}", url);
                    }
                    let excerpt: String = r.text.chars().take(240).collect();
                    println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
                    println!("    chunk: {}", r.chunk_id);
                    println!();
                }
            }
            pool.close().await;
        }

        Commands::Context { topic, course } => {
            let pool = db::connect(&cfg).await?;
            let embedder = if cfg.embedding.is_enabled() {
                Some(ProviderChain::from_config(&cfg.embedding)?)
            } else {
                None
            };
            let search = websearch::create_search_provider(&cfg.websearch)?;

            let resolver = ContextResolver {
                pool: &pool,
                embedder: embedder.as_ref().map(|e| e as &dyn Embedder),
                search: search.as_deref(),
                config: &cfg.retrieval,
            };
            let ctx = resolver.resolve_context(&course, &topic).await;

            println!("tier: {}", ctx.tier.as_str());
            if let Some(disclaimer) = &ctx.disclaimer {
                println!("disclaimer: {}", disclaimer);
            }
            if !ctx.sources.is_empty() {
                println!("sources:");
                for s in &ctx.sources {
                    match &s.url {
                        Some(url) => println!("  - [{:.2}] {} ({})", s.relevance, s.title, url),
                        None => println!("  - [{:.2}] {}", s.relevance, s.title),
                    }
                }
            }
            println!();
            println!("{}", ctx.content);
            pool.close().await;
        }
    }

    Ok(())
}
