//! srake CLI - SRA metadata ingestion and tiered search

mod ingest_cmd;
mod render;

use clap::{Parser, Subcommand};
use srake_core::{Config, SrakeError};
use std::path::PathBuf;

/// Exit codes: 0 ok, 1 usage, 2 runtime error, 3 interrupted.
const EXIT_USAGE: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_INTERRUPTED: i32 = 3;

#[derive(Parser)]
#[command(name = "srake")]
#[command(about = "Mine NCBI SRA metadata locally", long_about = None)]
struct Cli {
    /// Path to the metadata store (env: SRAKE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Show progress bars (default on a TTY)
    #[arg(long, global = true, overrides_with = "no_progress")]
    progress: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest an SRA metadata archive into the store
    Ingest(ingest_cmd::IngestArgs),

    /// Search the store across the keyword, accession, and vector tiers
    Search {
        /// Query text or accession
        query: String,

        /// Maximum results
        #[arg(long)]
        limit: Option<usize>,

        /// Result offset for paging
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Search mode: auto, keyword, fts, vector, hybrid
        #[arg(long, default_value = "auto")]
        mode: String,

        /// Filter by organism (scientific name)
        #[arg(long)]
        organism: Option<String>,

        /// Filter by sequencing platform
        #[arg(long)]
        platform: Option<String>,

        /// Filter by library strategy
        #[arg(long)]
        strategy: Option<String>,

        /// Drop hits below this cosine similarity
        #[arg(long)]
        similarity_threshold: Option<f32>,

        /// Drop hits below this score
        #[arg(long)]
        min_score: Option<f32>,

        /// Keep only the top N percent of hits
        #[arg(long)]
        top_percentile: Option<f32>,
    },

    /// Fetch one entity by accession
    Metadata {
        /// Accession (SRP/SRX/SRS/SRR and E/D variants)
        accession: String,
    },

    /// Run the HTTP API server (delegates to srake-service)
    Server {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },

    /// Run the MCP stdio server (delegates to srake-mcp)
    Mcp,

    /// Store maintenance
    #[command(subcommand)]
    Db(DbCommands),

    /// Search index maintenance
    #[command(subcommand)]
    Index(IndexCommands),

    /// Embedding model utilities
    #[command(subcommand)]
    Models(ModelCommands),
}

#[derive(Subcommand)]
enum DbCommands {
    /// Show store location, size, and schema version
    Info,
    /// Row counts and top aggregations
    Stats,
    /// Export a table to stdout or a file
    Export {
        /// Table: studies, experiments, samples, runs
        #[arg(long, default_value = "studies")]
        table: String,
        /// Format: json, csv, tsv
        #[arg(long, default_value = "json")]
        format: String,
        /// Output path (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Build or resume the search indices from the store
    Build,
    /// Discard and rebuild all search indices
    Rebuild,
    /// Cross-check index contents against the store
    Verify,
    /// Index document counts and load counters
    Stats,
    /// Write a content-hashed snapshot archive of the index
    Snapshot {
        /// Output archive path
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// Show the configured embedding endpoint and model
    List,
    /// Model downloads are handled by the embedding server
    Download,
    /// Round-trip a probe string through the embedder
    Test,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders help/version through the same path
            let _ = err.print();
            let code = if err.use_stderr() { EXIT_USAGE } else { 0 };
            std::process::exit(code);
        }
    };

    render::init_tracing(cli.quiet, cli.verbose);
    if srake_core::paths::no_color() {
        colored::control::set_override(false);
    }

    let config = match Config::load_default() {
        Ok(config) => config,
        Err(err) => {
            render::error(&err, cli.json);
            std::process::exit(EXIT_RUNTIME);
        }
    };

    let result = dispatch(&cli, config);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            render::error(&err, cli.json);
            let code = match err {
                SrakeError::Cancelled => EXIT_INTERRUPTED,
                _ => EXIT_RUNTIME,
            };
            std::process::exit(code);
        }
    }
}

fn dispatch(cli: &Cli, config: Config) -> srake_core::Result<i32> {
    let db_path = srake_core::paths::db_path(cli.db.as_deref());
    let show_progress = ingest_cmd::progress_enabled(cli.progress, cli.no_progress, cli.quiet);

    match &cli.command {
        Commands::Ingest(args) => {
            ingest_cmd::run(args, &db_path, config, cli.json, show_progress)
        }
        Commands::Search {
            query,
            limit,
            offset,
            mode,
            organism,
            platform,
            strategy,
            similarity_threshold,
            min_score,
            top_percentile,
        } => cmd_search(
            &db_path,
            config,
            query,
            *limit,
            *offset,
            mode,
            organism.clone(),
            platform.clone(),
            strategy.clone(),
            *similarity_threshold,
            *min_score,
            *top_percentile,
            cli.json,
        ),
        Commands::Metadata { accession } => cmd_metadata(&db_path, accession, cli.json),
        Commands::Server { port, bind } => exec_sibling(
            "srake-service",
            &[
                "--port".into(),
                port.to_string(),
                "--bind".into(),
                bind.clone(),
                "--db".into(),
                db_path.display().to_string(),
            ],
        ),
        Commands::Mcp => exec_sibling("srake-mcp", &["--db".into(), db_path.display().to_string()]),
        Commands::Db(db) => cmd_db(&db_path, db, cli.json),
        Commands::Index(index) => cmd_index(&db_path, config, index, cli.json),
        Commands::Models(models) => cmd_models(config, models, cli.json),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_search(
    db_path: &std::path::Path,
    config: Config,
    query: &str,
    limit: Option<usize>,
    offset: usize,
    mode: &str,
    organism: Option<String>,
    platform: Option<String>,
    strategy: Option<String>,
    similarity_threshold: Option<f32>,
    min_score: Option<f32>,
    top_percentile: Option<f32>,
    json: bool,
) -> srake_core::Result<i32> {
    use srake_core::search::{SearchFilters, SearchOptions};

    let store = srake_core::MetadataStore::open_read(db_path)?;
    let router = render::build_router(db_path, &config)?;

    let mode = serde_json::from_value(serde_json::Value::String(mode.to_string()))
        .map_err(|_| SrakeError::ConfigInvalid(format!("unknown search mode '{mode}'")))?;

    let options = SearchOptions {
        limit,
        offset,
        mode,
        filters: SearchFilters {
            organism,
            platform,
            library_strategy: strategy,
        },
        hybrid_weight: None,
        similarity_threshold,
        min_score,
        top_percentile,
    };

    let result = router.search(&store, query, &options)?;
    render::search_result(&result, json);
    Ok(0)
}

fn cmd_metadata(db_path: &std::path::Path, accession: &str, json: bool) -> srake_core::Result<i32> {
    let store = srake_core::MetadataStore::open_read(db_path)?;
    let entity = srake_core::lookup::get(&store, accession)?
        .ok_or_else(|| SrakeError::NotFound(accession.to_string()))?;
    render::entity(&entity, json);
    Ok(0)
}

fn cmd_db(db_path: &std::path::Path, command: &DbCommands, json: bool) -> srake_core::Result<i32> {
    let store = srake_core::MetadataStore::open(db_path)?;
    match command {
        DbCommands::Info => {
            render::db_info(&store, json)?;
            Ok(0)
        }
        DbCommands::Stats => {
            render::db_stats(&store, json)?;
            Ok(0)
        }
        DbCommands::Export {
            table,
            format,
            output,
        } => {
            let kind = parse_table(table)?;
            let format = srake_core::export::ExportFormat::parse(format)?;
            let rows = match output {
                Some(path) => {
                    let mut file = std::fs::File::create(path)?;
                    srake_core::export::export_table(&store, kind, format, &mut file)?
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    srake_core::export::export_table(&store, kind, format, &mut lock)?
                }
            };
            render::note(&format!("exported {rows} rows"), json);
            Ok(0)
        }
    }
}

fn parse_table(name: &str) -> srake_core::Result<srake_core::RecordKind> {
    use srake_core::RecordKind;
    match name {
        "studies" | "study" => Ok(RecordKind::Study),
        "experiments" | "experiment" => Ok(RecordKind::Experiment),
        "samples" | "sample" => Ok(RecordKind::Sample),
        "runs" | "run" => Ok(RecordKind::Run),
        "submissions" => Ok(RecordKind::Submission),
        "analyses" => Ok(RecordKind::Analysis),
        other => Err(SrakeError::ConfigInvalid(format!("unknown table '{other}'"))),
    }
}

fn cmd_index(
    db_path: &std::path::Path,
    config: Config,
    command: &IndexCommands,
    json: bool,
) -> srake_core::Result<i32> {
    use srake_core::search::{builder, IndexBuilder, LazyIndex};
    use std::sync::atomic::Ordering;

    let index_path = srake_core::paths::index_path(db_path);
    let vector_path = srake_core::paths::embeddings_path(db_path);
    let index = LazyIndex::new(&index_path, config.idle_timeout());

    match command {
        IndexCommands::Build | IndexCommands::Rebuild => {
            let resume = matches!(command, IndexCommands::Build);
            let mut store = srake_core::MetadataStore::open(db_path)?;
            let embedder = render::embedder_from_config(&config)?;
            let builder = IndexBuilder::new(embedder, config.embedding.quantize);

            let cancel = builder.cancel_flag();
            let _ = ctrlc::set_handler(move || {
                cancel.store(true, Ordering::Relaxed);
            });

            let report = builder.build(&mut store, &index, &vector_path, resume)?;
            render::build_report(&report, json);
            Ok(if report.paused { EXIT_INTERRUPTED } else { 0 })
        }
        IndexCommands::Verify => {
            let store = srake_core::MetadataStore::open_read(db_path)?;
            let builder = IndexBuilder::new(None, false);
            let report = builder.verify(&store, &index)?;
            render::verify_report(&report, json);
            Ok(if report.consistent { 0 } else { EXIT_RUNTIME })
        }
        IndexCommands::Stats => {
            render::index_stats(&index, json)?;
            Ok(0)
        }
        IndexCommands::Snapshot { output } => {
            let hash = builder::snapshot(&index_path, output)?;
            render::note(&format!("snapshot {} ({hash})", output.display()), json);
            Ok(0)
        }
    }
}

fn cmd_models(config: Config, command: &ModelCommands, json: bool) -> srake_core::Result<i32> {
    match command {
        ModelCommands::List => {
            render::models_list(&config, json);
            Ok(0)
        }
        ModelCommands::Download => {
            render::note(
                "model files are managed by the embedding endpoint (e.g. `ollama pull`); srake only consumes its API",
                json,
            );
            Ok(0)
        }
        ModelCommands::Test => {
            let embedder = render::embedder_from_config(&config)?
                .ok_or_else(|| SrakeError::ConfigInvalid("embedding.endpoint is not configured".into()))?;
            let started = std::time::Instant::now();
            let vector = embedder.embed("metagenomic survey of soil bacteria")?;
            render::note(
                &format!(
                    "embedded probe: {} dimensions in {} ms",
                    vector.len(),
                    started.elapsed().as_millis()
                ),
                json,
            );
            Ok(0)
        }
    }
}

/// Run a sibling binary (installed next to this one), inheriting stdio.
fn exec_sibling(name: &str, args: &[String]) -> srake_core::Result<i32> {
    let mut path = std::env::current_exe()?;
    path.set_file_name(name);
    let program: std::path::PathBuf = if path.exists() {
        path
    } else {
        PathBuf::from(name)
    };

    let status = std::process::Command::new(&program)
        .args(args)
        .status()
        .map_err(|e| {
            SrakeError::ConfigInvalid(format!(
                "could not launch {}: {e} (is it installed alongside srake?)",
                program.display()
            ))
        })?;
    Ok(status.code().unwrap_or(EXIT_RUNTIME))
}
