//! Terminal output helpers: tracing setup, JSON/plain rendering.

use colored::Colorize;
use srake_core::embed::{Embedder, HttpEmbedder};
use srake_core::ingest::{IngestOutcome, SourceStatus};
use srake_core::search::builder::{BuildReport, VerifyReport};
use srake_core::search::{LazyIndex, SearchResult, SearchRouter};
use srake_core::store::{EntityRow, MetadataStore};
use srake_core::{Config, SrakeError};
use std::path::Path;
use std::sync::Arc;

pub fn init_tracing(quiet: bool, verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("srake={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!srake_core::paths::no_color())
        .init();
}

pub fn error(err: &SrakeError, json: bool) {
    if json {
        let envelope = srake_core::ErrorEnvelope::from(err);
        eprintln!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
    } else {
        eprintln!("{} {}", "Error:".red(), err);
        let hint = err.hint();
        if !hint.is_empty() {
            eprintln!("  {} {}", "hint:".yellow(), hint);
        }
    }
}

pub fn note(message: &str, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "message": message }));
    } else {
        println!("{message}");
    }
}

pub fn search_result(result: &SearchResult, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
        return;
    }

    println!(
        "{} hits for {} ({} mode, {} ms)",
        result.total_hits,
        result.query.cyan(),
        result.mode,
        result.time_ms
    );
    for (rank, hit) in result.hits.iter().enumerate() {
        let title = hit
            .fields
            .get("title")
            .or_else(|| hit.fields.get("label"))
            .map(String::as_str)
            .unwrap_or("");
        let similarity = hit
            .similarity
            .map(|s| format!(" sim={s:.2}"))
            .unwrap_or_default();
        println!(
            "{:>3}. {} {} [{:?}] score={:.2}{}",
            rank + 1,
            hit.id.green(),
            title,
            hit.confidence,
            hit.score,
            similarity
        );
        for highlight in &hit.highlights {
            println!("       {}", highlight.dimmed());
        }
    }

    if !result.facets.is_empty() {
        for (field, values) in &result.facets {
            let rendered: Vec<String> = values
                .iter()
                .take(5)
                .map(|v| format!("{} ({})", v.value, v.count))
                .collect();
            println!("{}: {}", field.blue(), rendered.join(", "));
        }
    }
}

pub fn entity(entity: &EntityRow, json: bool) {
    // metadata lookups are structured output either way
    let _ = json;
    println!("{}", serde_json::to_string_pretty(entity).unwrap_or_default());
}

pub fn ingest_status(statuses: &[SourceStatus], json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(statuses).unwrap_or_default());
        return;
    }
    if statuses.is_empty() {
        println!("no ingest sources known");
        return;
    }
    for status in statuses {
        println!(
            "{} [{}] {} records, {} files",
            status.source.origin_uri.cyan(),
            format!("{:?}", status.source.state).to_lowercase(),
            status.records_done,
            status.files.len()
        );
        if let Some(checkpoint) = &status.last_checkpoint {
            println!(
                "    last checkpoint: {} records, file {}",
                checkpoint.records_done,
                checkpoint.last_file.as_deref().unwrap_or("-")
            );
        }
    }
}

pub fn ingest_outcome(outcome: &IngestOutcome, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "source_id": outcome.source_id,
                "origin": outcome.origin_uri,
                "state": format!("{:?}", outcome.state).to_lowercase(),
                "inserted": outcome.writes.inserted,
                "ignored": outcome.writes.ignored,
                "failed": outcome.writes.failed,
                "accepted": outcome.counts.accepted,
                "rejected": outcome.counts.rejected,
                "warnings": outcome.counts.warnings,
                "files_done": outcome.files_done,
                "files_skipped": outcome.files_skipped,
                "files_errored": outcome.files_errored,
                "already_complete": outcome.already_complete,
            })
        );
        return;
    }

    if outcome.already_complete {
        println!(
            "{} {} (use --force to re-ingest)",
            "Already complete:".yellow(),
            outcome.origin_uri
        );
        return;
    }

    println!(
        "{}: {} inserted, {} duplicates, {} filtered out, {} warnings",
        "Ingested".green(),
        outcome.writes.inserted,
        outcome.writes.ignored,
        outcome.counts.rejected,
        outcome.counts.warnings
    );
    println!(
        "{}: {} done, {} fast-forwarded, {} errored",
        "Files".blue(),
        outcome.files_done,
        outcome.files_skipped,
        outcome.files_errored
    );
}

pub fn db_info(store: &MetadataStore, json: bool) -> srake_core::Result<()> {
    let info = serde_json::json!({
        "path": store.path().display().to_string(),
        "size_bytes": store.size_bytes(),
        "schema_version": store.schema_version()?,
    });
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("store:   {}", store.path().display());
        println!("size:    {:.1} MB", store.size_bytes() as f64 / 1_000_000.0);
        println!("schema:  v{}", store.schema_version()?);
    }
    Ok(())
}

pub fn db_stats(store: &MetadataStore, json: bool) -> srake_core::Result<()> {
    let counts = store.counts()?;
    if json {
        let mut stats = serde_json::json!({ "counts": counts });
        for field in srake_core::lookup::aggregate_fields() {
            stats["aggregations"][field] =
                serde_json::to_value(srake_core::lookup::aggregate(store, field, 10)?)?;
        }
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("studies:     {}", counts.studies);
    println!("experiments: {}", counts.experiments);
    println!("samples:     {}", counts.samples);
    println!("runs:        {}", counts.runs);
    println!("submissions: {}", counts.submissions);
    println!("analyses:    {}", counts.analyses);
    for field in srake_core::lookup::aggregate_fields() {
        let values = srake_core::lookup::aggregate(store, field, 5)?;
        if values.is_empty() {
            continue;
        }
        let rendered: Vec<String> = values
            .iter()
            .map(|v| format!("{} ({})", v.value, v.count))
            .collect();
        println!("{}: {}", field.blue(), rendered.join(", "));
    }
    Ok(())
}

pub fn build_report(report: &BuildReport, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        return;
    }
    if report.paused {
        println!("{} (resume with `srake index build`)", "Build paused".yellow());
    }
    println!(
        "{}: {} studies, {} experiments, {} accession rows, {} vectors ({} ms)",
        "Indexed".green(),
        report.studies,
        report.experiments,
        report.fts_rows,
        report.vectors,
        report.time_ms
    );
}

pub fn verify_report(report: &VerifyReport, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        return;
    }
    let status = if report.consistent {
        "consistent".green()
    } else {
        "out of date".red()
    };
    println!(
        "index {}: {} docs vs {} store rows; accession tier {} of {}",
        status, report.index_docs, report.store_docs, report.fts_rows, report.fts_expected
    );
}

pub fn index_stats(index: &LazyIndex, json: bool) -> srake_core::Result<()> {
    let docs = index.doc_count()?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "path": index.path().display().to_string(),
                "documents": docs,
                "loads": index.load_count(),
                "closes": index.close_count(),
            })
        );
    } else {
        println!("index:     {}", index.path().display());
        println!("documents: {docs}");
        println!("loads:     {}", index.load_count());
        println!("closes:    {}", index.close_count());
    }
    Ok(())
}

pub fn models_list(config: &Config, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "endpoint": config.embedding.endpoint,
                "model": config.embedding.model,
                "dimensions": config.embedding.dimensions,
                "models_home": srake_core::paths::models_home().display().to_string(),
            })
        );
        return;
    }
    if config.embedding.endpoint.is_empty() {
        println!("no embedding endpoint configured (set [embedding].endpoint)");
    } else {
        println!("endpoint:   {}", config.embedding.endpoint);
        println!("model:      {}", config.embedding.model);
        println!("dimensions: {}", config.embedding.dimensions);
    }
    println!("models dir: {}", srake_core::paths::models_home().display());
}

pub fn embedder_from_config(config: &Config) -> srake_core::Result<Option<Arc<dyn Embedder>>> {
    if !config.vector_enabled() {
        return Ok(None);
    }
    Ok(Some(Arc::new(HttpEmbedder::new(&config.embedding)?)))
}

pub fn build_router(db_path: &Path, config: &Config) -> srake_core::Result<SearchRouter> {
    let index = Arc::new(LazyIndex::new(
        &srake_core::paths::index_path(db_path),
        config.idle_timeout(),
    ));
    let embedder = embedder_from_config(config)?;
    Ok(SearchRouter::new(
        index,
        &srake_core::paths::embeddings_path(db_path),
        embedder,
        config.search.default_limit,
        config.search.hybrid_weight,
    )
    .with_timeout(config.search_timeout()))
}
