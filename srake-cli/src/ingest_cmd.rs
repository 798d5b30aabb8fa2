//! The `srake ingest` subcommand.

use crate::render;
use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use srake_core::ingest::{self, sources, IngestController, IngestOptions, RecordFilter};
use srake_core::store::SourceState;
use srake_core::{Config, MetadataStore};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

#[derive(Args)]
pub struct IngestArgs {
    /// Pick the newest archive on the NCBI mirror (monthly full dump)
    #[arg(long, conflicts_with_all = ["daily", "monthly", "file", "list"])]
    auto: bool,

    /// Ingest the latest daily incremental dump
    #[arg(long, conflicts_with_all = ["monthly", "file", "list"])]
    daily: bool,

    /// Ingest the latest monthly full dump
    #[arg(long, conflicts_with_all = ["file", "list"])]
    monthly: bool,

    /// Ingest a local archive file
    #[arg(long)]
    file: Option<PathBuf>,

    /// List archives available on the mirror and exit
    #[arg(long)]
    list: bool,

    /// Resume prior progress (the default; kept for explicitness)
    #[arg(long)]
    resume: bool,

    /// Discard prior progress for this source and start over
    #[arg(long)]
    force: bool,

    /// Show ingest state for all known sources and exit
    #[arg(long)]
    status: bool,

    /// Checkpoint every N records
    #[arg(long, value_name = "N")]
    checkpoint: Option<u64>,

    /// Ask before resuming a source with prior progress
    #[arg(long)]
    interactive: bool,

    /// Prune file and checkpoint rows of completed sources, then exit
    #[arg(long)]
    cleanup: bool,

    /// Keep only these NCBI taxon ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    taxon_ids: Vec<i64>,

    /// Keep only these organisms (scientific names, comma-separated)
    #[arg(long, value_delimiter = ',')]
    organisms: Vec<String>,

    /// Keep only records submitted on or after this date (YYYY-MM-DD)
    #[arg(long)]
    date_from: Option<String>,

    /// Keep only records submitted before this date (YYYY-MM-DD)
    #[arg(long)]
    date_to: Option<String>,

    /// Keep only these platforms (comma-separated)
    #[arg(long, value_delimiter = ',')]
    platforms: Vec<String>,

    /// Keep only these library strategies (comma-separated)
    #[arg(long, value_delimiter = ',')]
    strategies: Vec<String>,

    /// Minimum total spots per run
    #[arg(long)]
    min_reads: Option<u64>,

    /// Maximum total spots per run
    #[arg(long)]
    max_reads: Option<u64>,

    /// Minimum total bases per run
    #[arg(long)]
    min_bases: Option<u64>,

    /// Maximum total bases per run
    #[arg(long)]
    max_bases: Option<u64>,

    /// Count what would be ingested without writing rows
    #[arg(long)]
    stats_only: bool,
}

impl IngestArgs {
    fn filter(&self) -> RecordFilter {
        let mut filter = RecordFilter::default()
            .with_organisms(self.organisms.iter().cloned())
            .with_platforms(self.platforms.iter().cloned())
            .with_strategies(self.strategies.iter().cloned());
        filter.taxon_ids = self.taxon_ids.iter().copied().collect();
        filter.date_from = self.date_from.clone();
        filter.date_to = self.date_to.clone();
        filter.min_reads = self.min_reads;
        filter.max_reads = self.max_reads;
        filter.min_bases = self.min_bases;
        filter.max_bases = self.max_bases;
        filter
    }
}

pub fn progress_enabled(progress: bool, no_progress: bool, quiet: bool) -> bool {
    if no_progress || quiet {
        return false;
    }
    use std::io::IsTerminal;
    progress || std::io::stderr().is_terminal()
}

pub fn run(
    args: &IngestArgs,
    db_path: &Path,
    config: Config,
    json: bool,
    show_progress: bool,
) -> srake_core::Result<i32> {
    if args.list {
        let client = reqwest_client();
        let archives = sources::list_remote(&client)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&archives)?);
        } else {
            for url in &archives {
                println!("{url}");
            }
        }
        return Ok(0);
    }

    let mut store = MetadataStore::open(db_path)?;

    if args.status {
        render::ingest_status(&ingest::status(&store)?, json);
        return Ok(0);
    }
    if args.cleanup {
        let removed = ingest::cleanup(&store)?;
        render::note(&format!("pruned {removed} file rows from completed sources"), json);
        return Ok(0);
    }

    let Some(origin) = resolve_origin(args) else {
        eprintln!("specify a source: --auto, --daily, --monthly, or --file <path>");
        return Ok(crate::EXIT_USAGE);
    };

    if args.interactive && !args.force && !confirm_resume(&store, &origin)? {
        render::note("aborted", json);
        return Ok(crate::EXIT_INTERRUPTED);
    }

    let mut controller = IngestController::new(config, args.filter());

    // Ctrl-C pauses at the next member or batch boundary
    let cancel = controller.cancel_flag();
    let _ = ctrlc::set_handler(move || {
        cancel.store(true, Ordering::Relaxed);
    });

    let bar = show_progress.then(|| {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:30} {bytes}/{total_bytes} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    });
    if let Some(bar) = bar.clone() {
        controller.on_progress(move |update| {
            if let Some(total) = update.bytes_total {
                bar.set_length(total);
            }
            bar.set_position(update.bytes_done);
            if let Some(file) = &update.current_file {
                bar.set_message(format!("{} records · {}", update.records_done, file));
            }
        });
    }

    let opts = IngestOptions {
        force: args.force,
        stats_only: args.stats_only,
        checkpoint_records: args.checkpoint,
    };
    let outcome = controller.run(&mut store, &origin, &opts)?;

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    render::ingest_outcome(&outcome, json);

    Ok(match outcome.state {
        SourceState::Paused => crate::EXIT_INTERRUPTED,
        _ => 0,
    })
}

fn resolve_origin(args: &IngestArgs) -> Option<String> {
    if let Some(file) = &args.file {
        return Some(file.display().to_string());
    }
    if args.daily {
        return Some(sources::latest_daily());
    }
    if args.monthly || args.auto {
        return Some(sources::latest_monthly());
    }
    None
}

/// `--interactive`: ask before resuming a source that has prior progress.
fn confirm_resume(store: &MetadataStore, origin: &str) -> srake_core::Result<bool> {
    let Some(status) = ingest::status(store)?
        .into_iter()
        .find(|s| s.source.origin_uri == origin)
    else {
        return Ok(true);
    };
    if status.records_done == 0 {
        return Ok(true);
    }

    eprint!(
        "{} has {} records from a previous run. Resume? [Y/n] ",
        origin.cyan(),
        status.records_done
    );
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

fn reqwest_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_origin_precedence() {
        let mut args = base_args();
        args.file = Some(PathBuf::from("/tmp/x.tar.gz"));
        args.daily = true;
        assert_eq!(resolve_origin(&args).unwrap(), "/tmp/x.tar.gz");

        let mut args = base_args();
        args.daily = true;
        assert!(resolve_origin(&args).unwrap().contains("NCBI_SRA_Metadata_2"));

        let args = base_args();
        assert!(resolve_origin(&args).is_none());
    }

    #[test]
    fn test_filter_assembly() {
        let mut args = base_args();
        args.taxon_ids = vec![9606];
        args.organisms = vec!["Homo Sapiens".into()];
        args.min_reads = Some(100);
        let filter = args.filter();
        assert!(filter.taxon_ids.contains(&9606));
        assert!(filter.organisms.contains("homo sapiens"));
        assert_eq!(filter.min_reads, Some(100));
    }

    fn base_args() -> IngestArgs {
        IngestArgs {
            auto: false,
            daily: false,
            monthly: false,
            file: None,
            list: false,
            resume: false,
            force: false,
            status: false,
            checkpoint: None,
            interactive: false,
            cleanup: false,
            taxon_ids: vec![],
            organisms: vec![],
            date_from: None,
            date_to: None,
            platforms: vec![],
            strategies: vec![],
            min_reads: None,
            max_reads: None,
            min_bases: None,
            max_bases: None,
            stats_only: false,
        }
    }
}
