//! # CLI Module
//!
//! Command-line interface for the receipt image cache.
//!
//! ## Usage
//! ```bash
//! # Offer images to the cache
//! receipt-cache ingest inbox/*.jpg --origin mail:2024-03
//!
//! # How full is it
//! receipt-cache stats
//!
//! # Everything cached, oldest first, as JSON
//! receipt-cache list --output json
//!
//! # Pull one image back out
//! receipt-cache get 3a7bd3e2360a3d29eea436fcfb7e44c735d117c4 --out receipt.jpg
//!
//! # Which record did this origin end up as
//! receipt-cache origin mail:2024-03
//!
//! # Drop anything older than 90 days
//! receipt-cache expire --max-age-days 90
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use receipt_cache::core::hasher::ContentDigest;
use receipt_cache::core::store::ImageRecord;
use receipt_cache::error::{Result, StoreError};
use receipt_cache::events::{BatchEvent, Event, EventChannel};
use receipt_cache::{CacheCoordinator, CacheConfig, Decision, IncomingImage, NearDuplicatePolicy, Outcome};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread;

const MIB: u64 = 1024 * 1024;

/// Receipt Cache - store each receipt once
#[derive(Parser, Debug)]
#[command(name = "receipt-cache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory (overrides config file and RECEIPT_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Cache budget in MiB (overrides config file and RECEIPT_CACHE_MAX_BYTES)
    #[arg(long, global = true)]
    max_size_mb: Option<u64>,

    /// Output format
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit image files to the cache
    Ingest {
        /// Image files to submit
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Origin recorded for every file (defaults to the file path)
        #[arg(long)]
        origin: Option<String>,

        /// Keep near duplicates as their own records
        #[arg(long)]
        persist_near_duplicates: bool,
    },
    /// Show cache size, budget and duplicate counts
    Stats,
    /// List cached records, oldest first
    List,
    /// Write a cached image to a file
    Get {
        /// Full hex content digest
        digest: String,

        /// Destination file
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Show the cached record an origin resolved to
    Origin {
        /// Origin id as given at ingest (the file path by default)
        origin_id: String,
    },
    /// Remove records older than the given age
    Expire {
        #[arg(long)]
        max_age_days: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with colors
    Pretty,
    /// JSON output for scripting
    Json,
}

/// Run the CLI
pub fn run() -> Result<()> {
    receipt_cache::init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let term = Term::stdout();

    match cli.command {
        Commands::Ingest {
            files,
            origin,
            persist_near_duplicates,
        } => {
            let config = if persist_near_duplicates {
                config.near_duplicate_policy(NearDuplicatePolicy::Persist)
            } else {
                config
            };
            run_ingest(&term, config, &files, origin.as_deref(), cli.output)
        }
        Commands::Stats => run_stats(&term, config, cli.output),
        Commands::List => run_list(&term, config, cli.output),
        Commands::Get { digest, out } => run_get(&term, config, &digest, &out, cli.output),
        Commands::Origin { origin_id } => run_origin(&term, config, &origin_id, cli.output),
        Commands::Expire { max_age_days } => run_expire(&term, config, max_age_days, cli.output),
    }
}

/// Defaults, then config file, then environment, then flags
fn load_config(cli: &Cli) -> Result<CacheConfig> {
    let base = match &cli.config {
        Some(path) => CacheConfig::from_json_file(path)?,
        None => CacheConfig::default(),
    };
    let mut config = base.with_env_overrides()?;
    if let Some(dir) = &cli.cache_dir {
        config = config.cache_directory(dir.clone());
    }
    if let Some(mb) = cli.max_size_mb {
        config = config.max_cache_size_bytes(mb.saturating_mul(MIB));
    }
    Ok(config)
}

#[derive(Serialize)]
struct FailedImage {
    origin_id: String,
    error: String,
}

fn run_ingest(
    term: &Term,
    config: CacheConfig,
    files: &[PathBuf],
    origin: Option<&str>,
    output: OutputFormat,
) -> Result<()> {
    let mut failures = Vec::new();
    let mut images = Vec::new();
    for path in files {
        let origin_id = origin
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        match std::fs::read(path) {
            Ok(bytes) => images.push(IncomingImage::new(bytes, origin_id)),
            Err(e) => failures.push(FailedImage {
                origin_id,
                error: e.to_string(),
            }),
        }
    }

    let (sender, receiver) = EventChannel::new();
    let cache = CacheCoordinator::builder(config).events(sender).open()?;

    let progress = if output == OutputFormat::Pretty {
        let pb = ProgressBar::new(images.len() as u64);
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(bar_style.progress_chars("█▓░"));
        }
        Some(pb)
    } else {
        None
    };

    let event_thread = thread::spawn(move || {
        for event in receiver.iter() {
            let Some(pb) = progress.as_ref() else {
                continue;
            };
            match event {
                Event::Batch(BatchEvent::Progress(p)) => pb.set_position(p.completed as u64),
                Event::Batch(BatchEvent::Completed { .. }) => pb.finish_and_clear(),
                _ => {}
            }
        }
    });

    let origins: Vec<String> = images.iter().map(|i| i.origin_id.clone()).collect();
    let batch = cache.submit_batch(images);

    // Dropping the cache drops the last sender, which ends the event thread
    drop(cache);
    event_thread.join().ok();

    let mut decisions = Vec::new();
    for (result, origin_id) in batch.results.into_iter().zip(origins) {
        match result {
            Ok(decision) => decisions.push(decision),
            Err(e) => failures.push(FailedImage {
                origin_id,
                error: e.to_string(),
            }),
        }
    }

    match output {
        OutputFormat::Json => print_json(&serde_json::json!({
            "decisions": decisions,
            "failures": failures,
            "summary": batch.summary,
        })),
        OutputFormat::Pretty => {
            for decision in &decisions {
                term.write_line(&format_decision(decision)).ok();
            }
            for failure in &failures {
                term.write_line(&format!(
                    "  {} {} {}",
                    style("✗").red().bold(),
                    failure.origin_id,
                    style(&failure.error).red()
                ))
                .ok();
            }
            term.write_line("").ok();
            term.write_line(&format!(
                "{} {} new, {} exact, {} near, {} failed in {:.1}s",
                style("✓").green().bold(),
                style(batch.summary.new_images).cyan(),
                style(batch.summary.exact_duplicates).cyan(),
                style(batch.summary.near_duplicates).cyan(),
                style(failures.len()).red(),
                batch.summary.duration_ms as f64 / 1000.0
            ))
            .ok();
            if batch.summary.evicted > 0 {
                term.write_line(&format!(
                    "  {} records evicted to stay within budget",
                    style(batch.summary.evicted).yellow()
                ))
                .ok();
            }
        }
    }
    Ok(())
}

fn format_decision(decision: &Decision) -> String {
    let digest = decision.content_digest.short();
    match (decision.outcome, decision.matched_digest) {
        (Outcome::New, _) => format!(
            "  {} {} {}",
            style("+").green().bold(),
            style(digest).cyan(),
            decision.origin_id
        ),
        (Outcome::ExactDuplicate, _) => format!(
            "  {} {} {} {}",
            style("=").dim(),
            style(digest).cyan(),
            decision.origin_id,
            style("(exact duplicate)").dim()
        ),
        (Outcome::NearDuplicate, matched) => format!(
            "  {} {} {} {}",
            style("≈").yellow(),
            style(digest).cyan(),
            decision.origin_id,
            style(format!(
                "(looks like {}, score {:.3})",
                matched.map(|d| d.short()).unwrap_or_default(),
                decision.score
            ))
            .dim()
        ),
    }
}

fn run_stats(term: &Term, config: CacheConfig, output: OutputFormat) -> Result<()> {
    let cache = CacheCoordinator::open(config)?;
    let stats = cache.stats()?;

    match output {
        OutputFormat::Json => {
            let mut value = serde_json::json!(stats);
            value["usage_percent"] = serde_json::json!(stats.usage_percent());
            value["cache_directory"] = serde_json::json!(cache.config().cache_directory);
            print_json(&value);
        }
        OutputFormat::Pretty => {
            term.write_line(&format!(
                "{} {}",
                style("Receipt Cache").bold().cyan(),
                style(cache.config().cache_directory.display()).dim()
            ))
            .ok();
            term.write_line("").ok();
            term.write_line(&format!("  {} images", style(stats.entry_count).cyan()))
                .ok();
            term.write_line(&format!(
                "  {} of {} used ({:.1}%)",
                style(format_bytes(stats.total_bytes)).yellow(),
                format_bytes(stats.budget_bytes),
                stats.usage_percent()
            ))
            .ok();
            term.write_line(&format!(
                "  {} duplicate submissions absorbed",
                style(stats.duplicate_count).cyan()
            ))
            .ok();
            if let (Some(oldest), Some(newest)) = (stats.oldest_entry, stats.newest_entry) {
                term.write_line(&format!(
                    "  {} {} .. {}",
                    style("stored").dim(),
                    oldest.format("%Y-%m-%d %H:%M"),
                    newest.format("%Y-%m-%d %H:%M")
                ))
                .ok();
            }
        }
    }
    Ok(())
}

fn run_list(term: &Term, config: CacheConfig, output: OutputFormat) -> Result<()> {
    let cache = CacheCoordinator::open(config)?;
    let records = cache.records()?;

    match output {
        OutputFormat::Json => print_json(&records),
        OutputFormat::Pretty => {
            if records.is_empty() {
                term.write_line(&format!("  {}", style("Cache is empty").dim())).ok();
            }
            for record in &records {
                term.write_line(&format_record(record)).ok();
            }
        }
    }
    Ok(())
}

fn format_record(record: &ImageRecord) -> String {
    format!(
        "  {}  {:>10}  x{:<3} {}  {}",
        style(record.content_digest.to_hex()).cyan(),
        format_bytes(record.size_bytes),
        record.ref_count,
        style(record.stored_at.format("%Y-%m-%d %H:%M")).dim(),
        record.origin_id
    )
}

fn run_get(
    term: &Term,
    config: CacheConfig,
    digest: &str,
    out: &Path,
    output: OutputFormat,
) -> Result<()> {
    let digest: ContentDigest = digest.parse().map_err(|_| StoreError::NotFound {
        digest: digest.to_string(),
    })?;
    let cache = CacheCoordinator::open(config)?;
    let bytes = cache.get(&digest)?;
    std::fs::write(out, &bytes).map_err(|source| StoreError::Io {
        path: out.to_path_buf(),
        source,
    })?;

    match output {
        OutputFormat::Json => print_json(&serde_json::json!({
            "content_digest": digest,
            "size_bytes": bytes.len(),
            "path": out,
        })),
        OutputFormat::Pretty => {
            term.write_line(&format!(
                "{} Wrote {} to {}",
                style("✓").green().bold(),
                format_bytes(bytes.len() as u64),
                out.display()
            ))
            .ok();
        }
    }
    Ok(())
}

fn run_origin(term: &Term, config: CacheConfig, origin_id: &str, output: OutputFormat) -> Result<()> {
    let cache = CacheCoordinator::open(config)?;
    let record = cache.lookup_origin(origin_id)?;

    match (output, record) {
        (OutputFormat::Json, record) => print_json(&record),
        (OutputFormat::Pretty, Some(record)) => {
            term.write_line(&format_record(&record)).ok();
        }
        (OutputFormat::Pretty, None) => {
            term.write_line(&format!(
                "  {}",
                style(format!("Nothing cached for {}", origin_id)).dim()
            ))
            .ok();
        }
    }
    Ok(())
}

fn run_expire(term: &Term, config: CacheConfig, max_age_days: u32, output: OutputFormat) -> Result<()> {
    let cache = CacheCoordinator::open(config)?;
    let summary = cache.expire_older_than(chrono::Duration::days(i64::from(max_age_days)))?;

    match output {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Pretty => {
            term.write_line(&format!(
                "{} Expired {} records, freed {}",
                style("✓").green().bold(),
                style(summary.evicted.len()).cyan(),
                style(format_bytes(summary.freed_bytes)).yellow()
            ))
            .ok();
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!(error = %e, "Could not serialize output"),
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
