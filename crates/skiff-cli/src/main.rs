use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use skiff_core::search::{matches_record, parse_terms};
use skiff_core::{
    LogSource, MemoryLog, QueryDescriptor, QueryFallbackChain, QueryMode, ReadMode, RecordStream,
    StreamCursor,
};

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Query console for an append-only log")]
struct Cli {
    /// Log level on stderr (-v info, -vv debug)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query descriptor against a JSONL log file
    Query {
        /// Log file, one JSON record per line
        log: PathBuf,

        /// Inline JSON descriptor
        #[arg(long, short = 'q', conflicts_with = "file")]
        json: Option<String>,

        /// Read the descriptor from a file
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
    },

    /// Full-text search, degrading to a linear scan without an index
    Search {
        /// Log file, one JSON record per line
        log: PathBuf,

        /// Whitespace-separated search terms
        terms: String,

        /// Pretend the log service has no search index
        #[arg(long)]
        no_index: bool,

        /// Most matches to print
        #[arg(long, default_value_t = 500)]
        limit: u64,
    },

    /// Print the built-in example descriptor
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Query { log, json, file } => run_query(&log, json, file).await,
        Commands::Search {
            log,
            terms,
            no_index,
            limit,
        } => run_search(&log, &terms, no_index, limit).await,
        Commands::Example => {
            let example = QueryDescriptor::example(Utc::now().timestamp_millis());
            println!("{}", serde_json::to_string_pretty(&example)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_query(log_path: &Path, json: Option<String>, file: Option<PathBuf>) -> Result<()> {
    let raw: Value = match (json, file) {
        (Some(inline), _) => serde_json::from_str(&inline).context("parsing inline descriptor")?,
        (None, Some(path)) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading descriptor file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing descriptor file {}", path.display()))?
        }
        (None, None) => serde_json::to_value(QueryDescriptor::example(
            Utc::now().timestamp_millis(),
        ))?,
    };

    if !QueryDescriptor::is_valid_raw(&raw) {
        bail!("invalid descriptor: \"query\" must be an array of $filter/$map/$reduce stages");
    }
    let descriptor: QueryDescriptor = serde_json::from_value(raw).context("parsing descriptor")?;
    // A static file has no tail to follow.
    let descriptor = descriptor.live(false);

    let source: Arc<dyn LogSource> = Arc::new(load_log(log_path)?);
    let mut cursor = StreamCursor::new(source, descriptor);
    let mut total = 0u64;
    while let Some(page) = cursor.next_page().await? {
        for record in &page {
            println!("{}", serde_json::to_string_pretty(&record.payload)?);
            total += 1;
        }
    }
    info!(total, "query complete");
    Ok(())
}

async fn run_search(log_path: &Path, terms: &str, no_index: bool, limit: u64) -> Result<()> {
    let log = load_log(log_path)?;
    let log = if no_index { log.without_index() } else { log };
    let source: Arc<dyn LogSource> = Arc::new(log);

    let primary = match source.search(terms, limit) {
        Ok(stream) => stream,
        Err(err) if err.is_unavailable() => {
            let (tx, stream) = RecordStream::channel();
            tx.fail(err);
            stream
        }
        Err(err) => return Err(err.into()),
    };

    let parsed = parse_terms(terms);
    let linear = QueryDescriptor::default().reverse(true);
    let fallback_source = source.clone();
    let mut chain = QueryFallbackChain::new(
        primary,
        move || fallback_source.query(&linear, ReadMode::Bounded),
        move |record| matches_record(&parsed, record),
    );
    let state = chain.state();

    let mut shown = 0u64;
    while shown < limit {
        match chain.next().await {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record.payload)?);
                shown += 1;
            }
            None => break,
        }
    }

    let snapshot = state.snapshot();
    if let Some(failed) = &snapshot.failed {
        bail!("search failed: {failed}");
    }
    let mode = match snapshot.mode {
        QueryMode::Primary => "indexed",
        QueryMode::Fallback => "linear-scan",
    };
    eprintln!(
        "mode: {mode}, scanned: {}, matches: {}",
        snapshot.scanned, snapshot.matches
    );
    Ok(())
}

/// Read a JSONL file into an in-process log. A line that is not JSON is an
/// error; a well-formed line missing key or timestamp is dropped with a
/// warning, matching how the engine treats malformed replicated entries.
fn load_log(path: &Path) -> Result<MemoryLog> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading log file {}", path.display()))?;
    let log = MemoryLog::new();
    let mut dropped = 0usize;
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: Value = serde_json::from_str(line)
            .with_context(|| format!("log line {} is not JSON", lineno + 1))?;
        if !log.append_raw(&raw) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(dropped, "malformed records dropped while loading");
    }
    Ok(log)
}
