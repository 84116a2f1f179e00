//! Build the local track index from JSON lines.
//! Usage: build-index <tracks.jsonl> <index.sqlite3>
//!
//! Each input line is `{"title": "...", "artist": "...", "album": "..."}`
//! (album optional). Malformed lines are counted and skipped.

use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use track_resolver::local::{IndexedTrack, KeyedTrack, LocalIndex};
use track_resolver::progress::{self, create_progress_bar, create_spinner, format_duration, log_progress};

#[derive(Parser)]
#[command(name = "build-index")]
#[command(about = "Import JSON-lines track records into a local SQLite/FTS5 index")]
struct Args {
    input: PathBuf,

    output: PathBuf,

    #[arg(long, default_value = "0")]
    workers: usize,

    /// Rows per write transaction
    #[arg(long, default_value = "10000")]
    batch_size: usize,

    /// Delete an existing index instead of appending to it
    #[arg(long)]
    replace: bool,

    /// Disable progress bars, log progress lines instead
    #[arg(long)]
    log_only: bool,
}

fn read_tracks(path: &Path) -> Result<(Vec<IndexedTrack>, usize)> {
    let file = File::open(path).with_context(|| format!("Failed to open input {:?}", path))?;
    let mut tracks = Vec::new();
    let mut skipped = 0;

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read input")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexedTrack>(line) {
            Ok(track) if !track.title.trim().is_empty() && !track.artist.trim().is_empty() => {
                tracks.push(track)
            }
            Ok(_) => skipped += 1,
            Err(e) => {
                if skipped < 10 {
                    warn!(line = line_no + 1, error = %e, "skipping malformed record");
                }
                skipped += 1;
            }
        }
    }
    Ok((tracks, skipped))
}

fn write_index(index: &LocalIndex, tracks: &[KeyedTrack], batch_size: usize) -> Result<()> {
    let total = tracks.len() as u64;
    let pb = create_progress_bar(total, "Writing index");
    let mut written = 0u64;

    for batch in tracks.chunks(batch_size.max(1)) {
        index.insert_batch(batch).context("Failed to write batch")?;
        written += batch.len() as u64;
        pb.set_position(written);
        log_progress("Writing index", written, total, batch_size as u64);
    }

    pb.finish_with_message(format!("Wrote {} tracks", written));
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    progress::set_log_only(args.log_only);
    progress::init_tracing();

    if args.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    let start = Instant::now();

    let (tracks, skipped) = read_tracks(&args.input)?;
    info!(records = tracks.len(), skipped, "read input");

    let keyed: Vec<KeyedTrack> = tracks.into_par_iter().map(IndexedTrack::keyed).collect();

    if args.replace && args.output.exists() {
        std::fs::remove_file(&args.output).context("Failed to remove existing index")?;
    }
    let index = LocalIndex::open(&args.output)
        .with_context(|| format!("Failed to open index {:?}", args.output))?;

    write_index(&index, &keyed, args.batch_size)?;

    let spinner = create_spinner("Optimizing index");
    index.optimize().context("Failed to optimize index")?;
    spinner.finish_with_message("Index optimized");

    let rows = index.len()?;
    let file_size = std::fs::metadata(&args.output)?.len();

    println!("\n{:=<60}", "");
    println!("Index build complete!");
    println!("  Imported: {}", keyed.len());
    println!("  Skipped: {}", skipped);
    println!("  Rows in index: {}", rows);
    println!("  Index size: {:.2} MB", file_size as f64 / 1_048_576.0);
    println!("  Elapsed: {}", format_duration(start.elapsed()));
    println!("{:=<60}", "");

    Ok(())
}
