use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use track_resolver::config::{PipelineConfig, RemoteConfig, ScriptConfig};
use track_resolver::models::{QueryMode, SearchType};
use track_resolver::pipeline::{Pipeline, SearchRequest};
use track_resolver::progress::{self, format_duration};
use track_resolver::query::Query;

#[derive(Parser)]
#[command(name = "track-resolve")]
#[command(about = "Resolve a music query against a local index, a remote catalog and resolver scripts")]
struct Args {
    /// Free-text query (omit when using --track/--album/--artist)
    text: Option<String>,

    #[arg(long)]
    track: Option<String>,

    #[arg(long)]
    album: Option<String>,

    #[arg(long)]
    artist: Option<String>,

    /// tracks, albums or artists
    #[arg(long = "type", default_value = "tracks", value_parser = parse_search_type)]
    search_type: SearchType,

    /// Only dispatch to resolvers that work without network access
    #[arg(long)]
    only_local: bool,

    /// JSON pipeline config; the flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite index built with build-index
    #[arg(long)]
    index: Option<PathBuf>,

    /// Remote catalog base URL
    #[arg(long)]
    remote: Option<String>,

    /// Resolver script command line (repeatable)
    #[arg(long)]
    script: Vec<String>,

    #[arg(long)]
    workers: Option<usize>,

    /// How long to wait for resolvers before printing what has arrived
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Results to print
    #[arg(long, default_value = "10")]
    limit: usize,

    /// Disable progress bars, log progress lines instead
    #[arg(long)]
    log_only: bool,
}

fn parse_search_type(s: &str) -> Result<SearchType, String> {
    SearchType::ALL
        .into_iter()
        .find(|t| t.as_str() == s.to_lowercase())
        .ok_or_else(|| format!("expected one of tracks, albums, artists (got {:?})", s))
}

fn query_mode(args: &Args) -> Result<QueryMode> {
    let structured = args.track.is_some() || args.album.is_some() || args.artist.is_some();
    match (&args.text, structured) {
        (Some(_), true) => bail!("Give either a free-text query or --track/--album/--artist, not both"),
        (Some(text), false) => Ok(QueryMode::free_text(text.as_str())),
        (None, true) => Ok(QueryMode::structured(
            args.track.as_deref().unwrap_or(""),
            args.album.as_deref().unwrap_or(""),
            args.artist.as_deref().unwrap_or(""),
        )),
        (None, false) => bail!("Nothing to resolve: give a query or --track/--album/--artist"),
    }
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(index) = &args.index {
        config.local_index = Some(index.clone());
    }
    if let Some(base_url) = &args.remote {
        let remote = config.remote.get_or_insert_with(RemoteConfig::default);
        remote.base_url = base_url.clone();
    }
    for line in &args.script {
        let script = ScriptConfig::from_command_line(line)
            .with_context(|| format!("Empty --script command: {:?}", line))?;
        config.scripts.push(script);
    }
    Ok(config)
}

fn print_results(query: &Query, search_type: SearchType, limit: usize) {
    let ranked = query.ranked(search_type);
    if ranked.is_empty() {
        let fallback = query.preferred_track();
        println!("No results. Best guess: {} - {}", fallback.artist.name, fallback.name);
        return;
    }

    println!("\n{:=<80}", "");
    for (rank, candidate) in ranked.iter().take(limit).enumerate() {
        let label = match search_type {
            SearchType::Tracks => format!(
                "{} - {} ({})",
                candidate.artist().name,
                candidate.track.name,
                candidate.album().name
            ),
            SearchType::Albums => format!("{} - {}", candidate.artist().name, candidate.album().name),
            SearchType::Artists => candidate.artist().name.clone(),
        };
        println!(
            "{:>2}. [{:.3}] {:<60} via {}",
            rank + 1,
            candidate.score,
            label,
            candidate.resolver
        );
    }
    println!("{:=<80}", "");
}

fn main() -> Result<()> {
    let args = Args::parse();
    progress::set_log_only(args.log_only);
    progress::init_tracing();

    let mode = query_mode(&args)?;
    let config = load_config(&args)?;
    let pipeline = Pipeline::from_config(&config)?;
    if pipeline.resolvers().is_empty() {
        bail!("No resolvers configured: use --index, --remote, --script or --config");
    }

    let start = Instant::now();
    let request = SearchRequest {
        mode,
        only_local: args.only_local,
        search_type: args.search_type,
    };
    let query = pipeline.search(&request);

    if !progress::watch_query(&query, Duration::from_secs(args.timeout_secs)) {
        let status = query.status();
        warn!(
            query = %query.id(),
            done = status.done,
            todo = status.todo,
            "not every resolver finished; showing partial results"
        );
    }

    print_results(&query, args.search_type, args.limit);
    info!(
        query = %query.id(),
        solved = query.is_solved(),
        elapsed = %format_duration(start.elapsed()),
        "done"
    );
    Ok(())
}
