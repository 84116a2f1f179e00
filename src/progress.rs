//! Progress bar and logging utilities.
//!
//! Provides helpers for creating progress bars and spinners, with support
//! for log-only mode where progress bars are hidden for tail-friendly output.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::query::Query;

/// Global flag for log-only mode (set from args in main)
pub static LOG_ONLY: AtomicBool = AtomicBool::new(false);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Install the stderr log subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

pub fn set_log_only(value: bool) {
    LOG_ONLY.store(value, Ordering::Relaxed);
}

pub fn is_log_only() -> bool {
    LOG_ONLY.load(Ordering::Relaxed)
}

/// Format duration in human-readable format
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", d.as_millis())
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.1}m", secs / 60.0)
    }
}

/// Create a progress bar with consistent styling.
/// In log-only mode, the progress bar is hidden.
pub fn create_progress_bar(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if is_log_only() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")
                .unwrap()
                .progress_chars("=> "),
        );
    }
    pb.set_message(msg.to_string());
    pb
}

/// Log progress periodically for tail-friendly output.
/// Only logs when in log-only mode and at specified intervals.
pub fn log_progress(phase: &str, current: u64, total: u64, interval: u64) {
    if is_log_only() && total > 0 && (current % interval.max(1) == 0 || current == total) {
        let pct = 100.0 * current as f64 / total as f64;
        info!(target: "progress", "[{}] {}/{} ({:.1}%)", phase, current, total, pct);
    }
}

/// Create a spinner for indeterminate progress.
/// In log-only mode, the spinner is hidden.
pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if is_log_only() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{msg} {spinner} [{elapsed_precise}]")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
    }
    pb.set_message(msg.to_string());
    pb
}

/// Block until `query` settles or `timeout` passes, showing resolvers
/// done out of dispatched. Returns whether the query settled.
pub fn watch_query(query: &Query, timeout: Duration) -> bool {
    let status = query.status();
    if status.todo == 0 {
        return false;
    }

    let pb = create_progress_bar(status.todo as u64, "Resolving");
    let deadline = Instant::now() + timeout;
    let mut last_done = usize::MAX;
    let settled = loop {
        let status = query.status();
        if status.done != last_done {
            last_done = status.done;
            pb.set_length(status.todo as u64);
            pb.set_position(status.done as u64);
            log_progress("Resolving", status.done as u64, status.todo as u64, 1);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break query.is_settled();
        }
        if query.wait_settled(remaining.min(POLL_INTERVAL)) {
            let status = query.status();
            pb.set_position(status.done as u64);
            if status.done != last_done {
                log_progress("Resolving", status.done as u64, status.todo as u64, 1);
            }
            break true;
        }
    };

    if settled {
        pb.finish_with_message("Resolved");
    } else {
        pb.abandon_with_message("Timed out");
    }
    settled
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(12)), "12.0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.5m");
    }

    #[test]
    fn test_watch_query_settles() {
        set_log_only(true);
        let query = Arc::new(Query::free_text("x", false));
        query.increment_todo();
        query.increment_todo();

        let worker = {
            let query = Arc::clone(&query);
            thread::spawn(move || {
                query.increment_done();
                thread::sleep(Duration::from_millis(50));
                query.increment_done();
            })
        };

        assert!(watch_query(&query, Duration::from_secs(10)));
        worker.join().unwrap();
        assert_eq!(query.done_count(), 2);
    }

    #[test]
    fn test_watch_query_times_out() {
        set_log_only(true);
        let query = Query::free_text("x", false);
        query.increment_todo();
        assert!(!watch_query(&query, Duration::from_millis(150)));
        assert!(!watch_query(&Query::free_text("y", false), Duration::from_secs(1)));
    }
}
