//! Script resolver: an external process speaking JSON lines.
//!
//! The request is written to the process's stdin as one JSON object:
//!
//! ```text
//! {"qid": 7, "search_type": "tracks", "mode": "free_text", "text": "beatles yesterday"}
//! {"qid": 8, "search_type": "albums", "mode": "structured", "track": "", "album": "Help!", "artist": "The Beatles"}
//! ```
//!
//! and every non-empty stdout line is read back as a `CatalogItem`. A
//! non-zero exit status fails the run. A script still running after its
//! timeout is killed and the run fails with `ResolverError::Timeout`.

use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ResolverError;
use crate::models::{QueryMode, SearchType};
use crate::query::Query;
use crate::remote::{add_catalog_items, CatalogItem};
use crate::resolver::Resolver;

pub const DEFAULT_SCRIPT_PRIORITY: i32 = 10;

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Serialize)]
struct ScriptRequest<'a> {
    qid: u64,
    search_type: SearchType,
    #[serde(flatten)]
    query: &'a QueryMode,
}

pub struct ScriptResolver {
    id: String,
    command: String,
    args: Vec<String>,
    local: bool,
    search_types: Vec<SearchType>,
    priority: i32,
    timeout: Duration,
}

impl ScriptResolver {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            local: false,
            search_types: SearchType::ALL.to_vec(),
            priority: DEFAULT_SCRIPT_PRIORITY,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn search_types(mut self, search_types: &[SearchType]) -> Self {
        self.search_types = search_types.to_vec();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, request: &ScriptRequest<'_>) -> Result<Vec<CatalogItem>, ResolverError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = serde_json::to_vec(request)?;
            line.push(b'\n');
            match stdin.write_all(&line) {
                // Scripts are free to ignore their input
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }

        // Drain both pipes while polling for exit
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    warn!(target: "script", resolver = %self.id, error = %e, "failed to kill script");
                }
                // Reap; the readers are left to finish once the pipes close
                let _ = child.wait();
                return Err(ResolverError::Timeout(self.timeout));
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };

        let stdout = collect(stdout);
        if !status.success() {
            return Err(ResolverError::Script {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&collect(stderr)).trim().to_string(),
            });
        }

        String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(ResolverError::from))
            .collect()
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}

impl Resolver for ScriptResolver {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, search_type: SearchType) -> bool {
        self.search_types.contains(&search_type)
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn resolve(&self, query: &Query, search_type: SearchType) -> Result<usize, ResolverError> {
        if !self.supports(search_type) {
            return Err(ResolverError::Unsupported(search_type));
        }
        let start = Instant::now();
        let request = ScriptRequest {
            qid: query.id().get(),
            search_type,
            query: query.mode(),
        };
        let items = self.run(&request)?;
        let count = add_catalog_items(query, search_type, &self.id, self.local, &items);
        debug!(
            target: "script",
            query = %query.id(),
            resolver = %self.id,
            command = %self.command,
            candidates = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "script finished"
        );
        Ok(count)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(id: &str, script: &str) -> ScriptResolver {
        ScriptResolver::new(id, "sh").args(["-c", script])
    }

    #[test]
    fn test_request_format() {
        let mode = QueryMode::structured("Yesterday", "Help!", "The Beatles");
        let request = ScriptRequest {
            qid: 7,
            search_type: SearchType::Tracks,
            query: &mode,
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(json["qid"], 7);
        assert_eq!(json["search_type"], "tracks");
        assert_eq!(json["mode"], "structured");
        assert_eq!(json["artist"], "The Beatles");
    }

    #[test]
    fn test_reads_json_lines() {
        let resolver = sh(
            "echo",
            r#"cat > /dev/null
echo '{"track": "Yesterday", "album": "Help!", "artist": "The Beatles"}'
echo ''
echo '{"track": "Yesterday", "artist": "Ray Charles"}'"#,
        )
        .local(true);
        let query = Query::free_text("beatles yesterday", true);

        assert_eq!(resolver.resolve(&query, SearchType::Tracks).unwrap(), 2);
        let ranked = query.ranked_track_candidates();
        assert_eq!(ranked[0].track.artist.name, "The Beatles");
        assert!(ranked.iter().all(|c| c.only_local && c.resolver == "echo"));
    }

    #[test]
    fn test_script_sees_request() {
        let resolver = sh(
            "grep",
            r#"read line
case "$line" in
  *'"search_type":"artists"'*'"text":"beatles"'*) echo '{"artist": "The Beatles"}' ;;
esac"#,
        );
        let query = Query::free_text("beatles", false);
        assert_eq!(resolver.resolve(&query, SearchType::Artists).unwrap(), 1);
        assert_eq!(query.artist_results()[0].name, "The Beatles");
    }

    #[test]
    fn test_ignored_stdin_is_fine() {
        let resolver = sh("quiet", "exit 0");
        let query = Query::free_text("x", false);
        assert_eq!(resolver.resolve(&query, SearchType::Tracks).unwrap(), 0);
    }

    #[test]
    fn test_non_zero_exit_is_error() {
        let resolver = sh("fails", "echo boom >&2; exit 3");
        let query = Query::free_text("x", false);
        match resolver.resolve(&query, SearchType::Tracks) {
            Err(ResolverError::Script { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(query.ranked_track_candidates().is_empty());
    }

    #[test]
    fn test_hung_script_times_out() {
        let resolver = sh("hang", "sleep 30").timeout(Duration::from_millis(300));
        let query = Query::free_text("x", false);

        let start = Instant::now();
        let result = resolver.resolve(&query, SearchType::Tracks);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(result, Err(ResolverError::Timeout(t)) if t == Duration::from_millis(300)));
        assert!(query.ranked_track_candidates().is_empty());
    }

    #[test]
    fn test_large_output_within_timeout() {
        let resolver = sh(
            "chatty",
            r#"i=0
while [ $i -lt 2000 ]; do
  echo '{"track": "Yesterday", "artist": "The Beatles"}'
  i=$((i + 1))
done"#,
        )
        .timeout(Duration::from_secs(10));
        let query = Query::free_text("yesterday", false);
        assert_eq!(resolver.resolve(&query, SearchType::Tracks).unwrap(), 2000);
    }

    #[test]
    fn test_bad_output_is_decode_error() {
        let resolver = sh("garbage", "echo 'not json'");
        let query = Query::free_text("x", false);
        assert!(matches!(
            resolver.resolve(&query, SearchType::Tracks),
            Err(ResolverError::Decode(_))
        ));
    }

    #[test]
    fn test_missing_command_is_io_error() {
        let resolver = ScriptResolver::new("missing", "/nonexistent/resolver-script");
        let query = Query::free_text("x", false);
        assert!(matches!(
            resolver.resolve(&query, SearchType::Tracks),
            Err(ResolverError::Io(_))
        ));
    }

    #[test]
    fn test_capabilities() {
        let resolver = ScriptResolver::new("s", "true")
            .search_types(&[SearchType::Albums])
            .priority(70);
        assert!(resolver.supports(SearchType::Albums));
        assert!(!resolver.supports(SearchType::Tracks));
        assert_eq!(Resolver::priority(&resolver), 70);
        assert!(!resolver.is_local());

        let query = Query::free_text("x", false);
        assert!(matches!(
            resolver.resolve(&query, SearchType::Tracks),
            Err(ResolverError::Unsupported(SearchType::Tracks))
        ));
    }
}
