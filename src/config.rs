//! Pipeline configuration, loaded from an optional JSON file.
//!
//! ```json
//! {
//!   "workers": 8,
//!   "reuse_queries": true,
//!   "local_index": "tracks.sqlite3",
//!   "remote": {"base_url": "https://catalog.example.com/api", "min_score": 5.0},
//!   "scripts": [{"name": "bandcamp", "command": "./bandcamp.py", "search_types": ["tracks"]}]
//! }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::SearchType;
use crate::pipeline::DEFAULT_CACHE_CAPACITY;
use crate::remote::{Session, DEFAULT_MIN_SCORE, DEFAULT_TIMEOUT};
use crate::script::{DEFAULT_SCRIPT_PRIORITY, DEFAULT_SCRIPT_TIMEOUT};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads for resolver jobs (0 = one per CPU)
    pub workers: usize,
    /// Hand back the existing query for a repeated request instead of dispatching again
    pub reuse_queries: bool,
    /// Cached queries kept before settled ones are evicted
    pub cache_capacity: usize,
    pub local_index: Option<PathBuf>,
    pub remote: Option<RemoteConfig>,
    pub scripts: Vec<ScriptConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            reuse_queries: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            local_index: None,
            remote: None,
            scripts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub min_score: f64,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            min_score: DEFAULT_MIN_SCORE,
            user_id: None,
            access_token: None,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn session(&self) -> Session {
        Session {
            user_id: self.user_id.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub local: bool,
    pub search_types: Vec<SearchType>,
    pub priority: i32,
    /// The script is killed if it runs longer than this
    pub timeout_secs: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            local: false,
            search_types: SearchType::ALL.to_vec(),
            priority: DEFAULT_SCRIPT_PRIORITY,
            timeout_secs: DEFAULT_SCRIPT_TIMEOUT.as_secs(),
        }
    }
}

impl ScriptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Config for a bare command line as given on the CLI (`--script "cmd arg"`).
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let command = parts.next()?;
        let name = Path::new(&command)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.clone());
        Some(Self {
            name,
            command,
            args: parts.collect(),
            ..Self::default()
        })
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
