//! Resolver failure taxonomy.
//!
//! These errors stop at the dispatch boundary: the pipeline logs them and
//! counts the resolver as done. Nothing here reaches a `Query`.

use std::time::Duration;
use thiserror::Error;

use crate::models::SearchType;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("local index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("script exited with {status}: {stderr}")]
    Script { status: String, stderr: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unsupported search type: {0}")]
    Unsupported(SearchType),
}
