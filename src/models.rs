//! Core data models for query resolution.
//!
//! This module contains the entity references, candidates, and query terms
//! shared by the scorer, the query aggregate, resolvers and the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Search Types
// ============================================================================

/// Which entity kind a search (or a candidate set) is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Tracks,
    Albums,
    Artists,
}

impl SearchType {
    pub const ALL: [SearchType; 3] = [SearchType::Tracks, SearchType::Albums, SearchType::Artists];

    pub fn as_str(self) -> &'static str {
        match self {
            SearchType::Tracks => "tracks",
            SearchType::Albums => "albums",
            SearchType::Artists => "artists",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entity References
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtistRef {
    pub name: String,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlbumRef {
    pub name: String,
    pub id: Option<String>,
    /// Album artist (may differ from a track's performing artist on compilations)
    pub artist: ArtistRef,
}

/// Track identity: names and optional source ids for track, album and artist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackRef {
    pub name: String,
    pub id: Option<String>,
    pub album: AlbumRef,
    pub artist: ArtistRef,
}

impl TrackRef {
    /// Build a bare (unresolved) track from plain names.
    pub fn named(track: &str, album: &str, artist: &str) -> Self {
        let artist = ArtistRef {
            name: artist.to_string(),
            id: None,
        };
        Self {
            name: track.to_string(),
            id: None,
            album: AlbumRef {
                name: album.to_string(),
                id: None,
                artist: artist.clone(),
            },
            artist,
        }
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// A single playable match reported by a resolver.
///
/// Immutable once built: the builder methods consume `self`, and a query
/// stores candidates behind `Arc` after they are added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub track: TrackRef,
    /// Id of the resolver that produced this candidate
    pub resolver: String,
    /// Resolver-assigned relevance. Only comparable across resolvers when
    /// every resolver scores with `Query::similarity_of` (0..1).
    pub score: f64,
    pub only_local: bool,
}

impl Candidate {
    pub fn new(track: TrackRef, resolver: impl Into<String>) -> Self {
        Self {
            track,
            resolver: resolver.into(),
            score: 0.0,
            only_local: false,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn local(mut self, only_local: bool) -> Self {
        self.only_local = only_local;
        self
    }

    pub fn artist(&self) -> &ArtistRef {
        &self.track.artist
    }

    pub fn album(&self) -> &AlbumRef {
        &self.track.album
    }
}

// ============================================================================
// Query Identity & Terms
// ============================================================================

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(u64);

impl QueryId {
    pub fn next() -> Self {
        QueryId(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// What the user asked for: free text, or explicit track/album/artist names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueryMode {
    FreeText {
        text: String,
    },
    Structured {
        track: String,
        album: String,
        artist: String,
    },
}

impl QueryMode {
    pub fn free_text(text: impl Into<String>) -> Self {
        QueryMode::FreeText { text: text.into() }
    }

    pub fn structured(
        track: impl Into<String>,
        album: impl Into<String>,
        artist: impl Into<String>,
    ) -> Self {
        QueryMode::Structured {
            track: track.into(),
            album: album.into(),
            artist: artist.into(),
        }
    }

    pub fn is_free_text(&self) -> bool {
        matches!(self, QueryMode::FreeText { .. })
    }
}

/// Raised once when a query flips from unsolved to solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolvedEvent {
    pub query_id: QueryId,
}
