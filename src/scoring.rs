//! Similarity scoring between a query and a candidate.
//!
//! This module contains:
//! - Edit-distance similarity for single fields
//! - Structured scoring (weighted artist/album/track agreement)
//! - Free-text scoring (best composite string, substring floor)
//!
//! Every score is in `0.0..=1.0`.

use crate::models::{Candidate, QueryMode, SearchType};
use crate::normalize::clean_up_string;

// ============================================================================
// Weights & Floors
// ============================================================================

pub const ARTIST_WEIGHT: f64 = 4.0;
pub const ALBUM_WEIGHT: f64 = 1.0;
pub const TRACK_WEIGHT: f64 = 5.0;

/// Free-text score when a composite string contains the whole query
pub const SUBSTRING_FLOOR: f64 = 0.9;

// ============================================================================
// Edit Distance
// ============================================================================

/// Levenshtein distance counted in chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    strsim::levenshtein(a, b)
}

/// `(maxLen - distance) / maxLen` over already-normalized strings.
/// Two empty strings are identical (1.0); exactly one empty scores 0.0.
pub fn field_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(a, b).min(max_len);
    (max_len - distance) as f64 / max_len as f64
}

// ============================================================================
// Candidate Fields
// ============================================================================

/// Candidate names after normalization (article kept).
struct CandidateFields {
    artist: String,
    album: String,
    track: String,
}

impl CandidateFields {
    fn of(candidate: &Candidate) -> Self {
        Self {
            artist: clean_up_string(&candidate.track.artist.name, false),
            album: clean_up_string(&candidate.track.album.name, false),
            track: clean_up_string(&candidate.track.name, false),
        }
    }

    /// Composite comparison strings for free-text search.
    fn composites(&self, search_type: SearchType) -> Vec<String> {
        match search_type {
            SearchType::Tracks => vec![
                clean_up_string(&format!("{} {}", self.artist, self.track), false),
                self.track.clone(),
            ],
            SearchType::Artists => vec![self.artist.clone()],
            SearchType::Albums if !self.album.is_empty() => vec![
                clean_up_string(&format!("{} {}", self.artist, self.album), false),
                self.album.clone(),
            ],
            SearchType::Albums => Vec::new(),
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Score `candidate` against the query terms for `search_type`.
pub fn similarity(mode: &QueryMode, candidate: &Candidate, search_type: SearchType) -> f64 {
    let fields = CandidateFields::of(candidate);
    let score = match mode {
        QueryMode::Structured {
            track,
            album,
            artist,
        } => structured_score(track, album, artist, &fields),
        QueryMode::FreeText { text } => free_text_score(text, &fields, search_type),
    };
    score.clamp(0.0, 1.0)
}

fn structured_score(track: &str, album: &str, artist: &str, fields: &CandidateFields) -> f64 {
    let artist_sim = field_similarity(&clean_up_string(artist, false), &fields.artist);
    let track_sim = field_similarity(&clean_up_string(track, false), &fields.track);

    // Empty query album is neutral
    let query_album = clean_up_string(album, false);
    let album_sim = if query_album.is_empty() {
        1.0
    } else {
        field_similarity(&query_album, &fields.album)
    };

    (artist_sim * ARTIST_WEIGHT + album_sim * ALBUM_WEIGHT + track_sim * TRACK_WEIGHT)
        / (ARTIST_WEIGHT + ALBUM_WEIGHT + TRACK_WEIGHT)
}

fn free_text_score(text: &str, fields: &CandidateFields, search_type: SearchType) -> f64 {
    let query = clean_up_string(text, false);

    let artist_sim = field_similarity(&query, &fields.artist);
    let track_sim = field_similarity(&query, &fields.track);
    let album_sim = if fields.album.is_empty() {
        0.0
    } else {
        field_similarity(&query, &fields.album)
    };
    let field_best = artist_sim.max(album_sim).max(track_sim);

    fields
        .composites(search_type)
        .iter()
        .map(|composite| {
            let mut score = field_best.max(field_similarity(&query, composite));
            if composite.contains(query.as_str()) {
                score = score.max(SUBSTRING_FLOOR);
            }
            score
        })
        .fold(0.0, f64::max)
}

// ============================================================================
// TESTS
// ============================================================================
