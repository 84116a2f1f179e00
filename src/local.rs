//! Local index resolver.
//!
//! Tracks live in a SQLite database with an FTS5 table for free-text
//! matching and folded key columns for structured lookups.
//!
//! ```sql
//! CREATE TABLE tracks (
//!     id          INTEGER PRIMARY KEY,
//!     title       TEXT NOT NULL,
//!     artist      TEXT NOT NULL,
//!     album       TEXT,
//!     title_norm  TEXT NOT NULL,
//!     artist_norm TEXT NOT NULL,
//!     album_norm  TEXT NOT NULL
//! );
//! CREATE VIRTUAL TABLE tracks_fts USING fts5(title, artist, album);
//! ```

use rusqlite::{params, Connection};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

use crate::error::ResolverError;
use crate::models::{AlbumRef, ArtistRef, Candidate, QueryMode, SearchType, TrackRef};
use crate::normalize::{clean_up_string, index_key};
use crate::query::Query;
use crate::resolver::Resolver;

/// Rows fetched per lookup before scoring
pub const DEFAULT_LIMIT: usize = 100;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tracks (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        artist TEXT NOT NULL,
        album TEXT,
        title_norm TEXT NOT NULL,
        artist_norm TEXT NOT NULL,
        album_norm TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tracks_title_norm ON tracks(title_norm);
    CREATE INDEX IF NOT EXISTS idx_tracks_artist_norm ON tracks(artist_norm);
    CREATE INDEX IF NOT EXISTS idx_tracks_album_norm ON tracks(album_norm);
    CREATE VIRTUAL TABLE IF NOT EXISTS tracks_fts USING fts5(title, artist, album);
";

// ============================================================================
// Index Records
// ============================================================================

/// A track as imported into the index (one JSON line in `build-index` input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTrack {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
}

impl IndexedTrack {
    pub fn new(title: &str, artist: &str, album: Option<&str>) -> Self {
        Self {
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.map(str::to_string),
        }
    }

    /// Precompute lookup keys (done in parallel by `build-index`).
    pub fn keyed(self) -> KeyedTrack {
        KeyedTrack {
            title_norm: index_key(&self.title),
            artist_norm: index_key(&self.artist),
            album_norm: self.album.as_deref().map(index_key).unwrap_or_default(),
            track: self,
        }
    }
}

/// Track with its normalized lookup keys.
#[derive(Debug, Clone)]
pub struct KeyedTrack {
    pub track: IndexedTrack,
    pub title_norm: String,
    pub artist_norm: String,
    pub album_norm: String,
}

#[derive(Debug, Clone)]
struct IndexRow {
    id: i64,
    title: String,
    artist: String,
    album: Option<String>,
}

impl IndexRow {
    fn track_ref(&self) -> TrackRef {
        let mut track = TrackRef::named(&self.title, self.album.as_deref().unwrap_or(""), &self.artist);
        track.id = Some(self.id.to_string());
        track
    }
}

// ============================================================================
// Index
// ============================================================================

pub struct LocalIndex {
    conn: Mutex<Connection>,
}

impl LocalIndex {
    /// Open (creating if needed) an on-disk index.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, track: IndexedTrack) -> rusqlite::Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let id = insert_keyed(&tx, &track.keyed())?;
        tx.commit()?;
        Ok(id)
    }

    /// Insert a batch in one transaction. Returns the number of rows written.
    pub fn insert_batch(&self, tracks: &[KeyedTrack]) -> rusqlite::Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for keyed in tracks {
            insert_keyed(&tx, keyed)?;
        }
        tx.commit()?;
        Ok(tracks.len())
    }

    /// Merge FTS segments and refresh planner statistics after a bulk import.
    pub fn optimize(&self) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute("INSERT INTO tracks_fts(tracks_fts) VALUES('optimize')", [])?;
        conn.execute_batch("ANALYZE;")
    }

    pub fn len(&self) -> rusqlite::Result<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> rusqlite::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn search_free_text(&self, text: &str, limit: usize) -> rusqlite::Result<Vec<IndexRow>> {
        let Some(expr) = fts_expression(text) else {
            return Ok(Vec::new());
        };
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT t.id, t.title, t.artist, t.album
             FROM tracks_fts fts
             JOIN tracks t ON fts.rowid = t.id
             WHERE tracks_fts MATCH ?1
             ORDER BY fts.rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![expr, limit as i64], read_row)?;
        rows.collect()
    }

    fn search_structured(
        &self,
        search_type: SearchType,
        track: &str,
        album: &str,
        artist: &str,
        limit: usize,
    ) -> rusqlite::Result<Vec<IndexRow>> {
        let limit = limit as i64;
        let (track_key, album_key, artist_key) = (index_key(track), index_key(album), index_key(artist));
        match search_type {
            SearchType::Tracks => self.select_rows(
                "SELECT id, title, artist, album FROM tracks
                 WHERE title_norm = ?1
                 ORDER BY id LIMIT ?2",
                &track_key,
                params![track_key, limit],
            ),
            SearchType::Albums => self.select_rows(
                "SELECT id, title, artist, album FROM tracks
                 WHERE album_norm = ?1 AND (?2 = '' OR artist_norm = ?2)
                 ORDER BY id LIMIT ?3",
                &album_key,
                params![album_key, artist_key, limit],
            ),
            SearchType::Artists => self.select_rows(
                "SELECT id, title, artist, album FROM tracks
                 WHERE artist_norm = ?1
                 ORDER BY id LIMIT ?2",
                &artist_key,
                params![artist_key, limit],
            ),
        }
    }

    /// Run a structured lookup; an empty primary key matches nothing.
    fn select_rows(
        &self,
        sql: &str,
        primary_key: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> rusqlite::Result<Vec<IndexRow>> {
        if primary_key.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, read_row)?;
        rows.collect()
    }
}

fn insert_keyed(conn: &Connection, keyed: &KeyedTrack) -> rusqlite::Result<i64> {
    let track = &keyed.track;
    conn.prepare_cached(
        "INSERT INTO tracks (title, artist, album, title_norm, artist_norm, album_norm)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        track.title,
        track.artist,
        track.album,
        keyed.title_norm,
        keyed.artist_norm,
        keyed.album_norm,
    ])?;
    let id = conn.last_insert_rowid();
    conn.prepare_cached("INSERT INTO tracks_fts (rowid, title, artist, album) VALUES (?1, ?2, ?3, ?4)")?
        .execute(params![id, track.title, track.artist, track.album.as_deref().unwrap_or("")])?;
    Ok(id)
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexRow> {
    Ok(IndexRow {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        album: row.get(3)?,
    })
}

/// FTS5 expression: every query word as a quoted prefix term, all required.
/// "Beatles  Yest" → `"beatles"* "yest"*`
fn fts_expression(text: &str) -> Option<String> {
    let cleaned = clean_up_string(text, false);
    let terms: Vec<String> = cleaned
        .split(' ')
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{}\"*", word.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct LocalIndexResolver {
    id: String,
    index: Arc<LocalIndex>,
    limit: usize,
}

impl LocalIndexResolver {
    pub fn new(id: impl Into<String>, index: Arc<LocalIndex>) -> Self {
        Self {
            id: id.into(),
            index,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn candidates(&self, rows: &[IndexRow], search_type: SearchType) -> Vec<Candidate> {
        let refs: Vec<TrackRef> = match search_type {
            SearchType::Tracks => rows.iter().map(IndexRow::track_ref).collect(),
            SearchType::Albums => {
                let mut seen = FxHashSet::default();
                rows.iter()
                    .filter_map(|row| {
                        let album = row.album.as_deref().filter(|a| !a.is_empty())?;
                        seen.insert((index_key(album), index_key(&row.artist)))
                            .then(|| album_ref(album, &row.artist))
                    })
                    .collect()
            }
            SearchType::Artists => {
                let mut seen = FxHashSet::default();
                rows.iter()
                    .filter(|row| seen.insert(index_key(&row.artist)))
                    .map(|row| artist_ref(&row.artist))
                    .collect()
            }
        };

        refs.into_iter()
            .map(|track| Candidate::new(track, self.id.clone()).local(true))
            .collect()
    }
}

fn album_ref(album: &str, artist: &str) -> TrackRef {
    let artist = ArtistRef {
        name: artist.to_string(),
        id: None,
    };
    TrackRef {
        album: AlbumRef {
            name: album.to_string(),
            id: None,
            artist: artist.clone(),
        },
        artist,
        ..TrackRef::default()
    }
}

fn artist_ref(artist: &str) -> TrackRef {
    TrackRef {
        artist: ArtistRef {
            name: artist.to_string(),
            id: None,
        },
        ..TrackRef::default()
    }
}

impl Resolver for LocalIndexResolver {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, _search_type: SearchType) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        true
    }

    fn resolve(&self, query: &Query, search_type: SearchType) -> Result<usize, ResolverError> {
        let start = Instant::now();
        let rows = match query.mode() {
            QueryMode::FreeText { text } => self.index.search_free_text(text, self.limit)?,
            QueryMode::Structured {
                track,
                album,
                artist,
            } => self
                .index
                .search_structured(search_type, track, album, artist, self.limit)?,
        };

        let scored: Vec<Candidate> = self
            .candidates(&rows, search_type)
            .into_iter()
            .map(|c| {
                let score = query.similarity_of(&c, search_type);
                c.with_score(score)
            })
            .collect();
        let count = scored.len();
        query.add_candidates(search_type, scored);

        debug!(
            target: "local",
            query = %query.id(),
            rows = rows.len(),
            candidates = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "local index lookup"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OptionalExtension;

    fn title_of(index: &LocalIndex, id: i64) -> Option<String> {
        index
            .lock()
            .query_row("SELECT title FROM tracks WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .unwrap()
    }

    fn sample_index() -> Arc<LocalIndex> {
        let index = LocalIndex::open_in_memory().unwrap();
        let tracks = vec![
            IndexedTrack::new("Yesterday", "The Beatles", Some("Help!")),
            IndexedTrack::new("Help!", "The Beatles", Some("Help!")),
            IndexedTrack::new("Let It Be", "The Beatles", Some("Let It Be")),
            IndexedTrack::new("Yesterday", "Ray Charles", None),
            IndexedTrack::new("Paint It Black", "The Rolling Stones", Some("Aftermath")),
        ];
        let keyed: Vec<KeyedTrack> = tracks.into_iter().map(IndexedTrack::keyed).collect();
        assert_eq!(index.insert_batch(&keyed).unwrap(), 5);
        Arc::new(index)
    }

    #[test]
    fn test_fts_expression() {
        assert_eq!(fts_expression("  Beatles  Yest "), Some("\"beatles\"* \"yest\"*".to_string()));
        assert_eq!(fts_expression("say \"hi\""), Some("\"say\"* \"\"\"hi\"\"\"*".to_string()));
        assert_eq!(fts_expression("   "), None);
        assert_eq!(fts_expression("- &"), None);
    }

    #[test]
    fn test_free_text_track_search() {
        let resolver = LocalIndexResolver::new("local", sample_index());
        let query = Query::free_text("beatles yesterday", true);

        let added = resolver.resolve(&query, SearchType::Tracks).unwrap();
        assert_eq!(added, 1);

        let ranked = query.ranked_track_candidates();
        assert_eq!(ranked[0].track.name, "Yesterday");
        assert_eq!(ranked[0].track.artist.name, "The Beatles");
        assert_eq!(ranked[0].resolver, "local");
        assert!(ranked[0].only_local);
        assert!(ranked[0].score >= 0.9);
        assert!(query.is_solved());
    }

    #[test]
    fn test_prefix_match() {
        let resolver = LocalIndexResolver::new("local", sample_index());
        let query = Query::free_text("yest", true);
        assert_eq!(resolver.resolve(&query, SearchType::Tracks).unwrap(), 2);
    }

    #[test]
    fn test_structured_track_search_ranks_by_similarity() {
        let resolver = LocalIndexResolver::new("local", sample_index());
        let query = Query::structured("yesterday", "Help!", "Beatles", false);

        assert_eq!(resolver.resolve(&query, SearchType::Tracks).unwrap(), 2);
        let ranked = query.ranked_track_candidates();
        assert_eq!(ranked[0].track.artist.name, "The Beatles");
        assert_eq!(ranked[1].track.artist.name, "Ray Charles");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_album_search_dedups() {
        let resolver = LocalIndexResolver::new("local", sample_index());
        let query = Query::free_text("beatles", true);

        assert_eq!(resolver.resolve(&query, SearchType::Albums).unwrap(), 2);
        let albums: Vec<String> = query.album_results().into_iter().map(|a| a.name).collect();
        assert!(albums.contains(&"Help!".to_string()));
        assert!(albums.contains(&"Let It Be".to_string()));
        // Album candidates alone do not solve
        assert!(!query.is_solved());
    }

    #[test]
    fn test_structured_album_search() {
        let resolver = LocalIndexResolver::new("local", sample_index());
        let query = Query::structured("", "help!", "the beatles", true);
        assert_eq!(resolver.resolve(&query, SearchType::Albums).unwrap(), 1);
        assert_eq!(query.album_results()[0].artist.name, "The Beatles");
    }

    #[test]
    fn test_artist_search_dedups() {
        let resolver = LocalIndexResolver::new("local", sample_index());
        let query = Query::structured("", "", "The Beatles", true);
        assert_eq!(resolver.resolve(&query, SearchType::Artists).unwrap(), 1);
        assert_eq!(query.artist_results()[0].name, "The Beatles");
    }

    #[test]
    fn test_no_match_adds_nothing() {
        let resolver = LocalIndexResolver::new("local", sample_index());
        let query = Query::free_text("metallica", true);
        assert_eq!(resolver.resolve(&query, SearchType::Tracks).unwrap(), 0);
        assert!(query.ranked_track_candidates().is_empty());
    }

    #[test]
    fn test_on_disk_index_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sqlite3");
        {
            let index = LocalIndex::open(&path).unwrap();
            let id = index
                .insert(IndexedTrack::new("Yesterday", "The Beatles", None))
                .unwrap();
            assert_eq!(title_of(&index, id).as_deref(), Some("Yesterday"));
            assert_eq!(title_of(&index, id + 1), None);
        }
        let reopened = LocalIndex::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
        assert!(!reopened.is_empty().unwrap());
    }

    #[test]
    fn test_batch_insert_then_optimize() {
        let index = LocalIndex::open_in_memory().unwrap();
        let batch: Vec<KeyedTrack> = vec![
            IndexedTrack::new("Yesterday", "The Beatles", Some("Help!")).keyed(),
            IndexedTrack::new("Hey Jude", "The Beatles", None).keyed(),
        ];
        assert_eq!(batch[0].artist_norm, "beatles");
        assert_eq!(batch[1].album_norm, "");

        assert_eq!(index.insert_batch(&batch).unwrap(), 2);
        index.optimize().unwrap();
        assert_eq!(index.len().unwrap(), 2);

        let resolver = LocalIndexResolver::new("local", Arc::new(index));
        let query = Query::free_text("hey jude", true);
        assert_eq!(resolver.resolve(&query, SearchType::Tracks).unwrap(), 1);
    }
}
