//! The query aggregate.
//!
//! A `Query` holds one search intent and everything resolvers report back for
//! it: three candidate sets (tracks, albums, artists) and the dispatch
//! counters. All mutation goes through a single mutex, so resolvers on
//! different worker threads can call back at any time.
//!
//! ## Solved state
//!
//! A query starts unsolved and becomes solved when a track candidate arrives,
//! or when every dispatched resolver has reported done (`todo > 0 &&
//! done == todo`). Once solved it stays solved.

use crossbeam_channel::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{
    AlbumRef, ArtistRef, Candidate, QueryId, QueryMode, SearchType, SolvedEvent, TrackRef,
};
use crate::normalize::clean_up_string;
use crate::scoring;

// ============================================================================
// Cache Keys
// ============================================================================

/// Key under which identical requests can share one query.
///
/// Free text: the normalized text. Structured: `track+album+artist`.
pub fn cache_key(mode: &QueryMode) -> String {
    match mode {
        QueryMode::FreeText { text } => clean_up_string(text, false),
        QueryMode::Structured {
            track,
            album,
            artist,
        } => format!("{}+{}+{}", track, album, artist),
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Default)]
struct QueryState {
    tracks: Vec<Arc<Candidate>>,
    albums: Vec<Arc<Candidate>>,
    artists: Vec<Arc<Candidate>>,
    todo: usize,
    done: usize,
    solved: bool,
    preferred_index: usize,
}

impl QueryState {
    fn candidates(&self, search_type: SearchType) -> &Vec<Arc<Candidate>> {
        match search_type {
            SearchType::Tracks => &self.tracks,
            SearchType::Albums => &self.albums,
            SearchType::Artists => &self.artists,
        }
    }

    fn candidates_mut(&mut self, search_type: SearchType) -> &mut Vec<Arc<Candidate>> {
        match search_type {
            SearchType::Tracks => &mut self.tracks,
            SearchType::Albums => &mut self.albums,
            SearchType::Artists => &mut self.artists,
        }
    }

    fn is_settled(&self) -> bool {
        self.todo > 0 && self.done == self.todo
    }

    /// Recompute `solved`. Returns true on the unsolved → solved transition.
    fn refresh_solved(&mut self) -> bool {
        if self.solved {
            return false;
        }
        self.solved = !self.tracks.is_empty() || self.is_settled();
        self.solved
    }

    fn ranked(&self, search_type: SearchType) -> Vec<Arc<Candidate>> {
        let mut ranked = self.candidates(search_type).clone();
        // sort_by is stable: equal scores keep insertion order
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}

/// Counters and flag read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStatus {
    pub todo: usize,
    pub done: usize,
    pub solved: bool,
}

// ============================================================================
// Query
// ============================================================================

#[derive(Debug)]
pub struct Query {
    id: QueryId,
    mode: QueryMode,
    only_local: bool,
    state: Mutex<QueryState>,
    settled: Condvar,
    notifiers: Vec<Sender<SolvedEvent>>,
}

impl Query {
    pub fn new(mode: QueryMode, only_local: bool) -> Self {
        Self {
            id: QueryId::next(),
            mode,
            only_local,
            state: Mutex::new(QueryState::default()),
            settled: Condvar::new(),
            notifiers: Vec::new(),
        }
    }

    pub fn free_text(text: impl Into<String>, only_local: bool) -> Self {
        Self::new(QueryMode::free_text(text), only_local)
    }

    pub fn structured(track: &str, album: &str, artist: &str, only_local: bool) -> Self {
        Self::new(QueryMode::structured(track, album, artist), only_local)
    }

    /// Structured query for a known track identity.
    pub fn from_track(track: &TrackRef, only_local: bool) -> Self {
        Self::structured(&track.name, &track.album.name, &track.artist.name, only_local)
    }

    /// Requery a found candidate (e.g. to locate it on other sources).
    pub fn from_candidate(candidate: &Candidate, only_local: bool) -> Self {
        Self::from_track(&candidate.track, only_local)
    }

    /// Send a `SolvedEvent` on `sender` when this query becomes solved.
    pub fn with_notifier(mut self, sender: Sender<SolvedEvent>) -> Self {
        self.notifiers.push(sender);
        self
    }

    pub fn with_notifiers(mut self, senders: impl IntoIterator<Item = Sender<SolvedEvent>>) -> Self {
        self.notifiers.extend(senders);
        self
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn mode(&self) -> &QueryMode {
        &self.mode
    }

    pub fn is_free_text(&self) -> bool {
        self.mode.is_free_text()
    }

    pub fn is_only_local(&self) -> bool {
        self.only_local
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.mode)
    }

    fn lock(&self) -> MutexGuard<'_, QueryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_solved(&self) {
        debug!(target: "query", query = %self.id, "query solved");
        for sender in &self.notifiers {
            // Receivers may be gone; the event is advisory
            let _ = sender.send(SolvedEvent { query_id: self.id });
        }
    }

    // ------------------------------------------------------------------------
    // Mutation (resolver callbacks and dispatcher)
    // ------------------------------------------------------------------------

    /// Append a candidate to the set for `search_type`.
    /// A track candidate solves the query immediately.
    pub fn add_candidate(&self, search_type: SearchType, candidate: impl Into<Arc<Candidate>>) {
        self.add_candidates(search_type, std::iter::once(candidate.into()));
    }

    /// Append candidates in iteration order under a single lock.
    pub fn add_candidates<I, C>(&self, search_type: SearchType, candidates: I)
    where
        I: IntoIterator<Item = C>,
        C: Into<Arc<Candidate>>,
    {
        let transitioned = {
            let mut state = self.lock();
            state
                .candidates_mut(search_type)
                .extend(candidates.into_iter().map(Into::into));
            state.refresh_solved()
        };
        if transitioned {
            self.notify_solved();
        }
    }

    /// One more resolver has been dispatched to this query.
    pub fn increment_todo(&self) {
        let transitioned = {
            let mut state = self.lock();
            state.todo += 1;
            state.refresh_solved()
        };
        if transitioned {
            self.notify_solved();
        }
    }

    /// One dispatched resolver has finished (success, failure or timeout).
    pub fn increment_done(&self) {
        let transitioned = {
            let mut state = self.lock();
            if state.done >= state.todo {
                warn!(
                    target: "query",
                    query = %self.id,
                    todo = state.todo,
                    "done signal without a matching dispatch, ignored"
                );
                return;
            }
            state.done += 1;
            if state.is_settled() {
                self.settled.notify_all();
            }
            state.refresh_solved()
        };
        if transitioned {
            self.notify_solved();
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn status(&self) -> QueryStatus {
        let state = self.lock();
        QueryStatus {
            todo: state.todo,
            done: state.done,
            solved: state.solved,
        }
    }

    pub fn is_solved(&self) -> bool {
        self.lock().solved
    }

    /// Every dispatched resolver has reported done.
    pub fn is_settled(&self) -> bool {
        self.lock().is_settled()
    }

    pub fn todo_count(&self) -> usize {
        self.lock().todo
    }

    pub fn done_count(&self) -> usize {
        self.lock().done
    }

    /// Block until every dispatched resolver has reported done, or `timeout`
    /// passes. Returns whether the query settled.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .settled
            .wait_timeout_while(state, timeout, |s| !s.is_settled())
            .unwrap_or_else(PoisonError::into_inner);
        state.is_settled()
    }

    /// Snapshot of the candidates for `search_type`, best score first.
    pub fn ranked(&self, search_type: SearchType) -> Vec<Arc<Candidate>> {
        self.lock().ranked(search_type)
    }

    pub fn ranked_track_candidates(&self) -> Vec<Arc<Candidate>> {
        self.ranked(SearchType::Tracks)
    }

    pub fn ranked_album_candidates(&self) -> Vec<Arc<Candidate>> {
        self.ranked(SearchType::Albums)
    }

    pub fn ranked_artist_candidates(&self) -> Vec<Arc<Candidate>> {
        self.ranked(SearchType::Artists)
    }

    /// Ranked albums found for this query.
    pub fn album_results(&self) -> Vec<AlbumRef> {
        self.ranked_album_candidates()
            .iter()
            .map(|c| c.track.album.clone())
            .collect()
    }

    /// Ranked artists found for this query.
    pub fn artist_results(&self) -> Vec<ArtistRef> {
        self.ranked_artist_candidates()
            .iter()
            .map(|c| c.track.artist.clone())
            .collect()
    }

    /// One structured query per ranked track candidate.
    pub fn track_queries(&self) -> Vec<Query> {
        self.ranked_track_candidates()
            .iter()
            .map(|c| Query::from_candidate(c, self.only_local))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Preferred result
    // ------------------------------------------------------------------------

    pub fn preferred_index(&self) -> usize {
        self.lock().preferred_index
    }

    /// Pick another ranked track as the chosen one. Out-of-range indices are
    /// accepted and fall back to the requested track on read.
    pub fn set_preferred_index(&self, index: usize) {
        self.lock().preferred_index = index;
    }

    pub fn preferred_candidate(&self) -> Option<Arc<Candidate>> {
        let state = self.lock();
        let index = state.preferred_index;
        state.ranked(SearchType::Tracks).into_iter().nth(index)
    }

    /// The chosen track, or the requested (unresolved) track if there is no
    /// candidate at the preferred index. A free-text query's bare track
    /// carries the raw text as its name.
    pub fn preferred_track(&self) -> TrackRef {
        match self.preferred_candidate() {
            Some(candidate) => candidate.track.clone(),
            None => self.requested_track(),
        }
    }

    fn requested_track(&self) -> TrackRef {
        match &self.mode {
            QueryMode::FreeText { text } => TrackRef::named(text, "", ""),
            QueryMode::Structured {
                track,
                album,
                artist,
            } => TrackRef::named(track, album, artist),
        }
    }

    pub fn display_name(&self) -> String {
        self.preferred_track().name
    }

    pub fn display_artist(&self) -> ArtistRef {
        self.preferred_track().artist
    }

    pub fn display_album(&self) -> AlbumRef {
        self.preferred_track().album
    }

    // ------------------------------------------------------------------------
    // Scoring
    // ------------------------------------------------------------------------

    /// How well `candidate` matches this query's terms (0..1).
    pub fn similarity_of(&self, candidate: &Candidate, search_type: SearchType) -> f64 {
        scoring::similarity(&self.mode, candidate, search_type)
    }
}

// ============================================================================
// TESTS
// ============================================================================
