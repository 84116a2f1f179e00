//! Remote catalog resolver.
//!
//! `RemoteResolver` works over any `CatalogClient`; `HttpCatalogClient` is
//! the HTTP implementation:
//!
//! ```text
//! GET {base_url}/search?type=tracks&q=beatles+yesterday
//! GET {base_url}/search?type=tracks&track=Yesterday&album=Help!&artist=The+Beatles
//! Authorization: Bearer <token>          (when the session has one)
//!
//! {"items": [{"track": "...", "album": "...", "artist": "...", "score": 12.5}]}
//! ```
//!
//! Session state is owned by the caller and passed in explicitly.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::ResolverError;
use crate::models::{AlbumRef, ArtistRef, Candidate, QueryMode, SearchType, TrackRef};
use crate::query::Query;
use crate::resolver::Resolver;

/// Items the service scores below this are dropped before similarity scoring
pub const DEFAULT_MIN_SCORE: f64 = 5.0;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Session
// ============================================================================

/// Authenticated user context for catalog requests.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub user_id: Option<String>,
    pub access_token: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ============================================================================
// Catalog Items
// ============================================================================

/// One search hit as reported by a catalog (or a script resolver).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogItem {
    pub track: String,
    pub album: String,
    pub artist: String,
    pub track_id: Option<String>,
    pub album_id: Option<String>,
    pub artist_id: Option<String>,
    /// Raw relevance on the source's own scale
    pub score: Option<f64>,
}

impl CatalogItem {
    /// Entity reference for `search_type`; `None` if the item lacks the entity.
    pub fn to_track_ref(&self, search_type: SearchType) -> Option<TrackRef> {
        let artist = ArtistRef {
            name: self.artist.clone(),
            id: self.artist_id.clone(),
        };
        let album = AlbumRef {
            name: self.album.clone(),
            id: self.album_id.clone(),
            artist: artist.clone(),
        };
        match search_type {
            SearchType::Tracks if !self.track.is_empty() => Some(TrackRef {
                name: self.track.clone(),
                id: self.track_id.clone(),
                album,
                artist,
            }),
            SearchType::Albums if !self.album.is_empty() => Some(TrackRef {
                album,
                artist,
                ..TrackRef::default()
            }),
            SearchType::Artists if !self.artist.is_empty() => Some(TrackRef {
                artist,
                ..TrackRef::default()
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<CatalogItem>,
}

pub fn parse_search_response(body: &str) -> Result<Vec<CatalogItem>, ResolverError> {
    let response: SearchResponse = serde_json::from_str(body)?;
    Ok(response.items)
}

/// Score catalog items against `query` and add them. Shared by the remote
/// and script resolvers.
pub(crate) fn add_catalog_items(
    query: &Query,
    search_type: SearchType,
    resolver_id: &str,
    only_local: bool,
    items: &[CatalogItem],
) -> usize {
    let candidates: Vec<Candidate> = items
        .iter()
        .filter_map(|item| item.to_track_ref(search_type))
        .map(|track| {
            let candidate = Candidate::new(track, resolver_id).local(only_local);
            let score = query.similarity_of(&candidate, search_type);
            candidate.with_score(score)
        })
        .collect();
    let count = candidates.len();
    query.add_candidates(search_type, candidates);
    count
}

// ============================================================================
// Catalog Client
// ============================================================================

pub trait CatalogClient: Send + Sync {
    fn search(
        &self,
        session: &Session,
        mode: &QueryMode,
        search_type: SearchType,
    ) -> Result<Vec<CatalogItem>, ResolverError>;
}

pub struct HttpCatalogClient {
    base_url: String,
    client: Client,
}

impl HttpCatalogClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ResolverError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn search_url(&self) -> String {
        format!("{}/search", self.base_url)
    }
}

/// Query-string parameters for a search request.
pub fn search_params(
    session: &Session,
    mode: &QueryMode,
    search_type: SearchType,
) -> Vec<(&'static str, String)> {
    let mut params = vec![("type", search_type.as_str().to_string())];
    match mode {
        QueryMode::FreeText { text } => params.push(("q", text.clone())),
        QueryMode::Structured {
            track,
            album,
            artist,
        } => {
            params.push(("track", track.clone()));
            params.push(("album", album.clone()));
            params.push(("artist", artist.clone()));
        }
    }
    if let Some(user_id) = &session.user_id {
        params.push(("user", user_id.clone()));
    }
    params
}

impl CatalogClient for HttpCatalogClient {
    fn search(
        &self,
        session: &Session,
        mode: &QueryMode,
        search_type: SearchType,
    ) -> Result<Vec<CatalogItem>, ResolverError> {
        let mut request = self
            .client
            .get(self.search_url())
            .query(&search_params(session, mode, search_type));
        if let Some(token) = &session.access_token {
            request = request.bearer_auth(token);
        }
        let body = request.send()?.error_for_status()?.text()?;
        parse_search_response(&body)
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct RemoteResolver<C> {
    id: String,
    client: C,
    session: Session,
    min_score: f64,
}

impl<C: CatalogClient> RemoteResolver<C> {
    pub fn new(id: impl Into<String>, client: C, session: Session) -> Self {
        Self {
            id: id.into(),
            client,
            session,
            min_score: DEFAULT_MIN_SCORE,
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }
}

impl<C: CatalogClient> Resolver for RemoteResolver<C> {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, _search_type: SearchType) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        false
    }

    fn resolve(&self, query: &Query, search_type: SearchType) -> Result<usize, ResolverError> {
        let start = Instant::now();
        let items = self.client.search(&self.session, query.mode(), search_type)?;
        let total = items.len();
        let kept: Vec<CatalogItem> = items
            .into_iter()
            .filter(|item| item.score.map_or(true, |s| s >= self.min_score))
            .collect();

        let count = add_catalog_items(query, search_type, &self.id, false, &kept);
        debug!(
            target: "remote",
            query = %query.id(),
            resolver = %self.id,
            items = total,
            below_min_score = total - kept.len(),
            candidates = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "catalog search"
        );
        Ok(count)
    }
}
