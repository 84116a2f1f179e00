//! Query dispatch.
//!
//! The pipeline holds the resolver registry (kept sorted by descending
//! priority, ties in registration order) and a worker pool. `dispatch`
//! counts every eligible resolver into the query's `todo` before handing any
//! of them to the pool, so a fast resolver can never settle the query while
//! slower ones are still being scheduled. Every job runs under a
//! `CompletionGuard` and `catch_unwind`: errors and panics are logged, and
//! the job still counts as done.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::local::{LocalIndex, LocalIndexResolver};
use crate::models::{QueryMode, SearchType, SolvedEvent};
use crate::query::Query;
use crate::remote::{HttpCatalogClient, RemoteResolver};
use crate::resolver::{CompletionGuard, Resolver};
use crate::script::ScriptResolver;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub mode: QueryMode,
    pub only_local: bool,
    pub search_type: SearchType,
}

impl SearchRequest {
    pub fn free_text(text: impl Into<String>, search_type: SearchType) -> Self {
        Self {
            mode: QueryMode::free_text(text),
            only_local: false,
            search_type,
        }
    }

    pub fn structured(track: &str, album: &str, artist: &str, search_type: SearchType) -> Self {
        Self {
            mode: QueryMode::structured(track, album, artist),
            only_local: false,
            search_type,
        }
    }

    pub fn only_local(mut self, only_local: bool) -> Self {
        self.only_local = only_local;
        self
    }

    fn cache_key(&self) -> CacheKey {
        (crate::query::cache_key(&self.mode), self.search_type, self.only_local)
    }
}

// ============================================================================
// Query Cache
// ============================================================================

type CacheKey = (String, SearchType, bool);

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Queries by normalized request, for at-most-one-in-flight lookups.
///
/// Once `capacity` entries are held, inserting a new query first evicts
/// every query with no resolver still running. In-flight queries are never
/// evicted.
pub struct QueryCache {
    entries: Mutex<FxHashMap<CacheKey, Arc<Query>>>,
    capacity: usize,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, request: &SearchRequest) -> Option<Arc<Query>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.cache_key())
            .cloned()
    }

    /// Existing query for `request`, or a new one from `create`. The flag is
    /// true if the query was created by this call.
    pub fn get_or_insert_with(
        &self,
        request: &SearchRequest,
        create: impl FnOnce() -> Query,
    ) -> (Arc<Query>, bool) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(query) = entries.get(&request.cache_key()) {
            return (Arc::clone(query), false);
        }
        if entries.len() >= self.capacity {
            let before = entries.len();
            entries.retain(|_, query| {
                let status = query.status();
                status.done < status.todo
            });
            debug!(target: "pipeline", evicted = before - entries.len(), "evicted settled queries");
        }
        let query = Arc::new(create());
        entries.insert(request.cache_key(), Arc::clone(&query));
        (query, true)
    }

    /// Forget the query for `request`; the next search dispatches afresh.
    pub fn remove(&self, request: &SearchRequest) -> Option<Arc<Query>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request.cache_key())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    resolvers: Vec<Arc<dyn Resolver>>,
    pool: ThreadPool,
    subscribers: Mutex<Vec<Sender<SolvedEvent>>>,
    cache: Option<QueryCache>,
}

impl Pipeline {
    /// Empty pipeline with `workers` pool threads (0 = one per CPU).
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("resolver-{}", i))
            .build()
            .context("Failed to build resolver thread pool")?;
        Ok(Self {
            resolvers: Vec::new(),
            pool,
            subscribers: Mutex::new(Vec::new()),
            cache: None,
        })
    }

    pub fn with_query_reuse(mut self, reuse: bool) -> Self {
        self.cache = reuse.then(QueryCache::new);
        self
    }

    /// Reuse queries, holding at most `capacity` settled ones.
    pub fn with_query_cache(mut self, capacity: usize) -> Self {
        self.cache = Some(QueryCache::with_capacity(capacity));
        self
    }

    /// Pipeline with every resolver the config names.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut pipeline = Self::new(config.workers)?;
        if config.reuse_queries {
            pipeline = pipeline.with_query_cache(config.cache_capacity);
        }

        if let Some(path) = &config.local_index {
            let index = LocalIndex::open(path)
                .with_context(|| format!("Failed to open local index {:?}", path))?;
            pipeline.register(Arc::new(LocalIndexResolver::new("local", Arc::new(index))));
        }

        if let Some(remote) = &config.remote {
            let client = HttpCatalogClient::new(&remote.base_url, remote.timeout())
                .context("Failed to build HTTP client")?;
            let resolver = RemoteResolver::new("remote", client, remote.session())
                .with_min_score(remote.min_score);
            pipeline.register(Arc::new(resolver));
        }

        for script in &config.scripts {
            let resolver = ScriptResolver::new(script.name.clone(), script.command.clone())
                .args(script.args.iter().cloned())
                .local(script.local)
                .search_types(&script.search_types)
                .priority(script.priority)
                .timeout(script.timeout());
            pipeline.register(Arc::new(resolver));
        }

        Ok(pipeline)
    }

    /// Add a resolver after all registered resolvers of equal or higher priority.
    pub fn register(&mut self, resolver: Arc<dyn Resolver>) {
        let priority = resolver.priority();
        let position = self
            .resolvers
            .iter()
            .position(|r| r.priority() < priority)
            .unwrap_or(self.resolvers.len());
        info!(
            target: "pipeline",
            resolver = resolver.id(),
            priority,
            local = resolver.is_local(),
            "registered resolver"
        );
        self.resolvers.insert(position, resolver);
    }

    pub fn resolvers(&self) -> &[Arc<dyn Resolver>] {
        &self.resolvers
    }

    /// Resolvers a query would be dispatched to, in dispatch order.
    pub fn eligible(&self, only_local: bool, search_type: SearchType) -> Vec<Arc<dyn Resolver>> {
        self.resolvers
            .iter()
            .filter(|r| (!only_local || r.is_local()) && r.supports(search_type))
            .cloned()
            .collect()
    }

    /// New query wired to the current solved-event subscribers.
    pub fn create_query(&self, mode: QueryMode, only_local: bool) -> Query {
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        Query::new(mode, only_local).with_notifiers(subscribers.iter().cloned())
    }

    /// Create (or, with query reuse on, look up) the query for `request` and
    /// dispatch it. Returns without waiting for any resolver.
    pub fn search(&self, request: &SearchRequest) -> Arc<Query> {
        let create = || self.create_query(request.mode.clone(), request.only_local);
        let Some(cache) = &self.cache else {
            let query = Arc::new(create());
            self.dispatch(&query, request.search_type);
            return query;
        };

        let (query, created) = cache.get_or_insert_with(request, create);
        if created {
            self.dispatch(&query, request.search_type);
        } else {
            debug!(target: "pipeline", query = %query.id(), "reusing query");
        }
        query
    }

    /// Hand `query` to every eligible resolver. Returns the number dispatched.
    pub fn dispatch(&self, query: &Arc<Query>, search_type: SearchType) -> usize {
        let resolvers = self.eligible(query.is_only_local(), search_type);
        for _ in &resolvers {
            query.increment_todo();
        }

        info!(
            target: "pipeline",
            query = %query.id(),
            %search_type,
            only_local = query.is_only_local(),
            resolvers = resolvers.len(),
            "dispatching"
        );

        let count = resolvers.len();
        for resolver in resolvers {
            let query = Arc::clone(query);
            self.pool.spawn(move || run_resolver(resolver.as_ref(), query, search_type));
        }
        count
    }

    /// Subscribe to `SolvedEvent`s of queries created from now on. Events are
    /// buffered only while the returned receiver is alive.
    pub fn solved_events(&self) -> Receiver<SolvedEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }
}

fn run_resolver(resolver: &dyn Resolver, query: Arc<Query>, search_type: SearchType) {
    let _done = CompletionGuard::new(Arc::clone(&query));
    let start = Instant::now();
    match catch_unwind(AssertUnwindSafe(|| resolver.resolve(&query, search_type))) {
        Ok(Ok(count)) => debug!(
            target: "pipeline",
            query = %query.id(),
            resolver = resolver.id(),
            candidates = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "resolver finished"
        ),
        Ok(Err(e)) => warn!(
            target: "pipeline",
            query = %query.id(),
            resolver = resolver.id(),
            error = %e,
            "resolver failed"
        ),
        Err(panic) => warn!(
            target: "pipeline",
            query = %query.id(),
            resolver = resolver.id(),
            panic = panic_message(panic.as_ref()),
            "resolver panicked"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
