//! The resolver capability contract.
//!
//! A resolver turns a `Query` into candidates. It reports them by calling
//! `Query::add_candidate` (as often as it likes, from its own worker thread)
//! and returns how many it added. The pipeline, not the resolver, signals
//! completion: a `CompletionGuard` wraps every dispatched run and increments
//! the query's done counter exactly once, whether the run returned a result,
//! an error, or panicked.

use std::sync::Arc;

use crate::error::ResolverError;
use crate::models::SearchType;
use crate::query::Query;

/// Default priority of resolvers that need no network.
pub const LOCAL_PRIORITY: i32 = 100;

/// Default priority of network resolvers.
pub const REMOTE_PRIORITY: i32 = 50;

pub trait Resolver: Send + Sync {
    /// Stable identifier, recorded on every candidate this resolver produces.
    fn id(&self) -> &str;

    fn supports(&self, search_type: SearchType) -> bool;

    /// True if this resolver works without network access.
    fn is_local(&self) -> bool;

    /// Dispatch order: higher goes first. Ties keep registration order.
    fn priority(&self) -> i32 {
        if self.is_local() {
            LOCAL_PRIORITY
        } else {
            REMOTE_PRIORITY
        }
    }

    /// Find candidates for `query` and add them to it. May block on I/O.
    fn resolve(&self, query: &Query, search_type: SearchType) -> Result<usize, ResolverError>;
}

/// Increments the query's done counter when dropped.
pub struct CompletionGuard {
    query: Arc<Query>,
}

impl CompletionGuard {
    pub fn new(query: Arc<Query>) -> Self {
        Self { query }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.query.increment_done();
    }
}
