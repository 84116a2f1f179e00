//! Music query resolution: one query fanned out to local, remote and script
//! resolvers, with candidates scored and ranked as they arrive.

pub mod config;
pub mod error;
pub mod local;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod remote;
pub mod resolver;
pub mod scoring;
pub mod script;

pub use error::ResolverError;
pub use models::{Candidate, QueryMode, SearchType, TrackRef};
pub use pipeline::{Pipeline, SearchRequest};
pub use query::Query;
pub use resolver::Resolver;
