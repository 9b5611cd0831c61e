//! Pluggable engine architecture for the cache store and the backend TSDB

pub mod builder;
pub mod traits;

pub use builder::{CacheEngine, CacheEngineBuilder};
pub use traits::{CacheStore, TsdbBackend};
