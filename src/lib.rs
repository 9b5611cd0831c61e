//! tscache: a caching layer in front of KairosDB
//!
//! Datapoint queries are answered from a shared key-value store whenever the
//! cached data covers the requested range. Missing data is fetched from
//! KairosDB and merged into what is cached; fleet-wide, one elected instance
//! keeps popular queries fresh ahead of time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │  client  │──▶│ orchestrator │──▶│ query / series │──▶│  CacheStore  │
//! └──────────┘   └──────┬───────┘   └────────────────┘   │  (Redis)     │
//!                       │                                 └──────▲───────┘
//!                       ▼                                        │
//!                ┌──────────────┐   ┌────────────────┐           │
//!                │ TsdbBackend  │◀──│   readahead    │───────────┘
//!                │  (KairosDB)  │   │ (leader lease) │
//!                └──────────────┘   └────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tscache::config::Config;
//! use tscache::engine::CacheEngineBuilder;
//! use tscache::backend::KairosClient;
//! use tscache::store::RedisStore;
//!
//! let config = Config::load();
//! let engine = CacheEngineBuilder::new()
//!     .with_store(RedisStore::new(&config.redis)?)
//!     .with_backend(KairosClient::new(&config.kairosdb)?)
//!     .with_config(config)
//!     .build()
//!     .await?;
//!
//! let (response, modes) = tscache::orchestrator::process_request(&engine, &request, true).await?;
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod maintenance;
pub mod metadata;
pub mod observability;
pub mod orchestrator;
pub mod query;
pub mod readahead;
pub mod series;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{CacheEngine, CacheEngineBuilder};
pub use error::{Error, Result};
