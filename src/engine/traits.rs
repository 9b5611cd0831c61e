//! Pluggable seams: the cache store and the backend TSDB

use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendReply, ProxyResponse};
use crate::error::{BackendQueryFailure, StoreError};
use crate::query::QueryRequest;

/// Key-value store holding cached entries, the readahead set and the leader lease
///
/// Every call must be bounded in time; implementations turn a slow store
/// into [`StoreError::Timeout`] rather than blocking the caller.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Identifier of the implementation
    fn store_id(&self) -> &str;

    /// Fetch a scalar value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Fetch many scalar values in one round trip, in key order
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Overwrite a scalar value with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Overwrite many scalar values in one round trip
    async fn set_many(&self, entries: &[(String, String, Duration)]) -> Result<usize, StoreError>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Add a member to a set, returning whether it was new
    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove a member from a set, returning whether it was present
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// All members of a set
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Set a value only if the key does not exist (single attempt, never waits)
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete a key only if it still holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Drop every key in the store
    async fn flush_all(&self) -> Result<(), StoreError>;

    /// Round trip check
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Backend time-series database
#[async_trait]
pub trait TsdbBackend: Send + Sync {
    /// Run a datapoint query
    ///
    /// With `propagate` set, failures come back as `Err`. Without it they are
    /// folded into [`BackendReply::Error`] so concurrent callers can collect
    /// every reply before deciding.
    async fn query(
        &self,
        request: &QueryRequest,
        propagate: bool,
    ) -> Result<BackendReply, BackendQueryFailure>;

    /// Forward a metadata request verbatim (`GET` without a body, `POST` with one)
    ///
    /// Only transport failures are errors; any HTTP status is returned as is.
    async fn proxy(
        &self,
        endpoint: &str,
        body: Option<&str>,
    ) -> Result<ProxyResponse, BackendQueryFailure>;
}
