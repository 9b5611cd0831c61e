//! Cached series entity
//!
//! One metric time series as returned by KairosDB, plus the bookkeeping
//! needed to store it, splice fresh data onto it and cut it down to a
//! requested window.

pub mod merge;
pub mod trim;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use merge::{merge_at_beginning, merge_at_end, MergeOutcome};
pub use trim::{efficient_trim, is_uniform, robust_trim, TrimWindow};

use crate::backend::QueryResponse;
use crate::engine::traits::CacheStore;
use crate::error::{Result, StoreError};
use crate::fingerprint::fingerprint;
use crate::types::{tags_one_or_many, Aggregator, DataPoint, GroupBy, Tags};

/// Logical name of series entries in the key namespace
pub const SERIES_KEY_NAME: &str = "mts";

/// One entry of `queries[].results` in a KairosDB response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResult {
    pub name: String,
    #[serde(default, deserialize_with = "tags_one_or_many")]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<GroupBy>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregators: Option<Vec<Aggregator>>,
    #[serde(default)]
    pub values: Vec<DataPoint>,
}

impl SeriesResult {
    /// Result carrying a name and nothing else
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
            group_by: None,
            aggregators: None,
            values: Vec::new(),
        }
    }
}

/// Identity of a series; equal bases are the same logical series
#[derive(Debug, PartialEq, Serialize)]
pub struct KeyBasis<'a> {
    pub tags: &'a Tags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<&'a [GroupBy]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregators: Option<&'a [Aggregator]>,
    pub name: &'a str,
}

/// A series together with its cache key and TTL
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSeries {
    result: SeriesResult,
    cache_key: String,
    expiry: Duration,
}

impl CachedSeries {
    /// Wrap a freshly fetched result, deriving its cache key
    pub fn new(result: SeriesResult, expiry: Duration) -> Result<Self> {
        let cache_key = fingerprint(&key_basis(&result), SERIES_KEY_NAME)?;
        Ok(Self {
            result,
            cache_key,
            expiry,
        })
    }

    /// One entity per result of a backend query
    pub fn from_result(response: QueryResponse, expiry: Duration) -> Result<Vec<Self>> {
        response
            .results
            .into_iter()
            .map(|result| Self::new(result, expiry))
            .collect()
    }

    /// Load many entities in one round trip
    ///
    /// Keys that expired or hold an undecodable payload are skipped.
    pub async fn from_cache(
        store: &dyn CacheStore,
        keys: &[String],
        expiry: Duration,
    ) -> std::result::Result<Vec<Self>, StoreError> {
        let payloads = store.get_many(keys).await?;

        let mut series = Vec::with_capacity(keys.len());
        for (key, payload) in keys.iter().zip(payloads) {
            let Some(payload) = payload else {
                debug!(key = %key, "Series no longer cached");
                continue;
            };
            match serde_json::from_str::<SeriesResult>(&payload) {
                Ok(result) => series.push(Self {
                    result,
                    cache_key: key.clone(),
                    expiry,
                }),
                Err(e) => {
                    let err = StoreError::Corrupted {
                        key: key.clone(),
                        reason: e.to_string(),
                    };
                    warn!(error = %err, "Skipping cached series");
                }
            }
        }
        Ok(series)
    }

    pub fn key_basis(&self) -> KeyBasis<'_> {
        key_basis(&self.result)
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn result(&self) -> &SeriesResult {
        &self.result
    }

    pub fn values(&self) -> &[DataPoint] {
        &self.result.values
    }

    pub fn is_empty(&self) -> bool {
        self.result.values.is_empty()
    }

    /// Serialized form for a pipelined write
    pub fn to_cache_entry(&self) -> Result<(String, String, Duration)> {
        Ok((
            self.cache_key.clone(),
            serde_json::to_string(&self.result)?,
            self.expiry,
        ))
    }

    /// Overwrite the stored entity with the full current samples and a fresh TTL
    pub async fn upsert(&self, store: &dyn CacheStore) -> Result<()> {
        let (key, payload, ttl) = self.to_cache_entry()?;
        store.set(&key, &payload, ttl).await?;
        Ok(())
    }

    /// Splice newer samples onto the end
    pub fn merge_at_end(&mut self, incoming: CachedSeries, cutoff: usize) -> MergeOutcome {
        let outcome = merge_at_end(&mut self.result.values, incoming.result.values, cutoff);
        self.log_merge("end", outcome, cutoff);
        outcome
    }

    /// Splice older samples onto the beginning
    pub fn merge_at_beginning(&mut self, older: CachedSeries, cutoff: usize) -> MergeOutcome {
        let outcome = merge_at_beginning(&mut self.result.values, older.result.values, cutoff);
        self.log_merge("beginning", outcome, cutoff);
        outcome
    }

    fn log_merge(&self, side: &str, outcome: MergeOutcome, cutoff: usize) {
        match outcome {
            MergeOutcome::Aborted => {
                debug!(key = %self.cache_key, side, cutoff, "Could not merge; not updating")
            }
            MergeOutcome::Spliced { discarded } => {
                debug!(key = %self.cache_key, side, discarded, "Sliced outdated values")
            }
            MergeOutcome::Replaced => {
                debug!(key = %self.cache_key, side, "Cached data too short; replaced")
            }
            _ => {}
        }
    }

    /// Consume the entity into a response accumulator
    ///
    /// With a window the samples are trimmed first. The index-arithmetic trim
    /// is used when the samples look contiguous at the window's resolution,
    /// the full scan otherwise.
    pub fn build_response(self, window: Option<&TrimWindow>, acc: &mut QueryResponse) {
        let mut result = self.result;

        if let Some(window) = window {
            result.values = if is_uniform(&result.values, window.resolution_secs) {
                efficient_trim(&result.values, window.start, window.end, window.resolution_secs)
                    .to_vec()
            } else {
                debug!(key = %self.cache_key, "Irregular sampling, trimming by scan");
                robust_trim(&result.values, window.start, window.end)
                    .copied()
                    .collect()
            };
        }

        acc.sample_size += result.values.len();
        acc.results.push(result);
    }
}

fn key_basis(result: &SeriesResult) -> KeyBasis<'_> {
    KeyBasis {
        tags: &result.tags,
        group_by: result.group_by.as_deref().filter(|g| !g.is_empty()),
        aggregators: result.aggregators.as_deref().filter(|a| !a.is_empty()),
        name: &result.name,
    }
}
