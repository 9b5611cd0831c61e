//! Cached query entity
//!
//! A query request fans out into one cached query per metric. Each is keyed
//! by a fingerprint of its normalized definition and records which series it
//! produced and which time span the cache covers.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::backend::QueryResponse;
use crate::config::Config;
use crate::engine::traits::{CacheStore, TsdbBackend};
use crate::error::{BackendQueryFailure, Result, StoreError};
use crate::fingerprint::fingerprint;
use crate::series::CachedSeries;
use crate::types::{tags_one_or_many, Aggregator, GroupBy, Tags, TimeRange};

/// Logical name of query entries in the key namespace
pub const QUERY_KEY_NAME: &str = "kquery";

/// One metric of a datapoint query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,
    #[serde(
        default,
        deserialize_with = "tags_one_or_many",
        skip_serializing_if = "Tags::is_empty"
    )]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<GroupBy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregators: Vec<Aggregator>,
    /// Anything else KairosDB understands (limit, order, exclude_tags, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MetricQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
            group_by: Vec::new(),
            aggregators: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregators.push(aggregator);
        self
    }

    /// Replace `align_sampling` with `align_start_time`
    ///
    /// Sampling aligned to the calendar produces partial windows at every
    /// chunk seam; aligned to the start time, consecutive chunks concatenate.
    pub fn normalize(&mut self) {
        for aggregator in &mut self.aggregators {
            if aggregator.align_sampling.take().is_some() {
                aggregator.align_start_time = Some(true);
            }
        }
    }

    /// Widest sampling window of any aggregator
    pub fn window_size(&self) -> Option<Duration> {
        self.aggregators
            .iter()
            .filter_map(|a| a.sampling.map(|s| s.window()))
            .max()
    }
}

/// Body of `POST /api/v1/datapoints/query`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(flatten)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub metrics: Vec<MetricQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_time: Option<u64>,
}

impl QueryRequest {
    pub fn new(time_range: TimeRange, metrics: Vec<MetricQuery>) -> Self {
        Self {
            time_range,
            metrics,
            cache_time: None,
        }
    }

    /// Backend query for a single metric, bypassing KairosDB's own cache
    pub fn for_metric(time_range: TimeRange, metric: MetricQuery) -> Self {
        Self {
            time_range,
            metrics: vec![metric],
            cache_time: Some(0),
        }
    }
}

/// What is stored under a query key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    #[serde(flatten)]
    pub query: MetricQuery,
    #[serde(default)]
    pub mts_keys: Vec<String>,
    /// Unix seconds of the newest data fetched from the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_add_data: Option<i64>,
    /// Unix seconds of the oldest data fetched from the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_data: Option<i64>,
}

/// A normalized metric query and its cache bookkeeping
#[derive(Debug, Clone)]
pub struct CachedQuery {
    query: MetricQuery,
    cache_key: String,
    window_size: Option<Duration>,
    expiry: Duration,
    cached_data: Option<QueryRecord>,
    related_series: BTreeSet<String>,
}

impl CachedQuery {
    /// Normalize a metric and derive its key
    pub fn new(mut query: MetricQuery, expiry: Duration) -> Result<Self> {
        query.normalize();
        let cache_key = fingerprint(&query, QUERY_KEY_NAME)?;
        Ok(Self::with_key(query, cache_key, expiry))
    }

    fn with_key(query: MetricQuery, cache_key: String, expiry: Duration) -> Self {
        Self {
            window_size: query.window_size(),
            query,
            cache_key,
            expiry,
            cached_data: None,
            related_series: BTreeSet::new(),
        }
    }

    /// One cached query per metric of the request
    pub fn from_request(request: &QueryRequest, config: &Config) -> Result<Vec<Self>> {
        request
            .metrics
            .iter()
            .map(|metric| Self::new(metric.clone(), config.data.query_expiry()))
            .collect()
    }

    /// Load many cached queries in one round trip
    ///
    /// Expired and undecodable entries are logged and skipped.
    pub async fn from_cache(
        store: &dyn CacheStore,
        keys: &[String],
        expiry: Duration,
    ) -> std::result::Result<Vec<Self>, StoreError> {
        let payloads = store.get_many(keys).await?;

        let mut queries = Vec::with_capacity(keys.len());
        for (key, payload) in keys.iter().zip(payloads) {
            let Some(payload) = payload else {
                warn!(key = %key, "Query no longer cached");
                continue;
            };
            match serde_json::from_str::<QueryRecord>(&payload) {
                Ok(record) => {
                    let mut query = Self::with_key(record.query.clone(), key.clone(), expiry);
                    query.cached_data = Some(record);
                    queries.push(query);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable cached query"),
            }
        }
        Ok(queries)
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn query(&self) -> &MetricQuery {
        &self.query
    }

    pub fn window_size(&self) -> Option<Duration> {
        self.window_size
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Record loaded by the last [`get_cached`](Self::get_cached)
    pub fn cached_data(&self) -> Option<&QueryRecord> {
        self.cached_data.as_ref()
    }

    pub fn last_add_data(&self) -> Option<i64> {
        self.cached_data.as_ref().and_then(|r| r.last_add_data)
    }

    /// Keys of the series currently associated with this query
    pub fn series_keys(&self) -> Vec<String> {
        match &self.cached_data {
            Some(record) => record.mts_keys.clone(),
            None => Vec::new(),
        }
    }

    /// Look the query up in the store, remembering what was found
    ///
    /// An undecodable entry is treated as a miss.
    pub async fn get_cached(
        &mut self,
        store: &dyn CacheStore,
    ) -> std::result::Result<Option<&QueryRecord>, StoreError> {
        self.cached_data = match store.get(&self.cache_key).await? {
            Some(payload) => match serde_json::from_str::<QueryRecord>(&payload) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %self.cache_key, error = %e, "Cached query undecodable, treating as miss");
                    None
                }
            },
            None => None,
        };
        Ok(self.cached_data.as_ref())
    }

    /// Fetch this metric from the backend for a custom range
    pub async fn proxy_to_backend(
        &self,
        backend: &dyn TsdbBackend,
        time_range: TimeRange,
    ) -> std::result::Result<QueryResponse, BackendQueryFailure> {
        let request = QueryRequest::for_metric(time_range, self.query.clone());
        let response = backend.query(&request, true).await?.into_result()?;

        if response.queries.len() != 1 {
            error!(
                key = %self.cache_key,
                found = response.queries.len(),
                "Expected exactly one query result"
            );
        }
        Ok(response.queries.into_iter().next().unwrap_or_default())
    }

    /// Fetch this metric for several ranges concurrently
    ///
    /// Responses come back in the order of `ranges`. If any chunk failed the
    /// whole fetch fails.
    pub async fn proxy_to_backend_chunked(
        &self,
        backend: &dyn TsdbBackend,
        ranges: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> std::result::Result<Vec<QueryResponse>, BackendQueryFailure> {
        let requests: Vec<QueryRequest> = ranges
            .iter()
            .map(|(start, end)| {
                QueryRequest::for_metric(
                    TimeRange::absolute(start.timestamp_millis(), end.timestamp_millis()),
                    self.query.clone(),
                )
            })
            .collect();

        let replies = join_all(requests.iter().map(|r| backend.query(r, false))).await;

        let mut responses = Vec::with_capacity(replies.len());
        for reply in replies {
            let response = reply?.into_result()?;
            responses.push(response.queries.into_iter().next().unwrap_or_default());
        }
        debug!(key = %self.cache_key, chunks = responses.len(), "Chunked fetch complete");
        Ok(responses)
    }

    /// Associate a series with this query
    pub fn add_series(&mut self, series: &CachedSeries) {
        self.related_series.insert(series.cache_key().to_string());
    }

    /// Write the query record, overwriting any previous one
    ///
    /// `start` is when we began asking for data, `end` when we stopped; an
    /// open end means now.
    pub async fn upsert(
        &mut self,
        store: &dyn CacheStore,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let record = QueryRecord {
            query: self.query.clone(),
            mts_keys: self.related_series.iter().cloned().collect(),
            last_add_data: Some(end.unwrap_or_else(Utc::now).timestamp()),
            earliest_data: Some(start.timestamp()),
        };

        let payload = serde_json::to_string(&record)?;
        store.set(&self.cache_key, &payload, self.expiry).await?;
        debug!(key = %self.cache_key, series = record.mts_keys.len(), "Query record written");
        self.cached_data = Some(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::testing::SyntheticBackend;
    use crate::types::{from_secs, TimeUnit};

    const EXPIRY: Duration = Duration::from_secs(10_800);

    fn aggregated(align: bool) -> MetricQuery {
        let mut minute = Aggregator::new("avg").with_sampling(1, TimeUnit::Minutes);
        if align {
            minute.align_sampling = Some(true);
        } else {
            minute.align_start_time = Some(true);
        }
        MetricQuery::new("cpu")
            .with_aggregator(minute)
            .with_aggregator(Aggregator::new("max").with_sampling(5, TimeUnit::Minutes))
    }

    #[test]
    fn test_normalization_and_window_size() {
        let query = CachedQuery::new(aggregated(true), EXPIRY).unwrap();
        let first = &query.query().aggregators[0];
        assert_eq!(first.align_sampling, None);
        assert_eq!(first.align_start_time, Some(true));
        assert_eq!(query.window_size(), Some(Duration::from_secs(300)));

        // align_sampling and align_start_time normalize to the same key
        let other = CachedQuery::new(aggregated(false), EXPIRY).unwrap();
        assert_eq!(query.cache_key(), other.cache_key());
        assert!(query.cache_key().starts_with("tscached:kquery:"));

        assert_eq!(MetricQuery::new("cpu").window_size(), None);
    }

    #[test]
    fn test_request_parsing() {
        let raw = r#"{
            "start_relative": {"value": "2", "unit": "hours"},
            "cache_time": 0,
            "metrics": [
                {"name": "cpu", "tags": {"host": "web1"}, "limit": 100},
                {"name": "mem"}
            ]
        }"#;
        let request: QueryRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.time_range, TimeRange::relative_start(2, TimeUnit::Hours));
        assert_eq!(request.metrics[0].tags["host"], vec!["web1".to_string()]);
        assert_eq!(request.metrics[0].extra["limit"], serde_json::json!(100));

        let queries = CachedQuery::from_request(&request, &Config::default()).unwrap();
        assert_eq!(queries.len(), 2);
        assert_ne!(queries[0].cache_key(), queries[1].cache_key());
    }

    #[test]
    fn test_record_layout() {
        let record = QueryRecord {
            query: MetricQuery::new("cpu"),
            mts_keys: vec!["tscached:mts:abc".to_string()],
            last_add_data: Some(1_700_000_000),
            earliest_data: Some(1_699_990_000),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["name"], "cpu");
        assert_eq!(json["mts_keys"][0], "tscached:mts:abc");

        let parsed: QueryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }

    #[tokio::test]
    async fn test_upsert_then_get_cached() {
        let store = InMemoryStore::new();
        let mut query = CachedQuery::new(MetricQuery::new("cpu"), EXPIRY).unwrap();
        assert!(query.get_cached(&store).await.unwrap().is_none());

        let series = CachedSeries::new(crate::series::SeriesResult::placeholder("cpu"), EXPIRY).unwrap();
        query.add_series(&series);
        query.add_series(&series);
        query
            .upsert(&store, from_secs(1_000).unwrap(), Some(from_secs(2_000).unwrap()))
            .await
            .unwrap();

        let mut reloaded = CachedQuery::new(MetricQuery::new("cpu"), EXPIRY).unwrap();
        let record = reloaded.get_cached(&store).await.unwrap().unwrap();
        assert_eq!(record.mts_keys, vec![series.cache_key().to_string()]);
        assert_eq!(record.earliest_data, Some(1_000));
        assert_eq!(reloaded.last_add_data(), Some(2_000));
        assert_eq!(reloaded.series_keys().len(), 1);
    }

    #[tokio::test]
    async fn test_get_cached_corrupt_is_miss() {
        let store = InMemoryStore::new();
        let mut query = CachedQuery::new(MetricQuery::new("cpu"), EXPIRY).unwrap();
        store.set(query.cache_key(), "[1, 2", EXPIRY).await.unwrap();
        assert!(query.get_cached(&store).await.unwrap().is_none());

        store.set_available(false);
        assert!(query.get_cached(&store).await.is_err());
    }

    #[tokio::test]
    async fn test_from_cache_batch() {
        let store = InMemoryStore::new();
        let mut cpu = CachedQuery::new(MetricQuery::new("cpu"), EXPIRY).unwrap();
        cpu.upsert(&store, from_secs(1_000).unwrap(), None).await.unwrap();

        let keys = vec![cpu.cache_key().to_string(), "tscached:kquery:gone".to_string()];
        let loaded = CachedQuery::from_cache(&store, &keys, EXPIRY).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].query().name, "cpu");
        assert_eq!(loaded[0].cache_key(), cpu.cache_key());
        assert!(loaded[0].last_add_data().is_some());
    }

    #[tokio::test]
    async fn test_proxy_to_backend() {
        let backend = SyntheticBackend::new();
        let query = CachedQuery::new(MetricQuery::new("cpu"), EXPIRY).unwrap();

        let response = query
            .proxy_to_backend(&backend, TimeRange::absolute(1_000_000, 1_060_000))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].values.len(), 7);

        let sent = backend.requests();
        assert_eq!(sent[0].cache_time, Some(0));
        assert_eq!(sent[0].metrics.len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_chunked_keeps_order_and_fails_as_a_whole() {
        let backend = SyntheticBackend::new();
        let query = CachedQuery::new(MetricQuery::new("cpu"), EXPIRY).unwrap();
        let ranges = vec![
            (from_secs(2_000).unwrap(), from_secs(3_000).unwrap()),
            (from_secs(1_000).unwrap(), from_secs(2_000).unwrap()),
        ];

        let chunks = query.proxy_to_backend_chunked(&backend, &ranges).await.unwrap();
        assert_eq!(chunks.len(), 2);
        let first_ts = |c: &QueryResponse| c.results[0].values[0].timestamp;
        assert_eq!(first_ts(&chunks[0]), 2_000_000);
        assert_eq!(first_ts(&chunks[1]), 1_000_000);

        backend.fail_with(BackendQueryFailure::Status {
            status: 500,
            message: "boom".to_string(),
        });
        let err = query.proxy_to_backend_chunked(&backend, &ranges).await.unwrap_err();
        assert_eq!(err.to_string(), "KairosDB responded 500: boom");
    }
}
