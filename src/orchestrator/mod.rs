//! Cache orchestration
//!
//! Decides for every metric of a request whether it can be answered from
//! cache (hot), needs a gap fetch merged into cached series (warm), or has
//! to be fetched in full (cold).
//!
//! ```text
//!             get_cached
//!   request ─────────────┬── miss ──────────────────────────▶ cold
//!                        └── hit ── range_needed ─┬─ None ───▶ hot
//!                                                 ├─ Before ─▶ warm (prepend)
//!                                                 ├─ After ──▶ warm (append)
//!                                                 └─ All ────▶ cold (overwrite)
//! ```

pub mod planning;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

pub use planning::{chunked_time_ranges, range_needed, FetchMode, RangeNeeded};

use crate::backend::{KairosResponse, QueryResponse};
use crate::engine::CacheEngine;
use crate::error::{Error, Result};
use crate::query::{CachedQuery, QueryRequest};
use crate::readahead::process_for_readahead;
use crate::series::{CachedSeries, MergeOutcome, SeriesResult, TrimWindow};
use crate::types::{from_secs, TimeRange};

/// How a query was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    Hot,
    WarmBefore,
    WarmAfter,
    /// Cached entry existed but could not be extended
    ColdOverwrite,
    Cold,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Hot => "hot",
            CacheMode::WarmBefore => "warm_before",
            CacheMode::WarmAfter => "warm_after",
            CacheMode::ColdOverwrite => "cold_overwrite",
            CacheMode::Cold => "cold",
        }
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type MergeFn = fn(&mut CachedSeries, CachedSeries, usize) -> MergeOutcome;

/// Serve every metric of a datapoint query
///
/// A store failure degrades that metric to a cold fetch. A backend failure
/// fails the whole request. When `admitted` each query is also offered to
/// the readahead set.
pub async fn process_request(
    engine: &CacheEngine,
    request: &QueryRequest,
    admitted: bool,
) -> Result<(KairosResponse, Vec<CacheMode>)> {
    // Reject an unusable range before touching the store
    request.time_range.resolve(Utc::now())?;

    let queries = CachedQuery::from_request(request, engine.config())?;
    let mut response = KairosResponse::default();
    let mut modes = Vec::with_capacity(queries.len());

    for mut query in queries {
        let hit = match query.get_cached(engine.store().as_ref()).await {
            Ok(record) => record.is_some(),
            Err(e) => {
                warn!(key = %query.cache_key(), error = %e, "Cache lookup failed, treating as miss");
                engine.metrics().record_store_error();
                false
            }
        };

        let outcome = if hit {
            process_cache_hit(engine, &mut query, &request.time_range).await
        } else {
            cold(engine, &mut query, &request.time_range)
                .await
                .map(|r| (r, CacheMode::Cold))
        };

        let (result, mode) = match outcome {
            Ok(served) => served,
            Err(Error::Backend(failure)) => {
                engine.metrics().record_backend_failure();
                return Err(Error::Backend(failure));
            }
            Err(e) => return Err(e),
        };

        if process_for_readahead(admitted, engine.store().as_ref(), query.cache_key()).await {
            engine.metrics().record_admitted();
        }

        info!(key = %query.cache_key(), mode = %mode, samples = result.sample_size, "Query served");
        engine.metrics().record_query(mode, result.sample_size);
        response.queries.push(result);
        modes.push(mode);
    }

    Ok((response, modes))
}

/// Serve a query whose record was found by [`CachedQuery::get_cached`]
///
/// Cached series are loaded before anything is fetched, so a store failure
/// falls back to a cold fetch.
pub async fn process_cache_hit(
    engine: &CacheEngine,
    query: &mut CachedQuery,
    time_range: &TimeRange,
) -> Result<(QueryResponse, CacheMode)> {
    let config = engine.config();
    let now = Utc::now();
    let (start_request, end_request) = time_range.resolve(now)?;

    let record = query.cached_data();
    let start_cache = record
        .and_then(|r| r.earliest_data)
        .and_then(|s| from_secs(s).ok());
    let end_cache = record
        .and_then(|r| r.last_add_data)
        .and_then(|s| from_secs(s).ok());

    let needed = range_needed(
        start_request,
        end_request,
        start_cache,
        end_cache,
        config.data.staleness_threshold(),
        query.window_size(),
        now,
    );

    let cached = match CachedSeries::from_cache(
        engine.store().as_ref(),
        &query.series_keys(),
        config.data.series_expiry(),
    )
    .await
    {
        Ok(cached) => cached,
        Err(e) => {
            warn!(key = %query.cache_key(), error = %e, "Could not load cached series, fetching cold");
            engine.metrics().record_store_error();
            let response = cold(engine, query, time_range).await?;
            return Ok((response, CacheMode::Cold));
        }
    };

    let window = TrimWindow::new(start_request, end_request, config.data.trim_resolution_secs);

    match needed {
        None => Ok((hot(query, cached, &window), CacheMode::Hot)),
        Some(needed) => match needed.mode {
            FetchMode::All => {
                info!(key = %query.cache_key(), "Cached data cannot be extended, overwriting");
                let response = cold(engine, query, time_range).await?;
                Ok((response, CacheMode::ColdOverwrite))
            }
            FetchMode::Before => {
                let response = warm(engine, query, cached, &window, needed, start_cache, end_cache).await?;
                Ok((response, CacheMode::WarmBefore))
            }
            FetchMode::After => {
                let response = warm(engine, query, cached, &window, needed, start_cache, end_cache).await?;
                Ok((response, CacheMode::WarmAfter))
            }
        },
    }
}

/// Answer from cached series only
fn hot(query: &CachedQuery, cached: Vec<CachedSeries>, window: &TrimWindow) -> QueryResponse {
    debug!(key = %query.cache_key(), series = cached.len(), "Query is hot");
    let mut response = QueryResponse::default();
    for series in cached {
        series.build_response(Some(window), &mut response);
    }
    if response.results.is_empty() {
        response.results.push(SeriesResult::placeholder(query.query().name.clone()));
    }
    response
}

/// Fetch the whole requested range and overwrite the cache
///
/// Chunks are fetched concurrently and stitched per series, oldest first.
/// A result without any data is returned but not cached.
pub async fn cold(
    engine: &CacheEngine,
    query: &mut CachedQuery,
    time_range: &TimeRange,
) -> Result<QueryResponse> {
    let config = engine.config();
    let now = Utc::now();
    let (start, end) = time_range.resolve(now)?;

    let ranges = chunked_time_ranges(&config.chunking, start, end.unwrap_or(now));
    let chunks = query
        .proxy_to_backend_chunked(engine.backend().as_ref(), &ranges)
        .await?;
    debug!(key = %query.cache_key(), chunks = chunks.len(), "Query is cold");

    let mut order: Vec<String> = Vec::new();
    let mut stitched: HashMap<String, CachedSeries> = HashMap::new();
    for chunk in chunks.into_iter().rev() {
        for series in CachedSeries::from_result(chunk, config.data.series_expiry())? {
            if series.is_empty() {
                continue;
            }
            match stitched.get_mut(series.cache_key()) {
                Some(existing) => {
                    let outcome = existing.merge_at_end(series, config.data.merge_cutoff);
                    engine.metrics().record_merge(outcome);
                }
                None => {
                    order.push(series.cache_key().to_string());
                    stitched.insert(series.cache_key().to_string(), series);
                }
            }
        }
    }

    let mut response = QueryResponse::default();
    if stitched.is_empty() {
        info!(key = %query.cache_key(), "No results for query, not caching");
        response
            .results
            .push(SeriesResult::placeholder(query.query().name.clone()));
        return Ok(response);
    }

    let mut entries = Vec::with_capacity(order.len());
    let mut series_in_order = Vec::with_capacity(order.len());
    for key in &order {
        if let Some(series) = stitched.remove(key) {
            query.add_series(&series);
            entries.push(series.to_cache_entry()?);
            series_in_order.push(series);
        }
    }

    match engine.store().set_many(&entries).await {
        Ok(written) => {
            debug!(key = %query.cache_key(), written, total = entries.len(), "Series write pipeline");
            let oldest = ranges.last().map(|r| r.0).unwrap_or(start);
            let newest = ranges.first().map(|r| r.1);
            if let Err(e) = query.upsert(engine.store().as_ref(), oldest, newest).await {
                error!(key = %query.cache_key(), error = %e, "Could not write query record");
                engine.metrics().record_store_error();
            }
        }
        Err(e) => {
            error!(key = %query.cache_key(), error = %e, "Could not write series");
            engine.metrics().record_store_error();
        }
    }

    for series in series_in_order {
        series.build_response(None, &mut response);
    }
    Ok(response)
}

/// Fetch the missing side of the cached range and merge it in
async fn warm(
    engine: &CacheEngine,
    query: &mut CachedQuery,
    mut cached: Vec<CachedSeries>,
    window: &TrimWindow,
    needed: RangeNeeded,
    start_cache: Option<DateTime<Utc>>,
    end_cache: Option<DateTime<Utc>>,
) -> Result<QueryResponse> {
    let config = engine.config();
    let merge: MergeFn = match needed.mode {
        FetchMode::After => CachedSeries::merge_at_end,
        FetchMode::Before => CachedSeries::merge_at_beginning,
        FetchMode::All => {
            return Err(Error::InvalidQuery(
                "full refetch cannot be merged into cached data".to_string(),
            ))
        }
    };

    let now = Utc::now();
    let fetch_end = needed.end.unwrap_or(now);
    let fetch = TimeRange::absolute(
        needed.start.timestamp_millis() - config.data.expected_resolution_ms,
        fetch_end.timestamp_millis(),
    );
    let fresh = query
        .proxy_to_backend(engine.backend().as_ref(), fetch)
        .await?;
    debug!(key = %query.cache_key(), mode = ?needed.mode, "Query is warm");

    let mut start_times: Vec<DateTime<Utc>> = start_cache.into_iter().collect();
    let mut end_times: Vec<DateTime<Utc>> = end_cache.into_iter().collect();

    let index: HashMap<String, usize> = cached
        .iter()
        .enumerate()
        .map(|(i, s)| (s.cache_key().to_string(), i))
        .collect();
    for series in &cached {
        query.add_series(series);
    }

    // Matched series are rewritten even when unchanged, refreshing their TTL
    let mut matched = BTreeSet::new();
    let mut new_series = Vec::new();
    for series in CachedSeries::from_result(fresh, config.data.series_expiry())? {
        match index.get(series.cache_key()) {
            Some(&i) => {
                let outcome = merge(&mut cached[i], series, config.data.merge_cutoff);
                engine.metrics().record_merge(outcome);
                if outcome.modified() {
                    match needed.mode {
                        FetchMode::After => end_times.push(fetch_end),
                        _ => start_times.push(needed.start),
                    }
                }
                matched.insert(i);
            }
            None if !series.is_empty() => {
                // Started reporting after the query was cached
                query.add_series(&series);
                new_series.push(series);
            }
            None => {}
        }
    }

    let mut entries = Vec::with_capacity(matched.len() + new_series.len());
    for &i in &matched {
        entries.push(cached[i].to_cache_entry()?);
    }
    for series in &new_series {
        entries.push(series.to_cache_entry()?);
    }

    let mut response = QueryResponse::default();
    for series in cached.into_iter().chain(new_series) {
        series.build_response(Some(window), &mut response);
    }
    if response.results.is_empty() {
        response
            .results
            .push(SeriesResult::placeholder(query.query().name.clone()));
    }

    match engine.store().set_many(&entries).await {
        Ok(written) => {
            debug!(key = %query.cache_key(), written, total = entries.len(), "Series write pipeline");
            let earliest = start_times.into_iter().min().unwrap_or(needed.start);
            let latest = end_times.into_iter().max();
            if let Err(e) = query.upsert(engine.store().as_ref(), earliest, latest).await {
                error!(key = %query.cache_key(), error = %e, "Could not write query record");
                engine.metrics().record_store_error();
            }
        }
        Err(e) => {
            // Read succeeded but write failed; the data is still good to return
            error!(key = %query.cache_key(), error = %e, "Could not write series");
            engine.metrics().record_store_error();
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::engine::traits::CacheStore;
    use crate::engine::CacheEngineBuilder;
    use crate::error::BackendQueryFailure;
    use crate::query::MetricQuery;
    use crate::readahead::SHADOW_LIST;
    use crate::store::InMemoryStore;
    use crate::testing::SyntheticBackend;

    async fn engine_with(
        store: Arc<InMemoryStore>,
        backend: Arc<SyntheticBackend>,
        config: Config,
    ) -> CacheEngine {
        CacheEngineBuilder::new()
            .with_shared_store(store)
            .with_shared_backend(backend)
            .with_config(config)
            .build()
            .await
            .unwrap()
    }

    fn small_chunks() -> Config {
        Config::from_toml("[chunking]\nchunk_length_secs = 100\n").unwrap()
    }

    fn cpu_request(start_secs: i64, end_secs: i64) -> QueryRequest {
        QueryRequest::new(
            TimeRange::absolute(start_secs * 1000, end_secs * 1000),
            vec![MetricQuery::new("cpu")],
        )
    }

    fn timestamps(result: &SeriesResult) -> Vec<i64> {
        result.values.iter().map(|p| p.timestamp).collect()
    }

    #[tokio::test]
    async fn test_cold_then_hot() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store.clone(), backend.clone(), small_chunks()).await;
        let request = cpu_request(1_000, 1_600);

        let (response, modes) = process_request(&engine, &request, false).await.unwrap();
        assert_eq!(modes, vec![CacheMode::Cold]);
        let result = &response.queries[0].results[0];
        assert_eq!(result.values.len(), 61);
        assert_eq!(response.queries[0].sample_size, 61);
        let ts = timestamps(result);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        let fetched = backend.query_count();
        assert!(fetched > 1);

        let (again, modes) = process_request(&engine, &request, false).await.unwrap();
        assert_eq!(modes, vec![CacheMode::Hot]);
        assert_eq!(again.queries[0].results[0].values, result.values);
        assert_eq!(backend.query_count(), fetched);

        let s = engine.metrics().snapshot();
        assert_eq!((s.cold, s.hot), (1, 1));
    }

    #[tokio::test]
    async fn test_hot_trims_to_requested_window() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store, backend, Config::default()).await;

        process_request(&engine, &cpu_request(1_000, 1_600), false).await.unwrap();
        let (response, modes) = process_request(&engine, &cpu_request(1_200, 1_300), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::Hot]);
        let ts = timestamps(&response.queries[0].results[0]);
        assert_eq!(ts.first(), Some(&1_200_000));
        assert_eq!(ts.last(), Some(&1_300_000));
        assert_eq!(ts.len(), 11);
    }

    #[tokio::test]
    async fn test_warm_after_appends_newer_data() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store, backend.clone(), Config::default()).await;

        process_request(&engine, &cpu_request(1_000, 1_600), false).await.unwrap();
        let (response, modes) = process_request(&engine, &cpu_request(1_000, 2_000), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::WarmAfter]);

        let ts = timestamps(&response.queries[0].results[0]);
        assert_eq!(ts.len(), 101);
        assert!(ts.windows(2).all(|w| w[1] - w[0] == 10_000));

        // Gap fetch reaches back one expected resolution
        let last = backend.requests().pop().unwrap();
        assert_eq!(last.time_range.start_absolute, Some(1_590_000));

        let (_, modes) = process_request(&engine, &cpu_request(1_000, 2_000), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::Hot]);
        assert_eq!(engine.metrics().snapshot().merges_applied, 1);
    }

    #[tokio::test]
    async fn test_warm_rewrites_series_without_new_samples() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store.clone(), backend.clone(), Config::default()).await;

        process_request(&engine, &cpu_request(1_000, 1_600), false).await.unwrap();
        let mut query =
            CachedQuery::new(MetricQuery::new("cpu"), Config::default().data.query_expiry()).unwrap();
        let record = query.get_cached(store.as_ref()).await.unwrap().unwrap();
        let series_key = record.mts_keys[0].clone();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let before = store.ttl(&series_key).unwrap();

        // Metric went quiet: the gap fetch matches the series but brings nothing
        backend.quiet_after(1_500_000);
        let (response, modes) = process_request(&engine, &cpu_request(1_000, 2_000), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::WarmAfter]);
        assert_eq!(response.queries[0].results[0].values.len(), 61);
        assert_eq!(engine.metrics().snapshot().merges_applied, 0);

        let after = store.ttl(&series_key).unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_warm_before_prepends_older_data() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store.clone(), backend, Config::default()).await;

        process_request(&engine, &cpu_request(1_500, 2_000), false).await.unwrap();
        let (response, modes) = process_request(&engine, &cpu_request(1_000, 2_000), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::WarmBefore]);

        let ts = timestamps(&response.queries[0].results[0]);
        assert_eq!(ts.len(), 101);
        assert_eq!(ts[0], 1_000_000);

        let mut query = CachedQuery::new(MetricQuery::new("cpu"), Config::default().data.query_expiry()).unwrap();
        let record = query.get_cached(store.as_ref()).await.unwrap().unwrap();
        assert_eq!(record.earliest_data, Some(1_000));
        assert_eq!(record.last_add_data, Some(2_000));
    }

    #[tokio::test]
    async fn test_disjoint_request_overwrites() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store, backend, Config::default()).await;

        process_request(&engine, &cpu_request(1_000, 1_600), false).await.unwrap();
        let (response, modes) = process_request(&engine, &cpu_request(5_000, 5_100), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::ColdOverwrite]);
        assert_eq!(response.queries[0].results[0].values.len(), 11);
    }

    #[tokio::test]
    async fn test_one_result_per_series() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new().with_hosts(&["web1", "web2"]));
        let engine = engine_with(store, backend, small_chunks()).await;

        let (response, _) = process_request(&engine, &cpu_request(1_000, 1_600), false)
            .await
            .unwrap();
        let results = &response.queries[0].results;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.values.len() == 61));
        assert_eq!(response.queries[0].sample_size, 122);

        let (hot, modes) = process_request(&engine, &cpu_request(1_000, 1_600), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::Hot]);
        assert_eq!(hot.queries[0].results.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_result_placeholder_not_cached() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new().with_no_data());
        let engine = engine_with(store.clone(), backend, Config::default()).await;

        let (response, modes) = process_request(&engine, &cpu_request(1_000, 1_600), false)
            .await
            .unwrap();
        assert_eq!(modes, vec![CacheMode::Cold]);
        let results = &response.queries[0].results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "cpu");
        assert!(results[0].values.is_empty());
        assert!(results[0].tags.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_serves_as_proxy() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store.clone(), backend.clone(), Config::default()).await;
        store.set_available(false);

        for _ in 0..2 {
            let (response, modes) = process_request(&engine, &cpu_request(1_000, 1_600), true)
                .await
                .unwrap();
            assert_eq!(modes, vec![CacheMode::Cold]);
            assert_eq!(response.queries[0].results[0].values.len(), 61);
        }
        assert_eq!(backend.query_count(), 2);
        assert!(engine.metrics().snapshot().store_errors >= 2);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store, backend.clone(), Config::default()).await;
        backend.fail_with(BackendQueryFailure::Status {
            status: 400,
            message: "query.metric[0].name may not be empty".to_string(),
        });

        let err = process_request(&engine, &cpu_request(1_000, 1_600), false)
            .await
            .unwrap_err();
        match err {
            Error::Backend(failure) => assert_eq!(failure.status_code(), 400),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.metrics().snapshot().backend_failures, 1);
    }

    #[tokio::test]
    async fn test_admitted_queries_join_readahead_set() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store.clone(), backend, Config::default()).await;

        process_request(&engine, &cpu_request(1_000, 1_600), false).await.unwrap();
        assert!(store.set_members(SHADOW_LIST).await.unwrap().is_empty());

        process_request(&engine, &cpu_request(1_000, 1_600), true).await.unwrap();
        let members = store.set_members(SHADOW_LIST).await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].starts_with("tscached:kquery:"));
    }

    #[tokio::test]
    async fn test_invalid_range_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        let engine = engine_with(store, backend.clone(), Config::default()).await;

        let request = QueryRequest::new(TimeRange::default(), vec![MetricQuery::new("cpu")]);
        let err = process_request(&engine, &request, false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
        assert_eq!(backend.query_count(), 0);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(CacheMode::WarmBefore.as_str(), "warm_before");
        assert_eq!(CacheMode::ColdOverwrite.to_string(), "cold_overwrite");
    }
}
