//! Deciding what to fetch from the backend

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::ChunkingConfig;

/// Direction of a backend fetch relative to cached data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Older data is missing; prepend it
    Before,
    /// Newer data is missing; append it
    After,
    /// Cached data cannot be extended; refetch the whole range
    All,
}

/// Backend range needed to complete the cache for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNeeded {
    pub start: DateTime<Utc>,
    /// `None` means "until now"
    pub end: Option<DateTime<Utc>>,
    pub mode: FetchMode,
}

/// Compare a request against cached bounds
///
/// Returns `None` when the cache already covers the request (hot). Data
/// newer than the cache end by less than `staleness` counts as covered. An
/// `After` fetch reaches back one sampling window so the newest, possibly
/// partial, aggregate is recomputed.
pub fn range_needed(
    start_request: DateTime<Utc>,
    end_request: Option<DateTime<Utc>>,
    start_cache: Option<DateTime<Utc>>,
    end_cache: Option<DateTime<Utc>>,
    staleness: Duration,
    window_size: Option<Duration>,
    now: DateTime<Utc>,
) -> Option<RangeNeeded> {
    let everything = RangeNeeded {
        start: start_request,
        end: end_request,
        mode: FetchMode::All,
    };

    let (Some(start_cache), Some(end_cache)) = (start_cache, end_cache) else {
        return Some(everything);
    };

    let effective_end = end_request.unwrap_or(now);
    if effective_end < start_cache || start_request > end_cache {
        return Some(everything);
    }

    let staleness = chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::MAX);
    let needs_before = start_request < start_cache;
    let needs_after = effective_end - end_cache > staleness;

    match (needs_before, needs_after) {
        (true, true) => Some(everything),
        (true, false) => Some(RangeNeeded {
            start: start_request,
            end: Some(start_cache),
            mode: FetchMode::Before,
        }),
        (false, true) => {
            let window = window_size
                .and_then(|w| chrono::Duration::from_std(w).ok())
                .unwrap_or_else(chrono::Duration::zero);
            Some(RangeNeeded {
                start: end_cache - window,
                end: end_request,
                mode: FetchMode::After,
            })
        }
        (false, false) => None,
    }
}

/// Split `[start, end]` into consecutive chunks, newest first
///
/// Chunks do not overlap: each older chunk ends one millisecond before the
/// next one starts.
pub fn chunked_time_ranges(
    chunking: &ChunkingConfig,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let chunk = chrono::Duration::seconds(chunking.chunk_length_secs as i64);
    if !chunking.enabled || chunk <= chrono::Duration::zero() || end <= start {
        return vec![(start, end)];
    }

    let mut ranges = Vec::new();
    let mut chunk_end = end;
    loop {
        let chunk_start = (chunk_end - chunk).max(start);
        ranges.push((chunk_start, chunk_end));
        if chunk_start <= start {
            break;
        }
        chunk_end = chunk_start - chrono::Duration::milliseconds(1);
    }
    ranges
}
