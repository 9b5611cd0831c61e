//! Readahead: keeping popular queries warm
//!
//! Live requests that pass the admission policy add their query key to a
//! fleet-wide set. Periodically, one instance (whichever holds the leader
//! lease) walks that set and extends every cached query up to now, so the
//! next live request finds it hot.

pub mod admission;
pub mod leader;
pub mod service;

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

pub use admission::{process_for_readahead, should_add_to_readahead};
pub use leader::{become_leader, release_leader, LeaderLease, LeadershipState};
pub use service::{ReadaheadService, ReadaheadStats};

use crate::engine::CacheEngine;
use crate::orchestrator::process_cache_hit;
use crate::query::CachedQuery;
use crate::types::{TimeRange, TimeUnit};

/// Key of the leader lease
pub const SHADOW_LOCK_KEY: &str = "tscached:shadow_lock";

/// Key recording the hostname of the lease holder
pub const SHADOW_SERVER_KEY: &str = "tscached:shadow_server";

/// Set of query keys admitted to readahead
pub const SHADOW_LIST: &str = "tscached:shadow_list";

/// Minutes of margin added in front of the cached end
const MARGIN_MINUTES: u64 = 5;

/// Outcome of one readahead cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadaheadReport {
    /// Whether this instance held the lease for the cycle
    pub leader: bool,
    /// Keys found in the readahead set
    pub candidates: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// Keys dropped from the set because their query record is gone
    pub pruned: usize,
    /// Error that stopped the cycle early
    pub aborted: Option<String>,
}

/// Runs readahead cycles against one engine
pub struct ReadaheadCoordinator {
    engine: CacheEngine,
    state: RwLock<LeadershipState>,
}

impl ReadaheadCoordinator {
    pub fn new(engine: CacheEngine) -> Self {
        Self {
            engine,
            state: RwLock::new(LeadershipState::NotLeader),
        }
    }

    pub fn state(&self) -> LeadershipState {
        *self.state.read()
    }

    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    /// One full cycle: take the lease, refresh every candidate, release
    ///
    /// Returns immediately with `leader == false` when another instance
    /// holds the lease.
    pub async fn perform_readahead(&self) -> ReadaheadReport {
        let store = self.engine.store().as_ref();
        let ttl = self.engine.config().shadow.leader_expiration();

        *self.state.write() = LeadershipState::AttemptingLease;
        let Some(lease) = become_leader(store, ttl).await else {
            *self.state.write() = LeadershipState::NotLeader;
            info!("Could not become leader; skipping readahead");
            return ReadaheadReport::default();
        };
        *self.state.write() = LeadershipState::Leader;

        let started = Instant::now();
        let report = self.refresh_candidates().await;

        release_leader(store, &lease).await;
        *self.state.write() = LeadershipState::NotLeader;

        self.engine
            .metrics()
            .record_readahead_cycle(report.refreshed, report.failed);
        info!(
            candidates = report.candidates,
            refreshed = report.refreshed,
            failed = report.failed,
            aborted = report.aborted.is_some(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Readahead cycle complete"
        );
        report
    }

    async fn refresh_candidates(&self) -> ReadaheadReport {
        let store = self.engine.store().as_ref();
        let config = self.engine.config();
        let mut report = ReadaheadReport {
            leader: true,
            ..Default::default()
        };

        let keys = match store.set_members(SHADOW_LIST).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Could not read readahead set");
                report.aborted = Some(e.to_string());
                return report;
            }
        };
        report.candidates = keys.len();
        info!(count = keys.len(), "Found query keys in the readahead set");

        let queries = match CachedQuery::from_cache(store, &keys, config.data.query_expiry()).await {
            Ok(queries) => queries,
            Err(e) => {
                error!(error = %e, "Could not load cached queries");
                report.aborted = Some(e.to_string());
                return report;
            }
        };

        let stale: Vec<String> = {
            let loaded: HashSet<&str> = queries.iter().map(|q| q.cache_key()).collect();
            keys.iter()
                .filter(|k| !loaded.contains(k.as_str()))
                .cloned()
                .collect()
        };
        for key in &stale {
            match store.remove_from_set(SHADOW_LIST, key).await {
                Ok(_) => report.pruned += 1,
                Err(e) => warn!(key = %key, error = %e, "Could not prune readahead set"),
            }
        }
        if !stale.is_empty() {
            info!(count = report.pruned, "Pruned expired queries from the readahead set");
        }

        for mut query in queries {
            let Some(last_add_data) = query.last_add_data() else {
                warn!(key = %query.cache_key(), "Cached query has no end time, skipping");
                continue;
            };

            let minutes = readahead_minutes(Utc::now().timestamp(), last_add_data);
            let time_range = TimeRange::relative_start(minutes, TimeUnit::Minutes);

            match process_cache_hit(&self.engine, &mut query, &time_range).await {
                Ok((response, mode)) => {
                    report.refreshed += 1;
                    debug!(
                        key = %query.cache_key(),
                        mode = %mode,
                        samples = response.sample_size,
                        "Processed query"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(key = %query.cache_key(), error = %e, "Readahead refresh failed");
                    if !config.shadow.continue_on_error {
                        report.aborted = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        report
    }
}

/// Relative start, in minutes, that reaches back past the cached end
///
/// `ceil((now - last) / 60) + 5`; a cached end in the future counts as now.
pub fn readahead_minutes(now_secs: i64, last_add_data_secs: i64) -> u64 {
    let behind = (now_secs - last_add_data_secs).max(0) as u64;
    behind.div_ceil(60) + MARGIN_MINUTES
}
