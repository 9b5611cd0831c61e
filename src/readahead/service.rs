//! Periodic readahead loop
//!
//! Runs a readahead cycle every `shadow.interval_secs` until a shutdown
//! signal arrives. Every instance may run the loop; the lease makes sure
//! only one of them refreshes per cycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::{ReadaheadCoordinator, ReadaheadReport};
use crate::engine::CacheEngine;

/// Lifecycle of the background loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Running,
}

/// Statistics collected by the readahead service
#[derive(Debug, Default, Clone)]
pub struct ReadaheadStats {
    /// Cycles attempted
    pub cycles: u64,

    /// Cycles in which this instance held the lease
    pub cycles_as_leader: u64,

    /// Queries refreshed over all cycles
    pub refreshed: u64,

    /// Refreshes that failed over all cycles
    pub failed: u64,

    /// Start of the last cycle
    pub last_cycle: Option<Instant>,

    pub last_report: Option<ReadaheadReport>,
}

/// Background service driving [`ReadaheadCoordinator`]
pub struct ReadaheadService {
    coordinator: ReadaheadCoordinator,
    interval: Duration,
    status: RwLock<ServiceStatus>,
    stats: RwLock<ReadaheadStats>,
}

impl ReadaheadService {
    /// Create a service using `shadow.interval_secs` from the engine's config
    pub fn new(engine: CacheEngine) -> Self {
        let interval = engine.config().shadow.interval();
        Self::with_interval(engine, interval)
    }

    pub fn with_interval(engine: CacheEngine, interval: Duration) -> Self {
        Self {
            coordinator: ReadaheadCoordinator::new(engine),
            interval: interval.max(Duration::from_millis(1)),
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(ReadaheadStats::default()),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read()
    }

    /// Get current statistics
    pub fn stats(&self) -> ReadaheadStats {
        self.stats.read().clone()
    }

    pub fn coordinator(&self) -> &ReadaheadCoordinator {
        &self.coordinator
    }

    /// Run a single cycle and fold it into the statistics
    pub async fn run_once(&self) -> ReadaheadReport {
        let start = Instant::now();
        let report = self.coordinator.perform_readahead().await;

        let mut stats = self.stats.write();
        stats.cycles += 1;
        if report.leader {
            stats.cycles_as_leader += 1;
        }
        stats.refreshed += report.refreshed as u64;
        stats.failed += report.failed as u64;
        stats.last_cycle = Some(start);
        stats.last_report = Some(report.clone());
        report
    }

    /// Loop until `shutdown` fires or its sender is dropped
    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) {
        *self.status.write() = ServiceStatus::Running;
        tracing::info!(interval_secs = self.interval.as_secs(), "Readahead service started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Readahead service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Readahead broadcast receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    if let Some(reason) = report.aborted {
                        tracing::warn!(reason = %reason, "Readahead cycle aborted");
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::info!("Readahead service stopped");
    }
}

/// Spawn the service on the current runtime
pub fn spawn(
    service: Arc<ReadaheadService>,
    shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { service.start(shutdown).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CacheEngineBuilder;
    use crate::store::InMemoryStore;
    use crate::testing::SyntheticBackend;

    async fn engine() -> CacheEngine {
        CacheEngineBuilder::new()
            .with_store(InMemoryStore::new())
            .with_backend(SyntheticBackend::new())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let service = Arc::new(ReadaheadService::with_interval(
            engine().await,
            Duration::from_millis(10),
        ));
        assert_eq!(service.status(), ServiceStatus::Stopped);

        let (tx, rx) = broadcast::channel(1);
        let handle = spawn(service.clone(), rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.status(), ServiceStatus::Running);

        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(service.status(), ServiceStatus::Stopped);
        let stats = service.stats();
        assert!(stats.cycles >= 1);
        assert_eq!(stats.cycles, stats.cycles_as_leader);
        assert!(stats.last_cycle.is_some());
    }

    #[tokio::test]
    async fn test_run_once_records_stats() {
        let service = ReadaheadService::new(engine().await);
        let report = service.run_once().await;
        assert!(report.leader);
        assert_eq!(report.candidates, 0);

        let stats = service.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.last_report, Some(report));
    }
}
