//! Fleet-wide leader lease for the readahead cycle
//!
//! A single `SET NX PX` attempt with a random token. The holder's hostname is
//! recorded next to the lease for diagnostics. A crashed leader is replaced
//! once the TTL runs out; release only deletes a lease still carrying our
//! token.

use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::{SHADOW_LOCK_KEY, SHADOW_SERVER_KEY};
use crate::engine::traits::CacheStore;
use crate::error::LockError;

/// Where a readahead instance stands with respect to the lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    NotLeader,
    AttemptingLease,
    Leader,
}

/// Proof of holding the lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderLease {
    pub token: String,
    pub hostname: String,
    pub ttl: Duration,
}

/// Try once to take the lease
///
/// `Ok(None)` when another instance holds it.
pub async fn acquire_lease(
    store: &dyn CacheStore,
    ttl: Duration,
) -> Result<Option<LeaderLease>, LockError> {
    let token = Uuid::new_v4().to_string();
    if !store.set_if_absent(SHADOW_LOCK_KEY, &token, ttl).await? {
        return Ok(None);
    }

    // The hostname is informational; the lease stands without it
    let hostname = hostname();
    if let Err(e) = store.set(SHADOW_SERVER_KEY, &hostname, ttl).await {
        warn!(host = %hostname, error = %e, "Could not record lease holder");
    }
    Ok(Some(LeaderLease {
        token,
        hostname,
        ttl,
    }))
}

/// Give the lease back if it is still ours
pub async fn release_lease(store: &dyn CacheStore, lease: &LeaderLease) -> Result<(), LockError> {
    if !store.delete_if_equals(SHADOW_LOCK_KEY, &lease.token).await? {
        return Err(LockError::NotHeld(lease.token.clone()));
    }
    store.delete(SHADOW_SERVER_KEY).await?;
    Ok(())
}

/// Attempt leadership, logging the outcome
///
/// Contention and store failures both mean "not leader".
pub async fn become_leader(store: &dyn CacheStore, ttl: Duration) -> Option<LeaderLease> {
    match acquire_lease(store, ttl).await {
        Ok(Some(lease)) => {
            info!(host = %lease.hostname, ttl_secs = ttl.as_secs(), "Lock acquired");
            Some(lease)
        }
        Ok(None) => {
            let holder = store
                .get(SHADOW_SERVER_KEY)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown".to_string());
            info!(holder = %holder, "Could not acquire lock");
            None
        }
        Err(e) => {
            error!(error = %e, "Lock backend failed while acquiring");
            None
        }
    }
}

/// Release leadership, logging failures
///
/// A failed release is harmless; the TTL frees the lease eventually.
pub async fn release_leader(store: &dyn CacheStore, lease: &LeaderLease) -> bool {
    match release_lease(store, lease).await {
        Ok(()) => {
            info!(host = %lease.hostname, "Lock released");
            true
        }
        Err(e) => {
            error!(error = %e, "Could not release lock");
            false
        }
    }
}

/// Name this instance reports as lease holder
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
