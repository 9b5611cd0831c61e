//! Operator endpoints

use tracing::{error, info, warn};

use crate::engine::CacheEngine;
use crate::readahead::become_leader;

/// Crate version reported by `/version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Value of `orly` that confirms a flush
pub const FLUSH_CONFIRMATION: &str = "yarly";

pub const REFUSED_MESSAGE: &str =
    "Cowardly refusing to act, add orly=yarly to execute Redis FLUSHALL.";

pub const LOCK_BUSY_MESSAGE: &str =
    "Could not acquire shadow lock. Is shadow load taking place? (Or just try again.)";

/// Drop every cached entry
///
/// Requires explicit confirmation and the readahead lease, so no readahead
/// cycle rewrites entries while they are being dropped. The lease itself is
/// flushed with everything else.
pub async fn flushall(engine: &CacheEngine, confirm: Option<&str>) -> String {
    if confirm != Some(FLUSH_CONFIRMATION) {
        return REFUSED_MESSAGE.to_string();
    }

    let store = engine.store().as_ref();
    let ttl = engine.config().shadow.leader_expiration();
    if become_leader(store, ttl).await.is_none() {
        warn!("Flushall could not acquire shadow lock");
        return LOCK_BUSY_MESSAGE.to_string();
    }

    info!("Flushall acquired shadow lock");
    match store.flush_all().await {
        Ok(()) => "Redis FLUSHALL executed; received response: OK".to_string(),
        Err(e) => {
            error!(error = %e, "FLUSHALL failed");
            format!("Redis FLUSHALL failed: {}", e)
        }
    }
}
