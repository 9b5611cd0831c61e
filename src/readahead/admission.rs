//! Which queries are kept fresh by readahead

use tracing::{debug, warn};

use super::SHADOW_LIST;
use crate::engine::traits::CacheStore;

/// Decide whether a live request should join the readahead set
///
/// The forcing header always admits. Otherwise a non-empty referrer is
/// required and must not contain any blacklisted substring.
pub fn should_add_to_readahead(
    forced_header_present: bool,
    referrer: Option<&str>,
    blacklist: &[String],
) -> bool {
    if forced_header_present {
        return true;
    }

    let Some(referrer) = referrer.filter(|r| !r.is_empty()) else {
        return false;
    };

    !blacklist
        .iter()
        .any(|blocked| referrer.contains(blocked.as_str()))
}

/// Add an admitted query key to the readahead set
///
/// Returns whether the key was written. Store failures are logged only.
pub async fn process_for_readahead(admitted: bool, store: &dyn CacheStore, query_key: &str) -> bool {
    if !admitted {
        return false;
    }

    match store.add_to_set(SHADOW_LIST, query_key).await {
        Ok(added) => {
            debug!(key = %query_key, new = added, "Query admitted to readahead");
            true
        }
        Err(e) => {
            warn!(key = %query_key, error = %e, "Could not add query to readahead set");
            false
        }
    }
}
