//! Cached proxy for KairosDB metadata endpoints
//!
//! Metric names, tag names and similar listings change slowly and are
//! expensive for KairosDB to compute, so they are cached verbatim for a
//! short TTL. Nothing is parsed on a hit.

use serde_json::json;
use tracing::{error, info, warn};

use crate::backend::error_messages;
use crate::engine::CacheEngine;
use crate::fingerprint::{fingerprint_raw, named_key};

/// A metadata endpoint and the name its entries are keyed under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataEndpoint {
    pub name: &'static str,
    pub path: &'static str,
}

pub const METRIC_NAMES: MetadataEndpoint = MetadataEndpoint {
    name: "metricnames",
    path: "/api/v1/metricnames",
};

pub const TAG_NAMES: MetadataEndpoint = MetadataEndpoint {
    name: "tagnames",
    path: "/api/v1/tagnames",
};

pub const TAG_VALUES: MetadataEndpoint = MetadataEndpoint {
    name: "tagvalues",
    path: "/api/v1/tagvalues",
};

pub const META_QUERY: MetadataEndpoint = MetadataEndpoint {
    name: "metaquery",
    path: "/api/v1/datapoints/query/tags",
};

/// Body and status to hand back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaResponse {
    pub status: u16,
    pub body: String,
}

impl MetaResponse {
    fn error(message: String) -> Self {
        Self {
            status: 500,
            body: json!({ "error": message }).to_string(),
        }
    }
}

/// Serve a metadata endpoint from cache, proxying on a miss
///
/// A `post_body` turns the request into a POST keyed by the body's
/// fingerprint; without one the endpoint is fetched with GET under a fixed
/// key. The store is optional: when it fails this is a plain proxy.
pub async fn metadata_caching(
    engine: &CacheEngine,
    name: &str,
    endpoint: &str,
    post_body: Option<&str>,
) -> MetaResponse {
    let post_body = post_body.filter(|b| !b.trim().is_empty());
    let key = match post_body {
        Some(body) => fingerprint_raw(body, name),
        None => named_key(name),
    };
    let store = engine.store();

    match store.get(&key).await {
        Ok(Some(body)) => {
            info!(key = %key, "Meta endpoint hit");
            engine.metrics().record_metadata(true);
            return MetaResponse { status: 200, body };
        }
        Ok(None) => {}
        Err(e) => {
            warn!(key = %key, error = %e, "Cache lookup failed, proxying");
            engine.metrics().record_store_error();
        }
    }
    info!(key = %key, "Meta endpoint miss");
    engine.metrics().record_metadata(false);

    let response = match engine.backend().proxy(endpoint, post_body).await {
        Ok(response) => response,
        Err(e) => {
            error!(key = %key, error = %e, "Metadata request failed");
            engine.metrics().record_backend_failure();
            return MetaResponse::error(e.to_string());
        }
    };

    if !response.is_success() {
        engine.metrics().record_backend_failure();
        return MetaResponse::error(format!(
            "Meta Endpoint: {}: KairosDB responded {}: {}",
            key,
            response.status,
            error_messages(&response.body)
        ));
    }

    let ttl = engine.config().expiry.ttl_for(name);
    if let Err(e) = store.set(&key, &response.body, ttl).await {
        error!(key = %key, error = %e, "Meta endpoint cache write failed");
        engine.metrics().record_store_error();
    }

    MetaResponse {
        status: response.status,
        body: response.body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::Config;
    use crate::engine::traits::CacheStore;
    use crate::engine::CacheEngineBuilder;
    use crate::error::BackendQueryFailure;
    use crate::store::InMemoryStore;
    use crate::testing::SyntheticBackend;

    const NAMES: &str = r#"{"results": ["cpu", "mem"]}"#;

    async fn engine_with(store: Arc<InMemoryStore>, backend: Arc<SyntheticBackend>) -> CacheEngine {
        CacheEngineBuilder::new()
            .with_shared_store(store)
            .with_shared_backend(backend)
            .with_config(Config::from_toml("[expiry]\nmetricnames = 60\n").unwrap())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new().with_proxy_route(METRIC_NAMES.path, 200, NAMES));
        let engine = engine_with(store.clone(), backend.clone()).await;

        let first = metadata_caching(&engine, METRIC_NAMES.name, METRIC_NAMES.path, None).await;
        assert_eq!(first, MetaResponse { status: 200, body: NAMES.to_string() });
        assert_eq!(
            store.get("tscached:metricnames").await.unwrap(),
            Some(NAMES.to_string())
        );

        let second = metadata_caching(&engine, METRIC_NAMES.name, METRIC_NAMES.path, None).await;
        assert_eq!(second.body, NAMES);
        assert_eq!(backend.proxy_calls().len(), 1);

        let s = engine.metrics().snapshot();
        assert_eq!((s.metadata_hits, s.metadata_misses), (1, 1));
    }

    #[tokio::test]
    async fn test_post_body_keyed_by_fingerprint() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new().with_proxy_route(META_QUERY.path, 200, "{}"));
        let engine = engine_with(store.clone(), backend.clone()).await;

        let body = r#"{"metrics": [{"name": "cpu"}], "start_relative": {"value": 1, "unit": "hours"}}"#;
        metadata_caching(&engine, META_QUERY.name, META_QUERY.path, Some(body)).await;

        let key = fingerprint_raw(body, "metaquery");
        assert!(key.starts_with("tscached:metaquery:"));
        assert_eq!(store.get(&key).await.unwrap(), Some("{}".to_string()));
        assert_eq!(
            backend.proxy_calls(),
            vec![(META_QUERY.path.to_string(), Some(body.to_string()))]
        );
    }

    #[tokio::test]
    async fn test_backend_error_reported_and_not_cached() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new().with_proxy_route(
            TAG_NAMES.path,
            400,
            r#"{"errors": ["bad", "worse"]}"#,
        ));
        let engine = engine_with(store.clone(), backend).await;

        let response = metadata_caching(&engine, TAG_NAMES.name, TAG_NAMES.path, None).await;
        assert_eq!(response.status, 500);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(
            body["error"],
            "Meta Endpoint: tscached:tagnames: KairosDB responded 400: bad, worse"
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new());
        backend.fail_with(BackendQueryFailure::Connection("connection refused".to_string()));
        let engine = engine_with(store, backend).await;

        let response = metadata_caching(&engine, TAG_VALUES.name, TAG_VALUES.path, None).await;
        assert_eq!(response.status, 500);
        assert!(response.body.contains("Could not connect to KairosDB: connection refused"));
    }

    #[tokio::test]
    async fn test_store_outage_proxies() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(SyntheticBackend::new().with_proxy_route(METRIC_NAMES.path, 200, NAMES));
        let engine = engine_with(store.clone(), backend.clone()).await;
        store.set_available(false);

        for _ in 0..2 {
            let response = metadata_caching(&engine, METRIC_NAMES.name, METRIC_NAMES.path, None).await;
            assert_eq!(response.status, 200);
            assert_eq!(response.body, NAMES);
        }
        assert_eq!(backend.proxy_calls().len(), 2);
    }

    #[test]
    fn test_configured_ttl() {
        let config = Config::from_toml("[expiry]\nmetricnames = 60\n").unwrap();
        assert_eq!(config.expiry.ttl_for("metricnames"), Duration::from_secs(60));
        assert_eq!(config.expiry.ttl_for("tagnames"), Duration::from_secs(300));
    }
}
