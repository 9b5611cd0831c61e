//! Redis cache store
//!
//! The connection is established lazily and re-established after a failed
//! connect, so a store outage at startup only turns the cache into a proxy.
//! With Sentinel configured, the master is looked up on every (re)connect
//! and a dropped connection is discarded, so a failover is followed on the
//! next call.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use redis::{AsyncCommands, RedisConnectionInfo};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{RedisConfig, SentinelConfig};
use crate::engine::traits::CacheStore;
use crate::error::StoreError;

/// Deletes KEYS[1] only while it still holds ARGV[1]
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Where connections go
enum Target {
    /// A fixed Redis URL
    Direct(redis::Client),
    /// Whatever master Sentinel currently reports
    Sentinel {
        sentinel: Mutex<Sentinel>,
        master_name: String,
        node_info: SentinelNodeConnectionInfo,
    },
}

/// Cache store backed by a single Redis master
pub struct RedisStore {
    target: Target,
    manager: Mutex<Option<ConnectionManager>>,
    timeout: Duration,
    compare_and_delete: redis::Script,
}

impl RedisStore {
    /// Create a store for the configured URL (or Sentinel nodes) without connecting yet
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let target = match &config.sentinel {
            Some(sentinel) => sentinel_target(sentinel)?,
            None => Target::Direct(redis::Client::open(config.url.as_str())?),
        };
        Ok(Self {
            target,
            manager: Mutex::new(None),
            timeout: config.timeout(),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    /// Client for the current master
    async fn client(&self) -> Result<redis::Client, StoreError> {
        match &self.target {
            Target::Direct(client) => Ok(client.clone()),
            Target::Sentinel {
                sentinel,
                master_name,
                node_info,
            } => {
                let mut sentinel = sentinel.lock().await;
                let client = self
                    .bounded(sentinel.async_master_for(master_name, Some(node_info)))
                    .await?;
                info!(master = %master_name, "Resolved Redis master through Sentinel");
                Ok(client)
            }
        }
    }

    /// Shared multiplexed connection, connecting on first use
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        let client = self.client().await?;
        let manager = self.bounded(ConnectionManager::new(client)).await?;
        info!(timeout_ms = self.timeout.as_millis() as u64, "Connected to Redis");
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Run a store call under the configured timeout
    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let outcome = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        // Only contended while connecting, when nothing is cached yet
        if matches!(outcome, Err(StoreError::Connection(_))) && self.follows_failover() {
            if let Ok(mut guard) = self.manager.try_lock() {
                if guard.take().is_some() {
                    warn!("Redis connection lost, master will be resolved again");
                }
            }
        }
        outcome
    }

    fn follows_failover(&self) -> bool {
        matches!(self.target, Target::Sentinel { .. })
    }
}

fn sentinel_target(config: &SentinelConfig) -> Result<Target, StoreError> {
    if config.nodes.is_empty() {
        return Err(StoreError::Command(
            "redis.sentinel.nodes must not be empty".to_string(),
        ));
    }

    let sentinel = Sentinel::build(config.nodes.iter().map(String::as_str).collect::<Vec<_>>())?;
    let node_info = SentinelNodeConnectionInfo {
        tls_mode: None,
        redis_connection_info: Some(RedisConnectionInfo {
            password: config.password.clone(),
            ..Default::default()
        }),
    };
    Ok(Target::Sentinel {
        sentinel: Mutex::new(sentinel),
        master_name: config.master_name.clone(),
        node_info,
    })
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    fn store_id(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get(key)).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        let values: Vec<Option<String>> = self.bounded(pipe.query_async(&mut conn)).await?;
        debug!(requested = keys.len(), found = values.iter().flatten().count(), "Pipelined GET");
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.pset_ex(key, value, ttl_millis(ttl))).await
    }

    async fn set_many(&self, entries: &[(String, String, Duration)]) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for (key, value, ttl) in entries {
            pipe.pset_ex(key, value, ttl_millis(*ttl)).ignore();
        }
        let () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(entries.len())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let added: i64 = self.bounded(conn.sadd(key, member)).await?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self.bounded(conn.srem(key, member)).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.smembers(key)).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl));
        let reply: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.compare_and_delete.key(key);
        invocation.arg(expected);
        let removed: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(removed > 0)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(redis::cmd("FLUSHALL").query_async(&mut conn))
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _pong: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            timeout_ms: 100,
            sentinel: None,
        };
        assert!(RedisStore::new(&config).is_err());
    }

    #[test]
    fn test_sentinel_target_selected() {
        let sentinel = SentinelConfig {
            nodes: vec!["redis://127.0.0.1:26379".to_string()],
            master_name: "tscached".to_string(),
            password: None,
        };
        let config = RedisConfig {
            sentinel: Some(sentinel.clone()),
            ..Default::default()
        };
        let store = RedisStore::new(&config).unwrap();
        assert!(store.follows_failover());
        assert!(!RedisStore::new(&RedisConfig::default()).unwrap().follows_failover());

        let empty = RedisConfig {
            sentinel: Some(SentinelConfig {
                nodes: Vec::new(),
                ..sentinel
            }),
            ..Default::default()
        };
        assert!(RedisStore::new(&empty).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_fast() {
        // Nothing listens on port 1
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 200,
            sentinel: None,
        };
        let store = RedisStore::new(&config).unwrap();
        assert_eq!(store.store_id(), "redis");

        let err = store.get("tscached:missing").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::Command(_)
        ));
        assert!(store.manager.lock().await.is_none());
    }

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(3)), 3_000);
    }
}
