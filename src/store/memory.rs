//! In-process cache store
//!
//! Single-node stand-in for Redis with the same TTL and set semantics.
//! Useful for tests and for running a lone instance without a store.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::traits::CacheStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum StoredValue {
    Scalar(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-memory store with lazy expiry
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with a connection error
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Remaining time to live of a key, `None` when missing or persistent
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = Self::live_entry(&mut entries, key, now)?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// True when no live keys remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connection("in-memory store marked unavailable".to_string()))
        }
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn scalar(entry: &Entry, key: &str) -> Result<String, StoreError> {
        match &entry.value {
            StoredValue::Scalar(s) => Ok(s.clone()),
            StoredValue::Set(_) => Err(wrong_type(key)),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

#[async_trait]
impl CacheStore for InMemoryStore {
    fn store_id(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key, Instant::now()) {
            Some(entry) => Self::scalar(entry, key).map(Some),
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        keys.iter()
            .map(|key| match Self::live_entry(&mut entries, key, now) {
                // MGET answers nil for keys of another type
                Some(entry) => Ok(Self::scalar(entry, key).ok()),
                None => Ok(None),
            })
            .collect()
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: StoredValue::Scalar(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_many(&self, items: &[(String, String, Duration)]) -> Result<usize, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for (key, value, ttl) in items {
            entries.insert(
                key.clone(),
                Entry {
                    value: StoredValue::Scalar(value.clone()),
                    expires_at: Some(now + *ttl),
                },
            );
        }
        Ok(items.len())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let existed = Self::live_entry(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = Self::live_entry(&mut entries, key, now) {
            return match &mut entry.value {
                StoredValue::Set(members) => Ok(members.insert(member.to_string())),
                StoredValue::Scalar(_) => Err(wrong_type(key)),
            };
        }

        let mut members = BTreeSet::new();
        members.insert(member.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Set(members),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        let Some(entry) = Self::live_entry(&mut entries, key, Instant::now()) else {
            return Ok(false);
        };
        let (removed, now_empty) = match &mut entry.value {
            StoredValue::Set(members) => (members.remove(member), members.is_empty()),
            StoredValue::Scalar(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key, Instant::now()) {
            Some(entry) => match &entry.value {
                StoredValue::Set(members) => Ok(members.iter().cloned().collect()),
                StoredValue::Scalar(_) => Err(wrong_type(key)),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Scalar(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let matches = match Self::live_entry(&mut entries, key, now) {
            Some(Entry {
                value: StoredValue::Scalar(current),
                ..
            }) => current == expected,
            _ => false,
        };
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.lock().clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
