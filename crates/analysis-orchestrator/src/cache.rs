use analysis_core::{AcceptedRequest, CacheStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Internal cache entry with timestamp
struct CacheEntry {
    value: serde_json::Value,
    inserted_at: Instant,
    ttl: Duration,
    hits: u64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.inserted_at))
    }
}

/// Read-only view of an entry handed to eviction predicates.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo<'a> {
    pub key: &'a str,
    pub age: Duration,
    pub ttl: Duration,
    pub hits: u64,
    pub size_bytes: usize,
}

/// Envelope written to the persistent store so a reader can recover the remaining TTL.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    value: serde_json::Value,
    ttl_ms: u64,
    stored_at: DateTime<Utc>,
}

/// Normalized request shape that feeds the cache key.
#[derive(Serialize)]
struct KeyShape<'a> {
    mode: &'static str,
    symbols: Vec<&'a str>,
    sector_id: Option<String>,
    max_results: usize,
    providers: Vec<&'static str>,
}

/// Two-level result cache: in-process map in front of an optional persistent store.
pub struct CacheLayer {
    entries: DashMap<String, CacheEntry>,
    store: Option<Arc<dyn CacheStore>>,
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheLayer {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deterministic key for a request. Symbol order, timeout and request id do not matter.
    pub fn derive_key(request: &AcceptedRequest) -> String {
        let mut symbols: Vec<&str> = request.symbols.iter().map(String::as_str).collect();
        symbols.sort_unstable();

        let mut providers: Vec<&'static str> = request.providers.iter().map(|p| p.name()).collect();
        providers.sort_unstable();

        let shape = KeyShape {
            mode: request.mode.as_str(),
            symbols,
            sector_id: request.sector_id.as_ref().map(|s| s.to_lowercase()),
            max_results: request.max_results,
            providers,
        };

        // Serializing a struct of vectors has a fixed field order, so the digest is stable.
        let canonical = serde_json::to_vec(&shape).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        format!("analysis:{}:{}", request.mode.as_str(), hex::encode(digest))
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    entry.hits += 1;
                    return Some(entry.value.clone());
                }
            }
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }

        let store = self.store.as_ref()?;
        match store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<StoredEntry>(&raw) {
                Ok(stored) => {
                    let age = (Utc::now() - stored.stored_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let remaining = Duration::from_millis(stored.ttl_ms).saturating_sub(age);
                    if remaining.is_zero() {
                        return None;
                    }
                    tracing::debug!("Cache store hit for {}", key);
                    self.insert_local(key, stored.value.clone(), remaining);
                    Some(stored.value)
                }
                Err(e) => {
                    tracing::warn!("Discarding unreadable cache store entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Cache store read failed for {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        if let Some(store) = &self.store {
            let stored = StoredEntry {
                value: value.clone(),
                ttl_ms: ttl.as_millis() as u64,
                stored_at: Utc::now(),
            };
            match serde_json::to_string(&stored) {
                Ok(raw) => {
                    if let Err(e) = store.set(key, &raw, ttl).await {
                        tracing::warn!("Cache store write failed for {}: {}", key, e);
                    }
                }
                Err(e) => tracing::warn!("Could not serialize cache entry {}: {}", key, e),
            }
        }
        self.insert_local(key, value, ttl);
    }

    fn insert_local(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let size_bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                hits: 0,
                size_bytes,
            },
        );
    }

    /// Remove entries matching `predicate` from the in-process map and delete the
    /// same keys from the store. Returns how many in-process entries were removed.
    pub async fn evict<F>(&self, predicate: F) -> usize
    where
        F: Fn(&EntryInfo<'_>) -> bool,
    {
        let now = Instant::now();
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| {
                let info = EntryInfo {
                    key: entry.key(),
                    age: now.saturating_duration_since(entry.inserted_at),
                    ttl: entry.ttl,
                    hits: entry.hits,
                    size_bytes: entry.size_bytes,
                };
                predicate(&info)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let removed = doomed
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count();

        if let Some(store) = &self.store {
            for key in &doomed {
                if let Err(e) = store.delete(key).await {
                    tracing::warn!("Cache store delete failed for {}: {}", key, e);
                }
            }
        }
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Drop expired entries, then the least used `fraction` of what is left
    /// (fewest hits first, soonest to expire breaking ties).
    pub fn evict_low_value(&self, fraction: f64) -> usize {
        let mut removed = self.purge_expired();

        let now = Instant::now();
        let mut ranked: Vec<(String, u64, Duration)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.hits, entry.remaining(now)))
            .collect();
        let target = (ranked.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        if target == 0 {
            return removed;
        }

        ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        for (key, _, _) in ranked.into_iter().take(target) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Give freed capacity back to the allocator.
    pub fn shrink(&self) {
        self.entries.shrink_to_fit();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
