//! Read-through feature lookups for joined item visits.
//!
//! Only consulted when the join runs with `enable_cache`. Lookups never
//! happen while a registry or session lock is held.

use crate::event::{Attributes, ItemRef};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default number of cached entries before eviction.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Error during a feature store lookup.
#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("connection error: {0}")]
    Connection(String),
}

/// External key-value store holding per-item features.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Features for `item` within `tenant`, or `None` when the item is unknown.
    async fn lookup(&self, tenant: &str, item: &ItemRef) -> Result<Option<Attributes>, FeatureError>;

    /// Store name for logging.
    fn store_name(&self) -> &str;
}

/// Fixed in-memory feature table.
#[derive(Default)]
pub struct StaticFeatureStore {
    entries: FxHashMap<(String, ItemRef), Attributes>,
}

impl StaticFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, tenant: &str, item: ItemRef, features: Attributes) -> Self {
        self.entries.insert((tenant.to_string(), item), features);
        self
    }
}

#[async_trait]
impl FeatureStore for StaticFeatureStore {
    async fn lookup(&self, tenant: &str, item: &ItemRef) -> Result<Option<Attributes>, FeatureError> {
        Ok(self.entries.get(&(tenant.to_string(), item.clone())).cloned())
    }

    fn store_name(&self) -> &str {
        "static"
    }
}

/// Result of a cached feature lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLookup {
    /// Features for the item, `None` when the store does not know it
    pub features: Option<Attributes>,
    /// Whether this result came from cache
    pub cached: bool,
}

/// A single cached lookup result with expiry time.
struct CacheEntry {
    features: Option<Attributes>,
    expires_at: Instant,
}

/// Thread-safe TTL cache in front of a [`FeatureStore`].
///
/// Misses are cached too, so unknown items do not hit the store on every
/// visit.
pub struct FeatureCache {
    store: Arc<dyn FeatureStore>,
    entries: Mutex<FxHashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FeatureCache {
    pub fn new(store: Arc<dyn FeatureStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: Mutex::new(FxHashMap::default()),
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Look up features, consulting the store on a miss or expiry.
    pub async fn get(&self, tenant: &str, item: &ItemRef) -> Result<FeatureLookup, FeatureError> {
        let key = format!("{}/{}", tenant, item);
        if let Some(features) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(FeatureLookup {
                features,
                cached: true,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let features = self.store.lookup(tenant, item).await?;
        self.insert(key, features.clone());
        Ok(FeatureLookup {
            features,
            cached: false,
        })
    }

    fn cached(&self, key: &str) -> Option<Option<Attributes>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.features.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: String, features: Option<Attributes>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_entries {
            // Drop expired entries first, then ~10% of whatever is left
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                let to_remove = (self.max_entries / 10).max(1);
                let victims: Vec<String> = entries.keys().take(to_remove).cloned().collect();
                for k in victims {
                    entries.remove(&k);
                }
            }
        }
        entries.insert(
            key,
            CacheEntry {
                features,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn store_name(&self) -> &str {
        self.store.store_name()
    }
}
