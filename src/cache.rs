// src/cache.rs

//! Content-addressed memoization of node results.
//!
//! The key (fingerprint) is a blake3 hash over a canonical JSON encoding of
//! `{ "work_item": ..., "params": ... }`, where params with keys starting
//! with `_` are excluded. Callers opt out per call with `"_cache": false`.
//! A miss always falls through to real execution.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use blake3::Hasher;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::eviction::{EvictionPolicy, NoEviction};
use crate::types::Params;

/// Private control parameter that disables caching for one call.
pub const CACHE_CONTROL_PARAM: &str = "_cache";

/// Whether the params opt out of caching (`"_cache": false`).
pub fn caching_disabled(params: &Params) -> bool {
    matches!(params.get(CACHE_CONTROL_PARAM), Some(Value::Bool(false)))
}

/// Stable cache key for a work item and its non-private params.
pub fn fingerprint(work_item: &str, params: &Params) -> String {
    let public: Map<String, Value> = params
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let doc = canonicalize(&json!({ "work_item": work_item, "params": Value::Object(public) }));

    let mut hasher = Hasher::new();
    // Serializing a `Value` cannot fail.
    let encoded = serde_json::to_vec(&doc).unwrap_or_default();
    hasher.update(&encoded);
    hasher.finalize().to_hex().to_string()
}

/// Rebuild objects with keys inserted in sorted order, at every depth, so the
/// encoding is stable whichever map implementation backs `serde_json`.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, Value>,
    /// Insertion order, oldest first.
    order: VecDeque<(String, Instant)>,
}

/// Shared result cache. Reads take a read lock; inserts take the write lock.
#[derive(Debug)]
pub struct ResultCache {
    inner: RwLock<CacheInner>,
    policy: Arc<dyn EvictionPolicy>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    /// Unbounded cache.
    pub fn new() -> Self {
        Self::with_policy(Arc::new(NoEviction))
    }

    pub fn with_policy(policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached result for this work item and params, if any.
    pub fn lookup(&self, work_item: &str, params: &Params) -> Option<Value> {
        if caching_disabled(params) {
            return None;
        }
        let key = fingerprint(work_item, params);
        let found = self.read().entries.get(&key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(work_item, key = %key, "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Record a result. Overwrites any previous value for the same key.
    pub fn store(&self, work_item: &str, params: &Params, result: Value) {
        if caching_disabled(params) {
            return;
        }
        let key = fingerprint(work_item, params);
        let mut inner = self.write();
        if inner.entries.insert(key.clone(), result).is_none() {
            inner.order.push_back((key, Instant::now()));
        }

        while let Some((oldest, inserted)) = inner.order.front() {
            if !self.policy.should_evict(inner.entries.len(), inserted.elapsed()) {
                break;
            }
            let oldest = oldest.clone();
            inner.order.pop_front();
            inner.entries.remove(&oldest);
            debug!(key = %oldest, "cache entry evicted");
        }
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
