//! Per-process cache of resolved descriptors, keyed by stats key.
//!
//! Lookup and insertion happen in one critical section, so concurrent scrapes
//! that meet the same new key resolve it once and share one descriptor.
//! Unresolved keys are not remembered and will be resolved again next time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::resolve::{MetricDescriptor, Resolution};

/// Result of [`DescriptorCache::get_or_resolve`].
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Key was already cached.
    Hit(Arc<MetricDescriptor>),
    /// Key was resolved by this call and is now cached.
    Inserted(Arc<MetricDescriptor>),
    /// Key does not map to any configured metric.
    Unresolved,
}

impl CacheLookup {
    pub fn descriptor(self) -> Option<Arc<MetricDescriptor>> {
        match self {
            CacheLookup::Hit(d) | CacheLookup::Inserted(d) => Some(d),
            CacheLookup::Unresolved => None,
        }
    }
}

/// Counters describing cache use since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    /// Number of times the resolver was run, unresolved keys included.
    pub resolutions: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, Arc<MetricDescriptor>>,
    hits: u64,
    resolutions: u64,
}

#[derive(Debug, Default)]
pub struct DescriptorCache {
    inner: Mutex<CacheInner>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-inserted entry,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached descriptor for `raw_key`, running `resolve` and
    /// caching its result on a miss.
    pub fn get_or_resolve<F>(&self, raw_key: &str, resolve: F) -> CacheLookup
    where
        F: FnOnce(&str) -> Resolution,
    {
        let mut inner = self.lock();
        if let Some(descriptor) = inner.entries.get(raw_key) {
            let descriptor = Arc::clone(descriptor);
            inner.hits += 1;
            return CacheLookup::Hit(descriptor);
        }

        inner.resolutions += 1;
        match resolve(raw_key) {
            Resolution::Resolved(descriptor) => {
                let descriptor = Arc::new(descriptor);
                inner
                    .entries
                    .insert(raw_key.to_string(), Arc::clone(&descriptor));
                CacheLookup::Inserted(descriptor)
            }
            Resolution::Unresolved => CacheLookup::Unresolved,
        }
    }

    pub fn get(&self, raw_key: &str) -> Option<Arc<MetricDescriptor>> {
        self.lock().entries.get(raw_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            resolutions: inner.resolutions,
        }
    }
}
