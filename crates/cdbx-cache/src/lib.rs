//! Bounded, LRU-evicting cache of recent [`CommandResult`]s keyed by command
//! id (spec §4.6). Combines two hard bounds with an adaptive, pluggable
//! memory-pressure signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use cdbx_core::CommandResult;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Reports system-wide memory load as a fraction of this provider's own
/// configured threshold (e.g. `0.9` means load is at 90% of threshold).
/// Implementations may fail (the host OS probe may be unavailable); a
/// failure is treated as "no pressure signal" rather than propagated.
pub trait MemoryPressureProvider: Send + Sync {
    fn load_fraction_of_threshold(&self) -> anyhow::Result<f64>;
}

/// Reports this process's private memory usage as a fraction of its own
/// configured threshold. Same exception discipline as
/// [`MemoryPressureProvider`].
pub trait ProcessMemoryProvider: Send + Sync {
    fn private_bytes_fraction_of_threshold(&self) -> anyhow::Result<f64>;
}

/// Default pressure sources reporting no pressure at all. The embedder
/// supplies a real OS-backed provider (spec §9's pluggable-interface
/// redesign note); this crate has no OS-probing dependency of its own.
pub struct NullPressureProvider;

impl MemoryPressureProvider for NullPressureProvider {
    fn load_fraction_of_threshold(&self) -> anyhow::Result<f64> {
        Ok(0.0)
    }
}

impl ProcessMemoryProvider for NullPressureProvider {
    fn private_bytes_fraction_of_threshold(&self) -> anyhow::Result<f64> {
        Ok(0.0)
    }
}

const SYSTEM_LOAD_PRESSURE_THRESHOLD: f64 = 0.85;
const PROCESS_MEMORY_PRESSURE_THRESHOLD: f64 = 0.75;

/// Hard and soft bounds enforced by the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheBounds {
    pub max_results: usize,
    pub max_memory_bytes: usize,
}

impl Default for CacheBounds {
    fn default() -> Self {
        Self {
            max_results: 500,
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Point-in-time counters retrievable for introspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry {
    result: CommandResult,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    total_size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct ResultCache {
    inner: Mutex<Inner>,
    bounds: CacheBounds,
    memory_pressure: Arc<dyn MemoryPressureProvider>,
    process_memory: Arc<dyn ProcessMemoryProvider>,
    disposed: AtomicBool,
}

impl ResultCache {
    pub fn new(bounds: CacheBounds) -> Self {
        Self::with_pressure_providers(
            bounds,
            Arc::new(NullPressureProvider),
            Arc::new(NullPressureProvider),
        )
    }

    /// `memory_pressure`/`process_memory` are `Arc`-shared rather than
    /// owned so the same provider instance can back a fresh cache each time
    /// a session restarts (spec §9's pluggable-provider redesign note).
    pub fn with_pressure_providers(
        bounds: CacheBounds,
        memory_pressure: Arc<dyn MemoryPressureProvider>,
        process_memory: Arc<dyn ProcessMemoryProvider>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total_size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            bounds,
            memory_pressure,
            process_memory,
            disposed: AtomicBool::new(false),
        }
    }

    /// Insert or overwrite the entry for `id`, then evict LRU victims until
    /// every hard bound and the adaptive pressure signal (if any) are
    /// satisfied. Silently a no-op once the cache is [`Self::dispose`]d.
    pub fn store(&self, id: &str, result: CommandResult, metadata: HashMap<String, String>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Utc::now();
        let size = result.approximate_size_bytes;

        if let Some(previous) = inner.entries.remove(id) {
            inner.total_size_bytes = inner.total_size_bytes.saturating_sub(current_size(&previous));
        }
        inner.entries.insert(
            id.to_string(),
            CacheEntry {
                result,
                metadata,
                created_at: now,
                last_accessed: now,
            },
        );
        inner.total_size_bytes += size;

        self.evict_until_within_bounds(&mut inner);
    }

    /// Return the cached result, bumping its `last_accessed` time. `None` if
    /// absent or the cache is disposed.
    pub fn get(&self, id: &str) -> Option<CommandResult> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.last_accessed = Utc::now();
            let result = entry.result.clone();
            inner.hits += 1;
            Some(result)
        } else {
            inner.misses += 1;
            None
        }
    }

    pub fn has(&self, id: &str) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .entries
            .contains_key(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if let Some(entry) = inner.entries.remove(id) {
            inner.total_size_bytes = inner.total_size_bytes.saturating_sub(current_size(&entry));
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.entries.clear();
        inner.total_size_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        CacheStats {
            entry_count: inner.entries.len(),
            total_size_bytes: inner.total_size_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Stop accepting stores; reads also return `None` from this point.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.clear();
    }

    fn evict_until_within_bounds(&self, inner: &mut Inner) {
        loop {
            let over_count = inner.entries.len() > self.bounds.max_results;
            let over_memory = inner.total_size_bytes > self.bounds.max_memory_bytes;
            let under_pressure = self.pressure_triggered();

            if !over_count && !over_memory && !under_pressure {
                break;
            }
            if inner.entries.is_empty() {
                break;
            }

            let victim_id = inner
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.last_accessed
                        .cmp(&b.last_accessed)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|(id, _)| id.clone());

            let Some(victim_id) = victim_id else { break };
            if let Some(entry) = inner.entries.remove(&victim_id) {
                inner.total_size_bytes = inner.total_size_bytes.saturating_sub(current_size(&entry));
                inner.evictions += 1;
                debug!(id = %victim_id, "evicted cache entry");
            }
        }
    }

    /// Strict `>` boundary: exact equality to a threshold never evicts.
    /// Provider exceptions are caught here and downgraded to "no pressure".
    fn pressure_triggered(&self) -> bool {
        let system_load = self
            .memory_pressure
            .load_fraction_of_threshold()
            .unwrap_or(0.0);
        let process_memory = self
            .process_memory
            .private_bytes_fraction_of_threshold()
            .unwrap_or(0.0);
        system_load > SYSTEM_LOAD_PRESSURE_THRESHOLD
            || process_memory > PROCESS_MEMORY_PRESSURE_THRESHOLD
    }
}

fn current_size(entry: &CacheEntry) -> usize {
    entry.result.approximate_size_bytes
}
