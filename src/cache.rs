//! Retired-pair freelist, keyed per scheduling unit.
//!
//! Tearing down a pipe pair and re-allocating ring storage on the next
//! `create_pipe` is pure allocator churn under fork/exec-style loads, so
//! retired pairs are parked here and revived instead. Each shard belongs
//! to one scheduling unit and is bounded; surplus pairs are actually
//! freed. The cache also owns the storage-quota ledger: a pair holds its
//! reservation for as long as it exists, cached or not.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;

use crate::config::PipeConfig;
use crate::error::{PipeError, PipeResult};
use crate::pair::PipePair;

/// Scheduling-unit key for cache shards. Derived from the calling
/// thread's identity; an embedding with real CPU affinity can construct
/// its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinityId(pub u64);

impl AffinityId {
    pub fn current() -> Self {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// Counters exposed for inspection, the sysctl-statistics equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Pairs revived from the freelist
    pub hits: u64,
    /// Pairs built from fresh allocations
    pub misses: u64,
    /// Retired pairs currently parked
    pub cached: usize,
    /// Live ring bytes counted against the quota
    pub storage_in_use: usize,
}

/// Bounded freelist of retired pipe pairs plus the storage-quota ledger.
/// Injected into `create_pipe`; endpoint handles keep it alive for their
/// own retirement, so dropping the `PairCache` early is fine.
pub struct PairCache {
    inner: Arc<CacheInner>,
}

impl PairCache {
    pub fn new(config: &PipeConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                shards: spin::Mutex::new(HashMap::new()),
                default_capacity: config.effective_capacity(),
                max_cached: config.max_cached_pairs,
                storage_quota: config.storage_quota,
                storage_in_use: AtomicUsize::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let cached = self.inner.shards.lock().values().map(Vec::len).sum();
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            cached,
            storage_in_use: self.inner.storage_in_use.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn obtain(&self, config: &PipeConfig) -> PipeResult<Arc<PipePair>> {
        self.inner.obtain(config)
    }

    pub(crate) fn inner(&self) -> &Arc<CacheInner> {
        &self.inner
    }
}

pub(crate) struct CacheInner {
    shards: spin::Mutex<HashMap<u64, Vec<PipePair>>>,
    default_capacity: usize,
    max_cached: usize,
    storage_quota: usize,
    storage_in_use: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheInner {
    fn obtain(self: &Arc<Self>, config: &PipeConfig) -> PipeResult<Arc<PipePair>> {
        let capacity = config.effective_capacity();
        if capacity == self.default_capacity {
            let recycled = self
                .shards
                .lock()
                .get_mut(&AffinityId::current().0)
                .and_then(Vec::pop);
            if let Some(mut pair) = recycled {
                pair.revive(config);
                self.hits.fetch_add(1, Ordering::Relaxed);
                log::trace!("pipe pair {} revived from cache", pair.id());
                return Ok(Arc::new(pair));
            }
        }

        self.reserve(2 * capacity)?;
        self.misses.fetch_add(1, Ordering::Relaxed);
        let reservation = Reservation {
            ledger: Arc::downgrade(self),
            bytes: 2 * capacity,
        };
        Ok(Arc::new(PipePair::new(config, reservation)))
    }

    /// Park a retired pair, or free it when it does not fit the cache.
    pub(crate) fn retire(&self, pair: PipePair) {
        if pair.capacity() != self.default_capacity {
            log::trace!("pipe pair {} freed, non-default capacity", pair.id());
            return;
        }
        let mut shards = self.shards.lock();
        let shard = shards
            .entry(AffinityId::current().0)
            .or_insert_with(Vec::new);
        if shard.len() >= self.max_cached {
            log::trace!("pipe pair {} freed, cache shard full", pair.id());
            return;
        }
        shard.push(pair);
    }

    fn reserve(&self, bytes: usize) -> PipeResult<()> {
        let mut current = self.storage_in_use.load(Ordering::SeqCst);
        loop {
            if current + bytes > self.storage_quota {
                log::warn!(
                    "pipe storage quota exhausted: {} in use, {} requested, {} allowed",
                    current,
                    bytes,
                    self.storage_quota
                );
                return Err(PipeError::ResourceExhausted);
            }
            match self.storage_in_use.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.storage_in_use.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// A pair's claim on the storage quota, returned when the pair is freed.
/// Holds the ledger weakly so cached pairs do not keep their own cache
/// alive.
pub(crate) struct Reservation {
    ledger: Weak<CacheInner>,
    bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.upgrade() {
            ledger.release(self.bytes);
        }
    }
}
