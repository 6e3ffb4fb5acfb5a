use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::error::{GraphError, Result};
use crate::storage::block::Block;
use crate::storage::csr::BlockedCSR;
use crate::storage::record::BlockId;

/// Thread-safe counters for cache traffic.
#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    synthesized: AtomicU64,
    evictions: AtomicU64,
}

/// A point-in-time copy of [`CacheMetrics`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub synthesized: u64,
    pub evictions: u64,
    pub resident_blocks: u64,
    pub resident_bytes: u64,
}

struct CacheInner {
    resident: FxHashMap<BlockId, Arc<Block>>,
    // Insertion order; eviction scans from the front.
    fifo: VecDeque<BlockId>,
    // Blocks some thread is currently reading from disk.
    loading: FxHashSet<BlockId>,
    current_bytes: u64,
}

/// Residency set of in-memory blocks under a byte budget.
///
/// Eviction is FIFO over insertion order and skips pinned blocks: a block
/// is pinned while any [`Arc`] handed out by [`HotCache::get`] is still
/// alive (an outstanding adjacency iterator), so the strong count is the
/// per-block borrow count. Evicted blocks that are not yet on disk are
/// written back first, so eviction never loses data.
///
/// A cold load that finds no file synthesizes an empty block: vertices
/// without edges answer queries with empty iterators, not errors.
pub struct HotCache {
    csr: Arc<BlockedCSR>,
    inner: Mutex<CacheInner>,
    loaded: Condvar,
    max_bytes: u64,
    block_size: u32,
    hot_block_threshold: u32,
    metrics: CacheMetrics,
}

impl HotCache {
    pub fn new(
        csr: Arc<BlockedCSR>,
        max_bytes: u64,
        block_size: u32,
        hot_block_threshold: u32,
    ) -> Self {
        Self {
            csr,
            inner: Mutex::new(CacheInner {
                resident: FxHashMap::default(),
                fifo: VecDeque::new(),
                loading: FxHashSet::default(),
                current_bytes: 0,
            }),
            loaded: Condvar::new(),
            max_bytes,
            block_size,
            hot_block_threshold,
            metrics: CacheMetrics::default(),
        }
    }

    /// Returns the resident block, loading (or synthesizing) it on a miss.
    ///
    /// The lock is held across residency mutation only; disk I/O happens
    /// with a "loading" placeholder in place so no block is loaded twice
    /// concurrently.
    pub fn get(&self, block_id: BlockId) -> Result<Arc<Block>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(block) = inner.resident.get(&block_id) {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(block));
            }
            if inner.loading.contains(&block_id) {
                self.loaded.wait(&mut inner);
                continue;
            }
            break;
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        inner.loading.insert(block_id);
        drop(inner);

        let loaded = match self.csr.load(block_id) {
            Ok(block) => {
                self.metrics.loads.fetch_add(1, Ordering::Relaxed);
                Ok(block)
            }
            Err(GraphError::BlockNotFound { .. }) => {
                self.metrics.synthesized.fetch_add(1, Ordering::Relaxed);
                trace!(block_id, "cache.synthesize_empty");
                Ok(Block::empty(block_id, self.block_size))
            }
            Err(other) => Err(other),
        };

        let mut inner = self.inner.lock();
        inner.loading.remove(&block_id);
        let result = match loaded {
            Ok(block) => {
                let block = Arc::new(block);
                self.insert_locked(&mut inner, block_id, Arc::clone(&block))?;
                Ok(block)
            }
            Err(e) => Err(e),
        };
        self.loaded.notify_all();
        result
    }

    /// Inserts a finalized block into the residency set, evicting as
    /// needed.
    pub fn add_hot(&self, block: Block) -> Result<Arc<Block>> {
        debug_assert!(block.is_finalized(), "add_hot requires a finalized block");
        let block_id = block.block_id;
        let block = Arc::new(block);
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, block_id, Arc::clone(&block))?;
        Ok(block)
    }

    /// Evicts until resident bytes drop to `max_bytes * ratio` or only
    /// pinned blocks remain.
    pub fn shrink(&self, ratio: f64) -> Result<()> {
        let target = (self.max_bytes as f64 * ratio) as u64;
        let mut inner = self.inner.lock();
        while inner.current_bytes > target {
            if !self.evict_one_locked(&mut inner)? {
                break;
            }
        }
        debug!(
            target_bytes = target,
            resident_bytes = inner.current_bytes,
            "cache.shrink"
        );
        Ok(())
    }

    /// Drops cold-tier blocks (`block_id >= hot_block_threshold`) that
    /// were kept resident only for ingest locality, and recomputes the
    /// byte counter. Pinned blocks stay.
    pub fn release_import_temp(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let cold_ids: Vec<BlockId> = inner
            .resident
            .keys()
            .copied()
            .filter(|&id| id >= self.hot_block_threshold)
            .collect();
        for block_id in cold_ids {
            let pinned = inner
                .resident
                .get(&block_id)
                .map(|b| Arc::strong_count(b) > 1)
                .unwrap_or(false);
            if pinned {
                continue;
            }
            self.write_back_locked(&inner, block_id)?;
            inner.resident.remove(&block_id);
            inner.fifo.retain(|&id| id != block_id);
        }
        inner.current_bytes = inner.resident.values().map(|b| b.mem_bytes()).sum();
        info!(
            resident_blocks = inner.resident.len(),
            resident_bytes = inner.current_bytes,
            "cache.release_import_temp"
        );
        Ok(())
    }

    pub fn resident_bytes(&self) -> u64 {
        self.inner.lock().current_bytes
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.inner.lock().resident.contains_key(&block_id)
    }

    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        let inner = self.inner.lock();
        CacheMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            loads: self.metrics.loads.load(Ordering::Relaxed),
            synthesized: self.metrics.synthesized.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            resident_blocks: inner.resident.len() as u64,
            resident_bytes: inner.current_bytes,
        }
    }

    fn insert_locked(
        &self,
        inner: &mut CacheInner,
        block_id: BlockId,
        block: Arc<Block>,
    ) -> Result<()> {
        let bytes = block.mem_bytes();
        if let Some(previous) = inner.resident.insert(block_id, block) {
            inner.current_bytes -= previous.mem_bytes();
        } else {
            inner.fifo.push_back(block_id);
        }
        inner.current_bytes += bytes;
        while inner.current_bytes > self.max_bytes {
            if !self.evict_one_locked(inner)? {
                break;
            }
        }
        Ok(())
    }

    // Evicts the oldest unpinned resident block, writing it back to disk
    // first when it holds records not yet persisted. Returns false when
    // every resident block is pinned.
    fn evict_one_locked(&self, inner: &mut CacheInner) -> Result<bool> {
        let victim_pos = inner.fifo.iter().position(|id| {
            inner
                .resident
                .get(id)
                .map(|block| Arc::strong_count(block) == 1)
                .unwrap_or(false)
        });
        let Some(pos) = victim_pos else {
            return Ok(false);
        };
        let block_id = inner.fifo.remove(pos).expect("position is in range");
        self.write_back_locked(inner, block_id)?;
        if let Some(block) = inner.resident.remove(&block_id) {
            inner.current_bytes -= block.mem_bytes();
        }
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(block_id, "cache.evict");
        Ok(true)
    }

    fn write_back_locked(&self, inner: &CacheInner, block_id: BlockId) -> Result<()> {
        let Some(block) = inner.resident.get(&block_id) else {
            return Ok(());
        };
        if block.record_count() > 0 && !self.csr.has_block(block_id) {
            self.csr.save(block)?;
        }
        Ok(())
    }
}
