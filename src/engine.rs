use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::cache::{CacheMetricsSnapshot, HotCache};
use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::intern::{LabelInterner, VertexInterner};
use crate::loader::{IngestStats, Loader};
use crate::memory::{set_process_mem_limit, MemoryMonitor, MemoryPool};
use crate::query::{AdjIterator, QueryManager};
use crate::storage::csr::BlockedCSR;
use crate::storage::record::{Direction, VertexId};

/// The assembled engine: interners, cold store, hot cache, memory
/// machinery, and the query surface, wired for a one-shot bulk build.
///
/// Ingest streams records through the [`Loader`]; afterwards
/// [`GraphEngine::release_import_temp`] performs the single transition to
/// the read-only query phase. The graph then stays read-only for the
/// process lifetime.
pub struct GraphEngine {
    config: Config,
    vertices: VertexInterner,
    vertex_labels: LabelInterner,
    edge_labels: LabelInterner,
    csr: Arc<BlockedCSR>,
    cache: Arc<HotCache>,
    monitor: MemoryMonitor,
    pool: Mutex<MemoryPool>,
    query: QueryManager,
    released: AtomicBool,
}

impl GraphEngine {
    /// Validates the configuration and brings every component up. The
    /// base directory is created if absent.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        if config.hard_mem_cap {
            set_process_mem_limit(config.mem_limit_mb);
        }

        let csr = Arc::new(BlockedCSR::open(
            &config.base_dir,
            config.block_size,
            config.compression_level,
        )?);
        let cache = Arc::new(HotCache::new(
            Arc::clone(&csr),
            config.max_hot_mem_bytes,
            config.block_size,
            config.hot_block_threshold,
        ));
        let monitor = MemoryMonitor::start(
            config.mem_limit_mb,
            Duration::from_millis(config.monitor_interval_ms),
        );
        let pool = Mutex::new(MemoryPool::new(
            config.emergency_pool_bytes,
            config.pool_use_huge_pages,
        ));
        let query = QueryManager::new(Arc::clone(&cache), config.block_size);

        info!(
            base_dir = %config.base_dir.display(),
            block_size = config.block_size,
            mem_limit_mb = config.mem_limit_mb,
            "engine.open"
        );
        Ok(Self {
            config,
            vertices: VertexInterner::new(),
            vertex_labels: LabelInterner::new(),
            edge_labels: LabelInterner::new(),
            csr,
            cache,
            monitor,
            pool,
            query,
            released: AtomicBool::new(false),
        })
    }

    /// Ingests a record stream.
    pub fn ingest<R: Read + Send>(&self, input: R) -> Result<IngestStats> {
        let loader = Loader::new(
            &self.config,
            &self.vertices,
            &self.vertex_labels,
            &self.edge_labels,
            &self.csr,
            &self.cache,
            &self.monitor,
        );
        loader.load(input)
    }

    /// Ingests a record file from disk.
    pub fn ingest_path(&self, path: impl AsRef<Path>) -> Result<IngestStats> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GraphError::io(path, e))?;
        self.ingest(file)
    }

    /// One-shot transition from ingest to the read-only query phase:
    /// drops cold-tier residency kept for ingest locality and reserves
    /// the query arena from what the ceiling leaves free.
    pub fn release_import_temp(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cache.release_import_temp()?;
        self.monitor.refresh();
        let free_mb = self
            .config
            .mem_limit_mb
            .saturating_sub(self.monitor.used_mb());
        self.pool.lock().alloc_query_pool(free_mb);
        info!(query_mb = free_mb, "engine.release_import_temp");
        Ok(())
    }

    /// Lazy `(edge_id, neighbor_id)` sequence for one vertex.
    pub fn adjacency(&self, vertex: VertexId, direction: Direction) -> Result<AdjIterator> {
        self.query.adjacency(vertex, direction)
    }

    /// Neighbor ids of one vertex.
    pub fn neighbors(&self, vertex: VertexId, direction: Direction) -> Result<Vec<VertexId>> {
        self.query.neighbors(vertex, direction)
    }

    pub fn out_degree(&self, vertex: VertexId) -> Result<usize> {
        self.query.degree(vertex, Direction::Out)
    }

    pub fn in_degree(&self, vertex: VertexId) -> Result<usize> {
        self.query.degree(vertex, Direction::In)
    }

    /// Dense id of a vertex key, if it was seen during ingest.
    pub fn vertex_id(&self, key: &str) -> Option<VertexId> {
        self.vertices.lookup(key)
    }

    /// Original key of a dense vertex id.
    pub fn vertex_key(&self, vertex: VertexId) -> Option<String> {
        self.vertices.resolve(vertex)
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.cache.metrics_snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct access for tests and tooling that drive the cache.
    pub fn cache(&self) -> &HotCache {
        &self.cache
    }
}
