use std::io::Read;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use csv::{ReaderBuilder, StringRecord};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::HotCache;
use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::intern::{LabelInterner, VertexInterner};
use crate::memory::MemoryMonitor;
use crate::storage::block::Block;
use crate::storage::csr::BlockedCSR;
use crate::storage::extsort::RunWriter;
use crate::storage::record::{BlockId, Direction, EdgeRecord};

const BUILDER_SHARD_COUNT: usize = 64;

/// Counters describing one completed ingest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub records_parsed: u64,
    pub records_skipped: u64,
    pub edges: u64,
    pub hot_blocks: u64,
    pub cold_blocks: u64,
    pub backpressure_events: u64,
    pub distinct_vertices: u64,
    pub distinct_vertex_labels: u64,
    pub distinct_edge_labels: u64,
    pub manifest_vertices: Option<u64>,
}

// Concurrent block_id -> builder mapping with get-or-create semantics:
// a sharded map plus one exclusive lock per block.
struct BuilderShards {
    shards: Vec<Mutex<FxHashMap<BlockId, Arc<Mutex<Block>>>>>,
    block_size: u32,
}

impl BuilderShards {
    fn new(block_size: u32) -> Self {
        Self {
            shards: (0..BUILDER_SHARD_COUNT)
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
            block_size,
        }
    }

    fn builder(&self, block_id: BlockId) -> Arc<Mutex<Block>> {
        let shard = &self.shards[block_id as usize % BUILDER_SHARD_COUNT];
        let mut map = shard.lock();
        Arc::clone(
            map.entry(block_id)
                .or_insert_with(|| Arc::new(Mutex::new(Block::new(block_id, self.block_size)))),
        )
    }

    fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Block) -> Result<()>,
    {
        for shard in &self.shards {
            let map = shard.lock();
            for builder in map.values() {
                f(&mut builder.lock())?;
            }
        }
        Ok(())
    }

    fn into_blocks(self) -> Vec<Block> {
        let mut blocks = Vec::new();
        for shard in self.shards {
            for (_, builder) in shard.into_inner() {
                let block = Arc::try_unwrap(builder)
                    .map(Mutex::into_inner)
                    .expect("no builder is shared after workers quiesce");
                blocks.push(block);
            }
        }
        blocks
    }
}

/// Streams textual edge records into blocked CSR builders.
///
/// Records are parsed in batches dispatched to worker tasks; the memory
/// monitor is consulted before each dispatch and a high reading spills the
/// in-flight builders to cold storage instead of stopping ingest. Edge-id
/// assignment from the shared counter is the only global ordering point;
/// record order within a block is not preserved (the multiset of edges
/// is), and finalize-time sorting makes query output deterministic.
pub struct Loader<'a> {
    config: &'a Config,
    vertices: &'a VertexInterner,
    vertex_labels: &'a LabelInterner,
    edge_labels: &'a LabelInterner,
    csr: &'a BlockedCSR,
    cache: &'a HotCache,
    monitor: &'a MemoryMonitor,
    next_edge_id: AtomicU32,
    records_parsed: AtomicU64,
    records_skipped: AtomicU64,
    backpressure_events: AtomicU64,
}

impl<'a> Loader<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a Config,
        vertices: &'a VertexInterner,
        vertex_labels: &'a LabelInterner,
        edge_labels: &'a LabelInterner,
        csr: &'a BlockedCSR,
        cache: &'a HotCache,
        monitor: &'a MemoryMonitor,
    ) -> Self {
        Self {
            config,
            vertices,
            vertex_labels,
            edge_labels,
            csr,
            cache,
            monitor,
            next_edge_id: AtomicU32::new(0),
            records_parsed: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
        }
    }

    /// Consumes the record stream and builds the graph.
    ///
    /// The input is comma-separated
    /// `src_key,dst_key,edge_label,src_label,dst_label` lines with a
    /// leading header line. Records with fewer than five fields are
    /// skipped and counted; that is the only tolerated malformation.
    pub fn load<R: Read + Send>(&self, input: R) -> Result<IngestStats> {
        self.csr.clear_spills()?;
        let shards = BuilderShards::new(self.config.block_size);
        let failure: Mutex<Option<GraphError>> = Mutex::new(None);
        let mut manifest_writer = self
            .config
            .write_vertex_manifest
            .then(|| RunWriter::new(self.csr.base_dir(), self.config.vertex_run_bytes));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|i| format!("shale-ingest-{i}"))
            .build()
            .map_err(|e| GraphError::InvalidConfig(e.to_string()))?;

        let shards_ref = &shards;
        let failure_ref = &failure;
        pool.scope(|scope| -> Result<()> {
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .from_reader(input);
            let mut batch: Vec<StringRecord> = Vec::with_capacity(self.config.batch_size);
            for item in reader.records() {
                let record = match item {
                    Ok(record) => record,
                    Err(e) if e.is_io_error() => {
                        let source = match e.into_kind() {
                            csv::ErrorKind::Io(io) => io,
                            _ => std::io::Error::other("record stream failed"),
                        };
                        return Err(GraphError::io("<record stream>", source));
                    }
                    Err(_) => {
                        self.records_skipped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                if let Some(writer) = manifest_writer.as_mut() {
                    if record.len() >= 5 {
                        writer.add(record.get(0).unwrap_or(""), record.get(3).unwrap_or(""))?;
                        writer.add(record.get(1).unwrap_or(""), record.get(4).unwrap_or(""))?;
                    }
                }
                batch.push(record);
                if batch.len() >= self.config.batch_size {
                    if failure_ref.lock().is_some() {
                        break;
                    }
                    self.backpressure_check(shards_ref)?;
                    let work = std::mem::replace(
                        &mut batch,
                        Vec::with_capacity(self.config.batch_size),
                    );
                    scope.spawn(move |_| self.parse_batch(work, shards_ref, failure_ref));
                }
            }
            if !batch.is_empty() && failure_ref.lock().is_none() {
                scope.spawn(move |_| self.parse_batch(batch, shards_ref, failure_ref));
            }
            Ok(())
        })?;

        if let Some(error) = failure.into_inner() {
            return Err(error);
        }

        let (hot_blocks, cold_blocks) = self.finish_blocks(shards)?;

        let mut stats = IngestStats {
            records_parsed: self.records_parsed.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            edges: u64::from(self.next_edge_id.load(Ordering::Relaxed)),
            hot_blocks,
            cold_blocks,
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            distinct_vertices: self.vertices.len() as u64,
            distinct_vertex_labels: self.vertex_labels.len() as u64,
            distinct_edge_labels: self.edge_labels.len() as u64,
            manifest_vertices: None,
        };
        if let Some(writer) = manifest_writer {
            let manifest = writer.finish()?;
            stats.manifest_vertices = Some(u64::from(manifest.len()));
        }
        info!(
            records = stats.records_parsed,
            skipped = stats.records_skipped,
            edges = stats.edges,
            hot_blocks,
            cold_blocks,
            backpressure_events = stats.backpressure_events,
            "loader.done"
        );
        Ok(stats)
    }

    // The backpressure step: a high memory reading de-residencies the
    // build instead of stopping it. Builders spill their pending records
    // to sidecar files (counters stay in memory and are drained back
    // before finalize) and the hot cache gives up half its budget.
    fn backpressure_check(&self, shards: &BuilderShards) -> Result<()> {
        self.monitor.refresh();
        let ratio = self.monitor.usage_ratio();
        if ratio < self.config.backpressure_ratio {
            return Ok(());
        }
        if self.monitor.check_threshold(self.config.backpressure_ratio, 1.0) {
            let advisory = GraphError::MemoryLimitExceeded {
                used_mb: self.monitor.used_mb(),
                limit_mb: self.monitor.mem_limit_mb(),
            };
            warn!(error = %advisory, "loader.over_limit");
        }
        warn!(ratio, "loader.backpressure");
        shards.for_each(|block| self.csr.spill(block))?;
        self.cache.shrink(self.config.shrink_ratio)?;
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn parse_batch(
        &self,
        batch: Vec<StringRecord>,
        shards: &BuilderShards,
        failure: &Mutex<Option<GraphError>>,
    ) {
        for record in batch {
            if record.len() < 5 {
                self.records_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Err(error) = self.ingest_record(&record, shards) {
                let mut slot = failure.lock();
                if slot.is_none() {
                    *slot = Some(error);
                }
                return;
            }
        }
    }

    fn ingest_record(&self, record: &StringRecord, shards: &BuilderShards) -> Result<()> {
        let src_key = record.get(0).unwrap_or("");
        let dst_key = record.get(1).unwrap_or("");
        let edge_label = record.get(2).unwrap_or("");
        let src_label = record.get(3).unwrap_or("");
        let dst_label = record.get(4).unwrap_or("");

        let src_id = self.vertices.intern(src_key)?;
        let dst_id = self.vertices.intern(dst_key)?;
        let edge_label_id = self.edge_labels.intern(edge_label)?;
        let src_label_id = self.vertex_labels.intern(src_label)?;
        let dst_label_id = self.vertex_labels.intern(dst_label)?;
        let edge_id = self.next_edge_id.fetch_add(1, Ordering::Relaxed);

        let block_size = self.config.block_size;
        let src_block = src_id / block_size;
        let dst_block = dst_id / block_size;
        let src_local = (src_id % block_size) as u16;
        let dst_local = (dst_id % block_size) as u16;

        let out_record = EdgeRecord {
            edge_id,
            neighbor_id: dst_id,
            edge_label: edge_label_id,
            direction: Direction::Out.to_byte(),
            src_label: src_label_id,
            dst_label: dst_label_id,
        };
        // The in-record describes the edge from the destination's side,
        // so the vertex labels swap.
        let in_record = EdgeRecord {
            edge_id,
            neighbor_id: src_id,
            edge_label: edge_label_id,
            direction: Direction::In.to_byte(),
            src_label: dst_label_id,
            dst_label: src_label_id,
        };

        shards.builder(src_block).lock().push_out(src_local, out_record);
        shards.builder(dst_block).lock().push_in(dst_local, in_record);
        self.records_parsed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // EOF path: merge duplicate builders, drain spilled records, finalize
    // every block, and route it to the hot cache or the cold store.
    fn finish_blocks(&self, shards: BuilderShards) -> Result<(u64, u64)> {
        let mut merged: FxHashMap<BlockId, Block> = FxHashMap::default();
        for block in shards.into_blocks() {
            match merged.entry(block.block_id) {
                std::collections::hash_map::Entry::Occupied(mut existing) => {
                    existing.get_mut().absorb(block);
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(block);
                }
            }
        }

        let mut ids: Vec<BlockId> = merged.keys().copied().collect();
        ids.sort_unstable();

        let mut hot_blocks = 0u64;
        let mut cold_blocks = 0u64;
        for block_id in ids {
            let mut block = merged.remove(&block_id).expect("id came from the map");
            self.csr.drain_spill(&mut block)?;
            block.finalize();
            if block_id < self.config.hot_block_threshold {
                self.cache.add_hot(block)?;
                hot_blocks += 1;
            } else {
                self.csr.add(&block, false)?;
                cold_blocks += 1;
            }
        }
        Ok((hot_blocks, cold_blocks))
    }
}
