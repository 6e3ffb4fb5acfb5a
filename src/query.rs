use std::sync::Arc;

use crate::cache::HotCache;
use crate::error::Result;
use crate::storage::block::Block;
use crate::storage::record::{Direction, EdgeId, VertexId};

/// Resolves vertices to blocks and hands out adjacency iterators.
pub struct QueryManager {
    cache: Arc<HotCache>,
    block_size: u32,
}

impl QueryManager {
    pub fn new(cache: Arc<HotCache>, block_size: u32) -> Self {
        Self { cache, block_size }
    }

    /// Returns a lazy iterator over `(edge_id, neighbor_id)` for one
    /// vertex and direction. The owning block is fetched (and loaded from
    /// cold storage if needed) up front; iteration itself performs no I/O
    /// and cannot fail. Vertices with no edges yield an empty iterator.
    pub fn adjacency(&self, vertex: VertexId, direction: Direction) -> Result<AdjIterator> {
        let block_id = vertex / self.block_size;
        let local = (vertex % self.block_size) as usize;
        let block = self.cache.get(block_id)?;
        let offsets = match direction {
            Direction::Out => &block.offsets_out,
            Direction::In => &block.offsets_in,
        };
        let start = offsets[local];
        let end = offsets[local + 1];
        Ok(AdjIterator {
            block,
            direction,
            start,
            end,
            cursor: start,
        })
    }

    /// Collects the neighbor ids of one vertex.
    pub fn neighbors(&self, vertex: VertexId, direction: Direction) -> Result<Vec<VertexId>> {
        Ok(self.adjacency(vertex, direction)?.map(|(_, n)| n).collect())
    }

    /// Neighbor count without materializing the sequence.
    pub fn degree(&self, vertex: VertexId, direction: Direction) -> Result<usize> {
        Ok(self.adjacency(vertex, direction)?.len())
    }
}

/// Finite, restartable cursor over one vertex's adjacency range.
///
/// Holds a reference to the owning block for its whole lifetime, which
/// pins the block in the cache: eviction skips blocks with outstanding
/// iterators.
pub struct AdjIterator {
    block: Arc<Block>,
    direction: Direction,
    start: u32,
    end: u32,
    cursor: u32,
}

impl AdjIterator {
    pub fn has_next(&self) -> bool {
        self.cursor < self.end
    }

    /// The pair under the cursor; `None` once the range is exhausted.
    pub fn get(&self) -> Option<(EdgeId, VertexId)> {
        if !self.has_next() {
            return None;
        }
        let adj = match self.direction {
            Direction::Out => &self.block.adj_out,
            Direction::In => &self.block.adj_in,
        };
        let record = &adj[self.cursor as usize];
        Some((record.edge_id, record.neighbor_id))
    }

    /// Steps the cursor; a no-op once past the end.
    pub fn advance(&mut self) {
        if self.cursor < self.end {
            self.cursor += 1;
        }
    }

    /// Rewinds to the start of the range.
    pub fn reset(&mut self) {
        self.cursor = self.start;
    }

    /// Records remaining from the cursor position.
    pub fn remaining(&self) -> usize {
        (self.end - self.cursor) as usize
    }

    /// Total records in the range, independent of the cursor.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Iterator for AdjIterator {
    type Item = (EdgeId, VertexId);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.get()?;
        self.cursor += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for AdjIterator {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::csr::BlockedCSR;
    use crate::storage::record::EdgeRecord;
    use tempfile::TempDir;

    fn record(edge_id: u32, neighbor_id: u32, direction: Direction) -> EdgeRecord {
        EdgeRecord {
            edge_id,
            neighbor_id,
            edge_label: 1,
            direction: direction.to_byte(),
            src_label: 1,
            dst_label: 1,
        }
    }

    fn fixture() -> (TempDir, QueryManager) {
        let dir = TempDir::new().expect("temp dir");
        let csr = Arc::new(BlockedCSR::open(dir.path(), 4, 1).expect("open csr"));
        let cache = Arc::new(HotCache::new(csr, 1 << 20, 4, 1000));

        let mut block = Block::new(0, 4);
        block.push_out(1, record(0, 2, Direction::Out));
        block.push_out(1, record(1, 3, Direction::Out));
        block.push_in(2, record(0, 1, Direction::In));
        block.finalize();
        cache.add_hot(block).expect("add block");

        let manager = QueryManager::new(cache, 4);
        (dir, manager)
    }

    #[test]
    fn iterates_out_adjacency_in_sorted_order() {
        let (_dir, manager) = fixture();
        let pairs: Vec<_> = manager
            .adjacency(1, Direction::Out)
            .expect("iterator")
            .collect();
        assert_eq!(pairs, vec![(0, 2), (1, 3)]);
    }

    #[test]
    fn iterates_in_adjacency() {
        let (_dir, manager) = fixture();
        let pairs: Vec<_> = manager
            .adjacency(2, Direction::In)
            .expect("iterator")
            .collect();
        assert_eq!(pairs, vec![(0, 1)]);
    }

    #[test]
    fn protocol_get_advance_reset() {
        let (_dir, manager) = fixture();
        let mut iter = manager.adjacency(1, Direction::Out).expect("iterator");

        assert!(iter.has_next());
        assert_eq!(iter.get(), Some((0, 2)));
        iter.advance();
        assert_eq!(iter.get(), Some((1, 3)));
        iter.advance();
        assert!(!iter.has_next());
        assert_eq!(iter.get(), None);

        // Advancing past the end stays put.
        iter.advance();
        assert!(!iter.has_next());

        iter.reset();
        assert!(iter.has_next());
        assert_eq!(iter.get(), Some((0, 2)));
    }

    #[test]
    fn vertex_without_edges_yields_empty_iterator() {
        let (_dir, manager) = fixture();
        let iter = manager.adjacency(3, Direction::Out).expect("iterator");
        assert!(iter.is_empty());
        assert_eq!(iter.count(), 0);
    }

    #[test]
    fn vertex_in_absent_block_yields_empty_iterator() {
        let (_dir, manager) = fixture();
        // Block 20 was never built; the cache synthesizes it.
        let iter = manager.adjacency(83, Direction::In).expect("iterator");
        assert_eq!(iter.len(), 0);
    }

    #[test]
    fn degree_matches_iterator_length() {
        let (_dir, manager) = fixture();
        assert_eq!(manager.degree(1, Direction::Out).expect("degree"), 2);
        assert_eq!(manager.degree(1, Direction::In).expect("degree"), 0);
        assert_eq!(manager.neighbors(2, Direction::In).expect("neighbors"), vec![1]);
    }
}
