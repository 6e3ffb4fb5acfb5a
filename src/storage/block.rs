use tracing::debug;

use crate::storage::record::{BlockId, EdgeRecord, EDGE_RECORD_SIZE};

/// A fixed-width vertex partition holding CSR offsets and adjacency
/// records for every vertex id in
/// `[block_id * block_size, (block_id + 1) * block_size)`.
///
/// During ingest the offset arrays hold per-slot counters at index
/// `slot + 1` and the adjacency arrays grow in arrival order;
/// [`Block::finalize`] converts the counters into prefix sums, places each
/// record into its slot range, and sorts every range by
/// `(neighbor_id, edge_id)` so query output is deterministic.
#[derive(Debug)]
pub struct Block {
    pub block_id: BlockId,
    block_size: u32,
    pub offsets_out: Vec<u32>,
    pub offsets_in: Vec<u32>,
    pub adj_out: Vec<EdgeRecord>,
    pub adj_in: Vec<EdgeRecord>,
    // Owner slot per pending record; scratch, dropped by finalize.
    slots_out: Vec<u16>,
    slots_in: Vec<u16>,
    finalized: bool,
}

impl Block {
    pub fn new(block_id: BlockId, block_size: u32) -> Self {
        let len = block_size as usize + 1;
        Self {
            block_id,
            block_size,
            offsets_out: vec![0; len],
            offsets_in: vec![0; len],
            adj_out: Vec::new(),
            adj_in: Vec::new(),
            slots_out: Vec::new(),
            slots_in: Vec::new(),
            finalized: false,
        }
    }

    /// An empty, query-ready block. Stands in for cold blocks that were
    /// never written because no vertex in their range has edges.
    pub fn empty(block_id: BlockId, block_size: u32) -> Self {
        let mut block = Self::new(block_id, block_size);
        block.finalize();
        block
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn record_count(&self) -> usize {
        self.adj_out.len() + self.adj_in.len()
    }

    /// Appends an out-record owned by `slot` and bumps its counter.
    ///
    /// Callers must hold the block exclusively; mutation is unsynchronized.
    pub fn push_out(&mut self, slot: u16, record: EdgeRecord) {
        debug_assert!(!self.finalized, "push into finalized block");
        self.offsets_out[slot as usize + 1] += 1;
        self.adj_out.push(record);
        self.slots_out.push(slot);
    }

    /// Appends an in-record owned by `slot` and bumps its counter.
    pub fn push_in(&mut self, slot: u16, record: EdgeRecord) {
        debug_assert!(!self.finalized, "push into finalized block");
        self.offsets_in[slot as usize + 1] += 1;
        self.adj_in.push(record);
        self.slots_in.push(slot);
    }

    /// Re-queues spilled records without touching the per-slot counters,
    /// which already account for them.
    pub(crate) fn restore_spilled(
        &mut self,
        out: Vec<(u16, EdgeRecord)>,
        into: Vec<(u16, EdgeRecord)>,
    ) {
        for (slot, record) in out {
            self.adj_out.push(record);
            self.slots_out.push(slot);
        }
        for (slot, record) in into {
            self.adj_in.push(record);
            self.slots_in.push(slot);
        }
    }

    /// Takes the pending records and their owner slots, leaving the
    /// counters in place. Used by the backpressure spill path.
    pub(crate) fn take_pending(
        &mut self,
    ) -> (Vec<(u16, EdgeRecord)>, Vec<(u16, EdgeRecord)>) {
        let out = self
            .slots_out
            .drain(..)
            .zip(self.adj_out.drain(..))
            .collect();
        let into = self
            .slots_in
            .drain(..)
            .zip(self.adj_in.drain(..))
            .collect();
        (out, into)
    }

    /// Merges a duplicate builder for the same block id: concatenates the
    /// adjacency arrays and sums the per-slot counters.
    pub fn absorb(&mut self, other: Block) {
        debug_assert_eq!(self.block_id, other.block_id);
        debug_assert!(!self.finalized && !other.finalized);
        for (sum, add) in self.offsets_out.iter_mut().zip(&other.offsets_out) {
            *sum += add;
        }
        for (sum, add) in self.offsets_in.iter_mut().zip(&other.offsets_in) {
            *sum += add;
        }
        self.adj_out.extend(other.adj_out);
        self.adj_in.extend(other.adj_in);
        self.slots_out.extend(other.slots_out);
        self.slots_in.extend(other.slots_in);
    }

    /// Converts per-slot counters into CSR prefix sums, places records
    /// into their slot ranges, and sorts each range. Called exactly once
    /// per block before it is exposed to queries.
    pub fn finalize(&mut self) {
        debug_assert!(!self.finalized, "finalize called twice");
        prefix_sum(&mut self.offsets_out);
        prefix_sum(&mut self.offsets_in);
        place_and_sort(&self.offsets_out, &mut self.adj_out, &self.slots_out);
        place_and_sort(&self.offsets_in, &mut self.adj_in, &self.slots_in);
        self.slots_out = Vec::new();
        self.slots_in = Vec::new();
        self.finalized = true;
        debug!(
            block_id = self.block_id,
            out_records = self.adj_out.len(),
            in_records = self.adj_in.len(),
            "block.finalize"
        );
    }

    // Blocks reconstructed from disk already carry prefix-summed offsets.
    pub(crate) fn mark_loaded(&mut self) {
        self.finalized = true;
    }

    /// Byte cost of this block while resident.
    pub fn mem_bytes(&self) -> u64 {
        let adj = (self.adj_out.len() + self.adj_in.len()) * EDGE_RECORD_SIZE;
        let offsets = (self.offsets_out.len() + self.offsets_in.len()) * std::mem::size_of::<u32>();
        (adj + offsets) as u64
    }
}

// In-place exclusive prefix sum: counters stored at `slot + 1` become the
// running totals, so slot k's range is `offsets[k]..offsets[k + 1]`.
fn prefix_sum(offsets: &mut [u32]) {
    let mut total = 0u32;
    for offset in offsets.iter_mut() {
        total += *offset;
        *offset = total;
    }
}

// Counting-sort records into slot order using the prefix-summed offsets,
// then sort each slot range by (neighbor_id, edge_id).
fn place_and_sort(offsets: &[u32], adj: &mut Vec<EdgeRecord>, slots: &[u16]) {
    debug_assert_eq!(adj.len(), slots.len());
    if adj.is_empty() {
        return;
    }
    let mut cursors: Vec<u32> = offsets[..offsets.len() - 1].to_vec();
    let mut placed = vec![adj[0]; adj.len()];
    for (record, &slot) in adj.iter().zip(slots) {
        let cursor = &mut cursors[slot as usize];
        placed[*cursor as usize] = *record;
        *cursor += 1;
    }
    for window in offsets.windows(2) {
        let (start, end) = (window[0] as usize, window[1] as usize);
        placed[start..end].sort_unstable_by_key(|r| (r.neighbor_id, r.edge_id));
    }
    *adj = placed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::Direction;

    fn out_record(edge_id: u32, neighbor_id: u32) -> EdgeRecord {
        EdgeRecord {
            edge_id,
            neighbor_id,
            edge_label: 1,
            direction: Direction::Out.to_byte(),
            src_label: 1,
            dst_label: 1,
        }
    }

    fn in_record(edge_id: u32, neighbor_id: u32) -> EdgeRecord {
        EdgeRecord {
            direction: Direction::In.to_byte(),
            ..out_record(edge_id, neighbor_id)
        }
    }

    #[test]
    fn finalize_builds_prefix_sums() {
        let mut block = Block::new(0, 4);
        block.push_out(0, out_record(0, 1));
        block.push_out(0, out_record(1, 2));
        block.push_out(2, out_record(2, 3));
        block.push_in(1, in_record(0, 0));
        block.finalize();

        assert_eq!(block.offsets_out, vec![0, 2, 2, 3, 3]);
        assert_eq!(block.offsets_in, vec![0, 0, 1, 1, 1]);
        assert_eq!(block.adj_out.len(), 3);
        assert_eq!(block.adj_in.len(), 1);
    }

    #[test]
    fn finalize_places_records_into_slot_ranges() {
        let mut block = Block::new(0, 4);
        // Arrival order interleaves slots; finalize must untangle them.
        block.push_out(3, out_record(5, 9));
        block.push_out(1, out_record(2, 7));
        block.push_out(3, out_record(4, 8));
        block.push_out(1, out_record(3, 7));
        block.finalize();

        let slot1: Vec<_> = block.adj_out[block.offsets_out[1] as usize..block.offsets_out[2] as usize]
            .iter()
            .map(|r| (r.neighbor_id, r.edge_id))
            .collect();
        assert_eq!(slot1, vec![(7, 2), (7, 3)]);

        let slot3: Vec<_> = block.adj_out[block.offsets_out[3] as usize..block.offsets_out[4] as usize]
            .iter()
            .map(|r| (r.neighbor_id, r.edge_id))
            .collect();
        assert_eq!(slot3, vec![(8, 4), (9, 5)]);
    }

    #[test]
    fn slot_ranges_sort_by_neighbor_then_edge() {
        let mut block = Block::new(7, 4);
        block.push_out(0, out_record(9, 5));
        block.push_out(0, out_record(3, 5));
        block.push_out(0, out_record(1, 4));
        block.finalize();

        let pairs: Vec<_> = block
            .adj_out
            .iter()
            .map(|r| (r.neighbor_id, r.edge_id))
            .collect();
        assert_eq!(pairs, vec![(4, 1), (5, 3), (5, 9)]);
    }

    #[test]
    fn absorb_sums_counters_and_concatenates() {
        let mut left = Block::new(2, 4);
        left.push_out(1, out_record(0, 10));
        let mut right = Block::new(2, 4);
        right.push_out(1, out_record(1, 11));
        right.push_in(0, in_record(2, 12));

        left.absorb(right);
        left.finalize();

        assert_eq!(left.offsets_out, vec![0, 0, 2, 2, 2]);
        assert_eq!(left.offsets_in, vec![0, 1, 1, 1, 1]);
        assert_eq!(left.adj_out.len(), 2);
        assert_eq!(left.adj_in.len(), 1);
    }

    #[test]
    fn empty_block_is_query_ready() {
        let block = Block::empty(9, 4);
        assert!(block.is_finalized());
        assert!(block.offsets_out.iter().all(|&o| o == 0));
        assert!(block.offsets_in.iter().all(|&o| o == 0));
        assert_eq!(block.record_count(), 0);
    }

    #[test]
    fn mem_bytes_counts_records_and_offsets() {
        let mut block = Block::new(0, 4);
        block.push_out(0, out_record(0, 1));
        let expected = (EDGE_RECORD_SIZE + 2 * 5 * std::mem::size_of::<u32>()) as u64;
        assert_eq!(block.mem_bytes(), expected);
    }

    #[test]
    fn spill_take_and_restore_round_trip() {
        let mut block = Block::new(0, 4);
        block.push_out(2, out_record(0, 1));
        block.push_in(3, in_record(0, 0));

        let (out, into) = block.take_pending();
        assert_eq!(block.record_count(), 0);
        // Counters survive the spill.
        assert_eq!(block.offsets_out[3], 1);
        assert_eq!(block.offsets_in[4], 1);

        block.restore_spilled(out, into);
        block.finalize();
        assert_eq!(block.offsets_out, vec![0, 0, 0, 1, 1]);
        assert_eq!(block.offsets_in, vec![0, 0, 0, 0, 1]);
        assert_eq!(block.record_count(), 2);
    }
}
