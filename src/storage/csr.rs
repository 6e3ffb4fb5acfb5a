use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{GraphError, Result};
use crate::storage::block::Block;
use crate::storage::record::{BlockId, EdgeRecord, EDGE_RECORD_SIZE};

const SPILL_FRAME_HEADER: usize = 8;
const SPILL_ENTRY_SIZE: usize = EDGE_RECORD_SIZE + 2;

/// Directory-backed store for cold blocks.
///
/// Each cold block is one file `block_<id>.dat`:
///
/// ```text
/// offset  size                  field
/// 0       4                     block_id (little-endian u32)
/// 4       4*(block_size+1)      offsets_out (little-endian u32 array)
/// ...     4*(block_size+1)      offsets_in  (little-endian u32 array)
/// ...     variable              adj, zstd frame over the 12-byte record
///                               image, out section then in section
/// ```
///
/// The adjacency section is compressed with zstd rather than the LZW of
/// earlier revisions; the frame is self-terminating and the payload
/// byte-accurate, so the layout contract is unchanged.
///
/// There is no manifest: the set of cold blocks is the set of files
/// matching the name pattern.
pub struct BlockedCSR {
    base_dir: PathBuf,
    block_size: u32,
    compression_level: i32,
}

impl BlockedCSR {
    /// Opens the store, creating `base_dir` if absent.
    pub fn open(base_dir: impl Into<PathBuf>, block_size: u32, compression_level: i32) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| GraphError::io(&base_dir, e))?;
        Ok(Self {
            base_dir,
            block_size,
            compression_level,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.base_dir.join(format!("block_{block_id}.dat"))
    }

    fn spill_path(&self, block_id: BlockId) -> PathBuf {
        self.base_dir.join(format!("block_{block_id}.spill"))
    }

    pub fn has_block(&self, block_id: BlockId) -> bool {
        self.block_path(block_id).exists()
    }

    /// Routes a finalized block: cold blocks are persisted, hot blocks are
    /// the caller's to hand to the cache.
    pub fn add(&self, block: &Block, hot: bool) -> Result<()> {
        if hot {
            return Ok(());
        }
        self.save(block)
    }

    /// Persists a block atomically: the image is written to a temp name,
    /// fsynced, and renamed into place, so a failed save leaves no partial
    /// file visible.
    pub fn save(&self, block: &Block) -> Result<()> {
        let offsets_len = self.block_size as usize + 1;
        debug_assert_eq!(block.offsets_out.len(), offsets_len);

        let mut image = Vec::with_capacity(4 + 2 * 4 * offsets_len);
        image.extend_from_slice(&block.block_id.to_le_bytes());
        for &offset in &block.offsets_out {
            image.extend_from_slice(&offset.to_le_bytes());
        }
        for &offset in &block.offsets_in {
            image.extend_from_slice(&offset.to_le_bytes());
        }

        let mut adj = Vec::with_capacity(block.record_count() * EDGE_RECORD_SIZE);
        for record in block.adj_out.iter().chain(&block.adj_in) {
            record.encode_into(&mut adj);
        }
        let compressed = zstd::stream::encode_all(&adj[..], self.compression_level)
            .map_err(|e| GraphError::io(self.block_path(block.block_id), e))?;

        let path = self.block_path(block.block_id);
        let tmp = path.with_extension("dat.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&image)?;
            file.write_all(&compressed)?;
            file.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(GraphError::io(&tmp, e));
        }
        fs::rename(&tmp, &path).map_err(|e| GraphError::io(&path, e))?;
        debug!(
            block_id = block.block_id,
            records = block.record_count(),
            compressed_bytes = compressed.len(),
            "csr.save"
        );
        Ok(())
    }

    /// Loads and validates a cold block.
    pub fn load(&self, block_id: BlockId) -> Result<Block> {
        let path = self.block_path(block_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(GraphError::BlockNotFound { block_id });
            }
            Err(e) => return Err(GraphError::io(&path, e)),
        };

        let offsets_len = self.block_size as usize + 1;
        let header_len = 4 + 2 * 4 * offsets_len;
        if data.len() < header_len {
            return Err(GraphError::corrupt(block_id, "file shorter than header"));
        }

        let stored_id = u32::from_le_bytes(data[0..4].try_into().expect("slice has 4 bytes"));
        if stored_id != block_id {
            return Err(GraphError::corrupt(
                block_id,
                format!("header names block {stored_id}"),
            ));
        }

        let mut block = Block::new(block_id, self.block_size);
        let mut cursor = 4usize;
        for offset in block.offsets_out.iter_mut() {
            *offset = u32::from_le_bytes(data[cursor..cursor + 4].try_into().expect("4 bytes"));
            cursor += 4;
        }
        for offset in block.offsets_in.iter_mut() {
            *offset = u32::from_le_bytes(data[cursor..cursor + 4].try_into().expect("4 bytes"));
            cursor += 4;
        }
        if !is_non_decreasing(&block.offsets_out) || !is_non_decreasing(&block.offsets_in) {
            return Err(GraphError::corrupt(block_id, "offsets are not non-decreasing"));
        }

        let adj = zstd::stream::decode_all(&data[cursor..])
            .map_err(|_| GraphError::corrupt(block_id, "adjacency section does not decompress"))?;
        if adj.len() % EDGE_RECORD_SIZE != 0 {
            return Err(GraphError::corrupt(
                block_id,
                format!("adjacency size {} is not a record multiple", adj.len()),
            ));
        }

        let total = adj.len() / EDGE_RECORD_SIZE;
        let out_count = block.offsets_out[offsets_len - 1] as usize;
        let in_count = block.offsets_in[offsets_len - 1] as usize;
        if out_count + in_count != total {
            return Err(GraphError::corrupt(
                block_id,
                format!("offsets cover {} records, file holds {total}", out_count + in_count),
            ));
        }

        block.adj_out.reserve(out_count);
        block.adj_in.reserve(in_count);
        for (index, chunk) in adj.chunks_exact(EDGE_RECORD_SIZE).enumerate() {
            let record = EdgeRecord::decode_from(chunk).map_err(|_| {
                GraphError::corrupt(block_id, format!("record {index} does not decode"))
            })?;
            if index < out_count {
                block.adj_out.push(record);
            } else {
                block.adj_in.push(record);
            }
        }
        block.mark_loaded();
        debug!(block_id, records = total, "csr.load");
        Ok(block)
    }

    /// Appends a builder's pending records to its sidecar spill file and
    /// clears the in-memory adjacency, keeping the per-slot counters.
    /// Backpressure calls this so a throttled build loses nothing.
    pub fn spill(&self, block: &mut Block) -> Result<()> {
        if block.record_count() == 0 {
            return Ok(());
        }
        let (out, into) = block.take_pending();
        let path = self.spill_path(block.block_id);
        let mut frame =
            Vec::with_capacity(SPILL_FRAME_HEADER + (out.len() + into.len()) * SPILL_ENTRY_SIZE);
        frame.extend_from_slice(&(out.len() as u32).to_le_bytes());
        frame.extend_from_slice(&(into.len() as u32).to_le_bytes());
        for (slot, record) in out.iter().chain(&into) {
            frame.extend_from_slice(&slot.to_le_bytes());
            record.encode_into(&mut frame);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GraphError::io(&path, e))?;
        file.write_all(&frame).map_err(|e| GraphError::io(&path, e))?;
        debug!(
            block_id = block.block_id,
            out_records = out.len(),
            in_records = into.len(),
            "csr.spill"
        );
        Ok(())
    }

    /// Reads spilled records back into the builder and removes the spill
    /// file. A missing file means nothing was spilled.
    pub fn drain_spill(&self, block: &mut Block) -> Result<()> {
        let path = self.spill_path(block.block_id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(GraphError::io(&path, e)),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| GraphError::io(&path, e))?;
        drop(file);

        let block_id = block.block_id;
        let mut cursor = 0usize;
        while cursor < data.len() {
            if data.len() - cursor < SPILL_FRAME_HEADER {
                return Err(GraphError::corrupt(block_id, "spill frame header truncated"));
            }
            let out_n =
                u32::from_le_bytes(data[cursor..cursor + 4].try_into().expect("4 bytes")) as usize;
            let in_n = u32::from_le_bytes(data[cursor + 4..cursor + 8].try_into().expect("4 bytes"))
                as usize;
            cursor += SPILL_FRAME_HEADER;
            let body = (out_n + in_n) * SPILL_ENTRY_SIZE;
            if data.len() - cursor < body {
                return Err(GraphError::corrupt(block_id, "spill frame body truncated"));
            }
            let mut out = Vec::with_capacity(out_n);
            let mut into = Vec::with_capacity(in_n);
            for index in 0..out_n + in_n {
                let slot =
                    u16::from_le_bytes(data[cursor..cursor + 2].try_into().expect("2 bytes"));
                let record = EdgeRecord::decode_from(&data[cursor + 2..cursor + SPILL_ENTRY_SIZE])
                    .map_err(|_| {
                        GraphError::corrupt(block_id, "spilled record does not decode")
                    })?;
                if index < out_n {
                    out.push((slot, record));
                } else {
                    into.push((slot, record));
                }
                cursor += SPILL_ENTRY_SIZE;
            }
            block.restore_spilled(out, into);
        }
        fs::remove_file(&path).map_err(|e| GraphError::io(&path, e))?;
        debug!(block_id, "csr.drain_spill");
        Ok(())
    }

    /// Removes spill files left behind by an interrupted ingest. A stale
    /// spill would otherwise leak foreign records into a fresh build.
    pub fn clear_spills(&self) -> Result<()> {
        let entries =
            fs::read_dir(&self.base_dir).map_err(|e| GraphError::io(&self.base_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| GraphError::io(&self.base_dir, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "spill") {
                fs::remove_file(&path).map_err(|e| GraphError::io(&path, e))?;
            }
        }
        Ok(())
    }

    /// Block ids currently persisted, in no particular order.
    pub fn cold_block_ids(&self) -> Result<Vec<BlockId>> {
        let entries =
            fs::read_dir(&self.base_dir).map_err(|e| GraphError::io(&self.base_dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GraphError::io(&self.base_dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix("block_")
                .and_then(|rest| rest.strip_suffix(".dat"))
                .and_then(|digits| digits.parse::<BlockId>().ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

fn is_non_decreasing(offsets: &[u32]) -> bool {
    offsets.windows(2).all(|w| w[0] <= w[1])
}
