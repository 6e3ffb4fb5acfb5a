use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{GraphError, Result};

const RUN_HEADER_SIZE: usize = 8;
const ENTRY_HEADER_SIZE: usize = 8;
pub const MANIFEST_FILE: &str = "vertices.dat";

/// Out-of-core deduplication of vertex `(key, label)` pairs.
///
/// Entries accumulate in a bounded memory chunk; full chunks are sorted by
/// key and flushed as fixed-stride run files. [`RunWriter::finish`] merges
/// the runs in key order, drops duplicate keys, and streams the survivors
/// into a single `vertices.dat` manifest, removing the runs.
///
/// Run and manifest files share one framing: an 8-byte header
/// `[entry_count: u32 LE][stride: u32 LE]` followed by `entry_count`
/// stride-sized slots, each `[key_len: u32 LE][label_len: u32 LE][key]
/// [label]` zero-padded to the stride.
pub struct RunWriter {
    dir: PathBuf,
    chunk_budget: usize,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pending_bytes: usize,
    runs: Vec<RunFile>,
    next_run: u32,
}

struct RunFile {
    path: PathBuf,
    stride: usize,
    count: u32,
}

impl RunWriter {
    pub fn new(dir: impl Into<PathBuf>, chunk_budget: usize) -> Self {
        Self {
            dir: dir.into(),
            chunk_budget: chunk_budget.max(1),
            entries: Vec::new(),
            pending_bytes: 0,
            runs: Vec::new(),
            next_run: 0,
        }
    }

    /// Queues one vertex observation; flushes a sorted run when the chunk
    /// budget fills.
    pub fn add(&mut self, key: &str, label: &str) -> Result<()> {
        self.pending_bytes += ENTRY_HEADER_SIZE + key.len() + label.len();
        self.entries
            .push((key.as_bytes().to_vec(), label.as_bytes().to_vec()));
        if self.pending_bytes >= self.chunk_budget {
            self.flush_run()?;
        }
        Ok(())
    }

    fn flush_run(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        self.entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let stride = self
            .entries
            .iter()
            .map(|(k, l)| ENTRY_HEADER_SIZE + k.len() + l.len())
            .max()
            .expect("entries is nonempty");

        let path = self.dir.join(format!("vertex_run_{}.dat", self.next_run));
        self.next_run += 1;
        let file = File::create(&path).map_err(|e| GraphError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer, &path, self.entries.len() as u32, stride as u32)?;
        let mut slot = vec![0u8; stride];
        for (key, label) in &self.entries {
            fill_slot(&mut slot, key, label);
            writer.write_all(&slot).map_err(|e| GraphError::io(&path, e))?;
        }
        writer.flush().map_err(|e| GraphError::io(&path, e))?;

        debug!(
            run = self.runs.len(),
            entries = self.entries.len(),
            stride,
            "extsort.flush_run"
        );
        self.runs.push(RunFile {
            path,
            stride,
            count: self.entries.len() as u32,
        });
        self.entries.clear();
        self.pending_bytes = 0;
        Ok(())
    }

    /// Flushes the tail chunk, k-way merges every run dropping duplicate
    /// keys, and leaves the deduplicated manifest at `vertices.dat`.
    pub fn finish(mut self) -> Result<VertexManifest> {
        self.flush_run()?;

        let manifest_path = self.dir.join(MANIFEST_FILE);
        let stride = self.runs.iter().map(|r| r.stride).max().unwrap_or(ENTRY_HEADER_SIZE);
        let tmp = manifest_path.with_extension("dat.tmp");
        let file = File::create(&tmp).map_err(|e| GraphError::io(&tmp, e))?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer, &tmp, 0, stride as u32)?;

        let mut heap = BinaryHeap::new();
        let mut readers = Vec::with_capacity(self.runs.len());
        for (index, run) in self.runs.iter().enumerate() {
            let mut reader = RunReader::open(run)?;
            if let Some(entry) = reader.next_entry()? {
                heap.push(MergeEntry { entry, source: index });
            }
            readers.push(reader);
        }

        let mut written = 0u32;
        let mut last_key: Option<Vec<u8>> = None;
        let mut slot = vec![0u8; stride];
        while let Some(MergeEntry { entry, source }) = heap.pop() {
            let (key, label) = entry;
            if last_key.as_deref() != Some(&key[..]) {
                fill_slot(&mut slot, &key, &label);
                writer.write_all(&slot).map_err(|e| GraphError::io(&tmp, e))?;
                written += 1;
                last_key = Some(key);
            }
            if let Some(next) = readers[source].next_entry()? {
                heap.push(MergeEntry { entry: next, source });
            }
        }

        writer.flush().map_err(|e| GraphError::io(&tmp, e))?;
        let mut file = writer.into_inner().map_err(|e| GraphError::io(&tmp, e.into()))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| GraphError::io(&tmp, e))?;
        file.write_all(&written.to_le_bytes())
            .map_err(|e| GraphError::io(&tmp, e))?;
        file.sync_all().map_err(|e| GraphError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &manifest_path).map_err(|e| GraphError::io(&manifest_path, e))?;

        for run in &self.runs {
            fs::remove_file(&run.path).map_err(|e| GraphError::io(&run.path, e))?;
        }
        info!(vertices = written, runs = self.runs.len(), "extsort.merged");
        Ok(VertexManifest {
            path: manifest_path,
            count: written,
            stride,
        })
    }
}

struct MergeEntry {
    entry: (Vec<u8>, Vec<u8>),
    source: usize,
}

// BinaryHeap is a max-heap; invert the ordering so the smallest key pops
// first. Ties break on source index to keep the merge deterministic.
impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .0
            .cmp(&self.entry.0)
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

struct RunReader {
    reader: BufReader<File>,
    path: PathBuf,
    stride: usize,
    remaining: u32,
}

impl RunReader {
    fn open(run: &RunFile) -> Result<Self> {
        let file = File::open(&run.path).map_err(|e| GraphError::io(&run.path, e))?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; RUN_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .map_err(|e| GraphError::io(&run.path, e))?;
        Ok(Self {
            reader,
            path: run.path.clone(),
            stride: run.stride,
            remaining: run.count,
        })
    }

    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut slot = vec![0u8; self.stride];
        self.reader
            .read_exact(&mut slot)
            .map_err(|e| GraphError::io(&self.path, e))?;
        Ok(Some(parse_slot(&slot, &self.path)?))
    }
}

/// Handle to the deduplicated on-disk vertex manifest.
pub struct VertexManifest {
    path: PathBuf,
    count: u32,
    stride: usize,
}

impl VertexManifest {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(MANIFEST_FILE);
        let file = File::open(&path).map_err(|e| GraphError::io(&path, e))?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; RUN_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .map_err(|e| GraphError::io(&path, e))?;
        let count = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let stride = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
        Ok(Self { path, count, stride })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Streams `(key, label)` pairs in key order.
    pub fn entries(&self) -> Result<ManifestIter> {
        let file = File::open(&self.path).map_err(|e| GraphError::io(&self.path, e))?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; RUN_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .map_err(|e| GraphError::io(&self.path, e))?;
        Ok(ManifestIter {
            reader,
            path: self.path.clone(),
            stride: self.stride,
            remaining: self.count,
        })
    }
}

pub struct ManifestIter {
    reader: BufReader<File>,
    path: PathBuf,
    stride: usize,
    remaining: u32,
}

impl Iterator for ManifestIter {
    type Item = Result<(String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut slot = vec![0u8; self.stride];
        if let Err(e) = self.reader.read_exact(&mut slot) {
            self.remaining = 0;
            return Some(Err(GraphError::io(&self.path, e)));
        }
        let parsed = parse_slot(&slot, &self.path).and_then(|(key, label)| {
            let key = String::from_utf8(key).map_err(|_| {
                GraphError::corrupt(0, "manifest key is not valid UTF-8")
            })?;
            let label = String::from_utf8(label).map_err(|_| {
                GraphError::corrupt(0, "manifest label is not valid UTF-8")
            })?;
            Ok((key, label))
        });
        Some(parsed)
    }
}

fn write_header(
    writer: &mut BufWriter<File>,
    path: &Path,
    count: u32,
    stride: u32,
) -> Result<()> {
    writer
        .write_all(&count.to_le_bytes())
        .and_then(|_| writer.write_all(&stride.to_le_bytes()))
        .map_err(|e| GraphError::io(path, e))
}

fn fill_slot(slot: &mut [u8], key: &[u8], label: &[u8]) {
    slot.fill(0);
    slot[0..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    slot[4..8].copy_from_slice(&(label.len() as u32).to_le_bytes());
    slot[8..8 + key.len()].copy_from_slice(key);
    slot[8 + key.len()..8 + key.len() + label.len()].copy_from_slice(label);
}

fn parse_slot(slot: &[u8], path: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let key_len = u32::from_le_bytes(slot[0..4].try_into().expect("4 bytes")) as usize;
    let label_len = u32::from_le_bytes(slot[4..8].try_into().expect("4 bytes")) as usize;
    if ENTRY_HEADER_SIZE + key_len + label_len > slot.len() {
        return Err(GraphError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "slot lengths exceed stride",
            ),
        });
    }
    let key = slot[8..8 + key_len].to_vec();
    let label = slot[8 + key_len..8 + key_len + label_len].to_vec();
    Ok((key, label))
}
