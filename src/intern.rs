use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::trace;

use crate::error::{GraphError, Result};
use crate::storage::record::{LabelId, VertexId};

/// Thread-safe counters for interner traffic.
#[derive(Default)]
pub struct InternMetrics {
    intern_calls: AtomicU64,
    intern_hits: AtomicU64,
    intern_misses: AtomicU64,
}

/// A point-in-time copy of [`InternMetrics`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct InternMetricsSnapshot {
    pub intern_calls: u64,
    pub intern_hits: u64,
    pub intern_misses: u64,
}

impl InternMetrics {
    pub fn snapshot(&self) -> InternMetricsSnapshot {
        InternMetricsSnapshot {
            intern_calls: self.intern_calls.load(Ordering::Relaxed),
            intern_hits: self.intern_hits.load(Ordering::Relaxed),
            intern_misses: self.intern_misses.load(Ordering::Relaxed),
        }
    }
}

struct VertexMaps {
    forward: FxHashMap<String, VertexId>,
    // Dense ids double as indices into the reverse table.
    reverse: Vec<String>,
}

/// Assigns dense `u32` vertex ids in first-seen order.
///
/// Linearizable: concurrent callers interning the same key observe the same
/// id, and the id sequence has no gaps. The id counter only advances inside
/// the critical section.
pub struct VertexInterner {
    maps: Mutex<VertexMaps>,
    metrics: InternMetrics,
}

impl Default for VertexInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl VertexInterner {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(VertexMaps {
                forward: FxHashMap::default(),
                reverse: Vec::new(),
            }),
            metrics: InternMetrics::default(),
        }
    }

    /// Returns the id already assigned to `key`, or assigns the next one.
    ///
    /// Fails with [`GraphError::VertexSpaceExhausted`] once the dense `u32`
    /// range is used up.
    pub fn intern(&self, key: &str) -> Result<VertexId> {
        self.metrics.intern_calls.fetch_add(1, Ordering::Relaxed);
        let mut maps = self.maps.lock();
        if let Some(&id) = maps.forward.get(key) {
            self.metrics.intern_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }
        if maps.reverse.len() >= VertexId::MAX as usize {
            return Err(GraphError::VertexSpaceExhausted);
        }
        let id = maps.reverse.len() as VertexId;
        maps.forward.insert(key.to_owned(), id);
        maps.reverse.push(key.to_owned());
        self.metrics.intern_misses.fetch_add(1, Ordering::Relaxed);
        trace!(id, len = key.len(), "intern.insert");
        Ok(id)
    }

    /// Inverse lookup; total for every id this interner ever returned.
    pub fn resolve(&self, id: VertexId) -> Option<String> {
        self.maps.lock().reverse.get(id as usize).cloned()
    }

    /// Read-only lookup without assigning an id.
    pub fn lookup(&self, key: &str) -> Option<VertexId> {
        self.maps.lock().forward.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.maps.lock().reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics_snapshot(&self) -> InternMetricsSnapshot {
        self.metrics.snapshot()
    }
}

struct LabelMaps {
    forward: FxHashMap<String, LabelId>,
    // Index 0 stays unused; label ids are dense from 1.
    reverse: Vec<String>,
}

/// Assigns dense `u8` label ids from 1; 0 is reserved as "unset".
///
/// Vertex labels and edge labels live in separate instances.
pub struct LabelInterner {
    maps: Mutex<LabelMaps>,
    metrics: InternMetrics,
}

impl Default for LabelInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelInterner {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(LabelMaps {
                forward: FxHashMap::default(),
                reverse: vec![String::new()],
            }),
            metrics: InternMetrics::default(),
        }
    }

    /// Returns the id already assigned to `label`, or assigns the next one.
    ///
    /// Fails with [`GraphError::LabelSpaceExhausted`] on the 256th distinct
    /// label.
    pub fn intern(&self, label: &str) -> Result<LabelId> {
        self.metrics.intern_calls.fetch_add(1, Ordering::Relaxed);
        let mut maps = self.maps.lock();
        if let Some(&id) = maps.forward.get(label) {
            self.metrics.intern_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }
        if maps.reverse.len() > LabelId::MAX as usize {
            return Err(GraphError::LabelSpaceExhausted);
        }
        let id = maps.reverse.len() as LabelId;
        maps.forward.insert(label.to_owned(), id);
        maps.reverse.push(label.to_owned());
        self.metrics.intern_misses.fetch_add(1, Ordering::Relaxed);
        trace!(id, len = label.len(), "intern.label_insert");
        Ok(id)
    }

    /// Inverse lookup. Returns `None` for 0 ("unset") and unassigned ids.
    pub fn resolve(&self, id: LabelId) -> Option<String> {
        if id == 0 {
            return None;
        }
        self.maps.lock().reverse.get(id as usize).cloned()
    }

    /// Count of distinct labels assigned so far.
    pub fn len(&self) -> usize {
        self.maps.lock().reverse.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics_snapshot(&self) -> InternMetricsSnapshot {
        self.metrics.snapshot()
    }
}
