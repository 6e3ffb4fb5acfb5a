mod monitor;

pub use monitor::{set_process_mem_limit, MemoryMonitor};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};

/// Pre-reserved anonymous arenas shared by ingest and query.
///
/// The emergency pool is mapped at open; the query pool is mapped at the
/// ingest-to-query transition. Huge pages and `mlock` are attempted when
/// asked for and silently degraded when the host cannot provide them.
/// The arenas are an environmental optimization, never load-bearing for
/// correctness.
pub struct MemoryPool {
    emergency: Option<MmapMut>,
    query: Option<MmapMut>,
    use_huge_pages: bool,
}

impl MemoryPool {
    pub fn new(emergency_bytes: usize, use_huge_pages: bool) -> Self {
        let emergency = map_arena(emergency_bytes, use_huge_pages);
        if emergency.is_none() && emergency_bytes > 0 {
            warn!(bytes = emergency_bytes, "mempool.emergency_unavailable");
        }
        Self {
            emergency,
            query: None,
            use_huge_pages,
        }
    }

    /// Capacity of the emergency arena actually reserved.
    pub fn emergency_capacity(&self) -> usize {
        self.emergency.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    /// Capacity of the query arena, once allocated.
    pub fn query_capacity(&self) -> usize {
        self.query.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    /// Reserves the query arena for the read-only phase. Returns whether
    /// the full request was satisfied; a shortfall leaves the emergency
    /// arena serving queries.
    pub fn alloc_query_pool(&mut self, query_mb: u64) -> bool {
        let requested = (query_mb as usize).saturating_mul(1024 * 1024);
        let emergency = self.emergency_capacity();
        if requested <= emergency {
            lock_arena(self.emergency.as_ref());
            debug!(requested, emergency, "mempool.query_from_emergency");
            return true;
        }

        let extra = requested - emergency;
        match map_arena(extra, self.use_huge_pages) {
            Some(arena) => {
                lock_arena(Some(&arena));
                lock_arena(self.emergency.as_ref());
                self.query = Some(arena);
                info!(requested, extra, "mempool.query_allocated");
                true
            }
            None => {
                lock_arena(self.emergency.as_ref());
                warn!(requested, emergency, "mempool.query_shortfall");
                false
            }
        }
    }

    /// Drops the query arena; the emergency arena stays for the process
    /// lifetime.
    pub fn free_query_pool(&mut self) {
        if self.query.take().is_some() {
            debug!("mempool.query_freed");
        }
    }
}

fn map_arena(bytes: usize, use_huge_pages: bool) -> Option<MmapMut> {
    if bytes == 0 {
        return None;
    }
    #[cfg(target_os = "linux")]
    if use_huge_pages {
        let mut options = MmapOptions::new();
        options.len(bytes).huge(None);
        match options.map_anon() {
            Ok(arena) => return Some(arena),
            Err(e) => debug!(bytes, error = %e, "mempool.huge_pages_fallback"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = use_huge_pages;

    MmapOptions::new().len(bytes).map_anon().ok()
}

fn lock_arena(arena: Option<&MmapMut>) {
    #[cfg(unix)]
    if let Some(arena) = arena {
        if let Err(e) = arena.lock() {
            debug!(bytes = arena.len(), error = %e, "mempool.mlock_skipped");
        }
    }
    #[cfg(not(unix))]
    let _ = arena;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_emergency_arena() {
        let pool = MemoryPool::new(1 << 20, false);
        assert_eq!(pool.emergency_capacity(), 1 << 20);
    }

    #[test]
    fn zero_sized_pool_is_permitted() {
        let pool = MemoryPool::new(0, false);
        assert_eq!(pool.emergency_capacity(), 0);
    }

    #[test]
    fn query_pool_within_emergency_needs_no_extra_arena() {
        let mut pool = MemoryPool::new(4 << 20, false);
        assert!(pool.alloc_query_pool(2));
        assert_eq!(pool.query_capacity(), 0);
    }

    #[test]
    fn query_pool_beyond_emergency_maps_extra() {
        let mut pool = MemoryPool::new(1 << 20, false);
        assert!(pool.alloc_query_pool(3));
        assert_eq!(pool.query_capacity(), 2 << 20);
        pool.free_query_pool();
        assert_eq!(pool.query_capacity(), 0);
    }

    #[test]
    fn huge_page_request_falls_back() {
        // Hosts without huge pages configured must still get an arena.
        let pool = MemoryPool::new(1 << 20, true);
        assert_eq!(pool.emergency_capacity(), 1 << 20);
    }
}
