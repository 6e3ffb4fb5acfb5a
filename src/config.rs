use std::path::PathBuf;

use crate::error::{GraphError, Result};

/// Process-level knobs for building and querying a graph.
///
/// `Default` carries the reference values; the named presets tilt the same
/// knobs toward a specific deployment shape.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding cold block files, spill files, and the vertex
    /// manifest. Created if absent.
    pub base_dir: PathBuf,
    /// Advisory process memory ceiling in MiB. Ingest backpressure fires
    /// against this ceiling; it never aborts the build.
    pub mem_limit_mb: u64,
    /// Additionally ask the OS for a hard address-space cap at
    /// `mem_limit_mb`. Best effort; failure is logged and ignored.
    pub hard_mem_cap: bool,
    /// Byte budget for the hot block cache.
    pub max_hot_mem_bytes: u64,
    /// Vertices per block. Must be a power of two.
    pub block_size: u32,
    /// Records handed to a worker per dispatch.
    pub batch_size: usize,
    /// Blocks with an id below this stay resident after ingest.
    pub hot_block_threshold: u32,
    /// Ingest worker threads. Zero selects the rayon default.
    pub workers: usize,
    /// Size of the arena reserved at open time.
    pub emergency_pool_bytes: usize,
    /// Attempt huge-page backing for arenas. Falls back silently.
    pub pool_use_huge_pages: bool,
    /// Fraction of `mem_limit_mb` at which ingest spills builders to disk.
    pub backpressure_ratio: f64,
    /// Hot-cache shrink target applied during backpressure.
    pub shrink_ratio: f64,
    /// Also produce a deduplicated on-disk vertex manifest during ingest.
    pub write_vertex_manifest: bool,
    /// In-memory budget for one sorted vertex run.
    pub vertex_run_bytes: usize,
    /// zstd level for the cold-block adjacency section.
    pub compression_level: i32,
    /// Period of the background memory sampler.
    pub monitor_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./cold_blocks"),
            mem_limit_mb: 6144,
            hard_mem_cap: false,
            max_hot_mem_bytes: 1 << 30,
            block_size: 65_536,
            batch_size: 100_000,
            hot_block_threshold: 1000,
            workers: 0,
            emergency_pool_bytes: 500 << 20,
            pool_use_huge_pages: false,
            backpressure_ratio: 0.9,
            shrink_ratio: 0.5,
            write_vertex_manifest: false,
            vertex_run_bytes: 64 << 20,
            compression_level: 1,
            monitor_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Tuned for a one-shot bulk build on a machine with spare memory.
    pub fn bulk_import() -> Self {
        Self {
            batch_size: 250_000,
            max_hot_mem_bytes: 2 << 30,
            pool_use_huge_pages: true,
            ..Self::default()
        }
    }

    /// Tuned for constrained hosts: small arenas, aggressive spilling.
    pub fn low_memory() -> Self {
        Self {
            mem_limit_mb: 2048,
            max_hot_mem_bytes: 256 << 20,
            emergency_pool_bytes: 64 << 20,
            backpressure_ratio: 0.8,
            shrink_ratio: 0.25,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(GraphError::InvalidConfig(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        if self.block_size > 65_536 {
            return Err(GraphError::InvalidConfig(format!(
                "block_size must leave local slots within 16 bits, got {}",
                self.block_size
            )));
        }
        if self.batch_size == 0 {
            return Err(GraphError::InvalidConfig("batch_size must be nonzero".into()));
        }
        if !(0.0..=1.0).contains(&self.backpressure_ratio) {
            return Err(GraphError::InvalidConfig(format!(
                "backpressure_ratio must lie in [0, 1], got {}",
                self.backpressure_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().expect("reference values");
        Config::bulk_import().validate().expect("bulk preset");
        Config::low_memory().validate().expect("low memory preset");
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let cfg = Config {
            block_size: 100,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(GraphError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_oversized_block_size() {
        let cfg = Config {
            block_size: 1 << 17,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(GraphError::InvalidConfig(_))));
    }
}
