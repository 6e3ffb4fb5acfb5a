use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use sysinfo::{Pid, System};
use tracing::{error, trace, warn};

/// Samples the process resident size against an advisory ceiling.
///
/// A background thread refreshes the reading once per interval; callers on
/// the ingest path refresh synchronously at batch boundaries. The monitor
/// never fails an operation itself; the loader reacts to the ratio with
/// backpressure.
pub struct MemoryMonitor {
    shared: Arc<MonitorShared>,
    handle: Option<JoinHandle<()>>,
}

struct MonitorShared {
    mem_limit_mb: u64,
    used_mb: AtomicU64,
    // f64 bits of the last usage ratio.
    ratio_bits: AtomicU64,
    sampler: Mutex<Sampler>,
    stop: Mutex<bool>,
    stopped: Condvar,
}

struct Sampler {
    system: System,
    pid: Option<Pid>,
}

impl MonitorShared {
    fn sample(&self) {
        let mut sampler = self.sampler.lock();
        let Some(pid) = sampler.pid else { return };
        sampler.system.refresh_process(pid);
        let used_bytes = sampler
            .system
            .process(pid)
            .map(|process| process.memory())
            .unwrap_or(0);
        drop(sampler);

        let used_mb = used_bytes / (1024 * 1024);
        let ratio = if self.mem_limit_mb == 0 {
            0.0
        } else {
            used_mb as f64 / self.mem_limit_mb as f64
        };
        self.used_mb.store(used_mb, Ordering::Relaxed);
        self.ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
        trace!(used_mb, limit_mb = self.mem_limit_mb, ratio, "monitor.sample");
    }
}

impl MemoryMonitor {
    /// Starts the sampling thread and takes an immediate first reading.
    pub fn start(mem_limit_mb: u64, interval: Duration) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("monitor.pid_unavailable");
        }
        let shared = Arc::new(MonitorShared {
            mem_limit_mb,
            used_mb: AtomicU64::new(0),
            ratio_bits: AtomicU64::new(0f64.to_bits()),
            sampler: Mutex::new(Sampler {
                system: System::new(),
                pid,
            }),
            stop: Mutex::new(false),
            stopped: Condvar::new(),
        });
        shared.sample();

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("shale-mem-monitor".into())
            .spawn(move || loop {
                {
                    let mut stop = worker.stop.lock();
                    if *stop {
                        return;
                    }
                    worker.stopped.wait_for(&mut stop, interval);
                    if *stop {
                        return;
                    }
                }
                worker.sample();
            })
            .expect("spawn memory monitor thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Forces a fresh reading; used at ingest batch boundaries.
    pub fn refresh(&self) {
        self.shared.sample();
    }

    /// Last sampled resident size in MiB.
    pub fn used_mb(&self) -> u64 {
        self.shared.used_mb.load(Ordering::Relaxed)
    }

    /// Last sampled resident size over the advisory ceiling.
    pub fn usage_ratio(&self) -> f64 {
        f64::from_bits(self.shared.ratio_bits.load(Ordering::Relaxed))
    }

    pub fn mem_limit_mb(&self) -> u64 {
        self.shared.mem_limit_mb
    }

    /// Logs against the two thresholds and reports whether the hard limit
    /// tripped. Advisory: callers throttle, they do not abort.
    pub fn check_threshold(&self, warn_ratio: f64, limit_ratio: f64) -> bool {
        let ratio = self.usage_ratio();
        if ratio >= limit_ratio {
            error!(
                used_mb = self.used_mb(),
                limit_mb = self.shared.mem_limit_mb,
                ratio,
                "monitor.hard_limit"
            );
            return true;
        }
        if ratio >= warn_ratio {
            warn!(
                used_mb = self.used_mb(),
                limit_mb = self.shared.mem_limit_mb,
                ratio,
                "monitor.pressure"
            );
        }
        false
    }

    pub fn stop(&mut self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
        }
        self.shared.stopped.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Best-effort hard address-space cap for the process. Failure is
/// reported, not fatal: the cap is an extra guard, backpressure is the
/// real control.
pub fn set_process_mem_limit(mem_limit_mb: u64) -> bool {
    #[cfg(unix)]
    {
        let bytes = mem_limit_mb.saturating_mul(1024 * 1024);
        let limit = libc::rlimit {
            rlim_cur: bytes as libc::rlim_t,
            rlim_max: bytes as libc::rlim_t,
        };
        let ok = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } == 0;
        if !ok {
            warn!(mem_limit_mb, "monitor.rlimit_failed");
        }
        ok
    }
    #[cfg(not(unix))]
    {
        warn!(mem_limit_mb, "monitor.rlimit_unsupported");
        false
    }
}
