//! Free memory estimates used to throttle producers.

use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::{debug, warn};

/// Reports how much memory the process may still use for buffered dirty files.
pub trait MemoryGauge: Debug + Send + Sync + 'static {
    fn free_memory(&self) -> u64;
}

/// Measures the resident memory of the current process against a budget.
///
/// The budget is the configured limit, or the total memory of the host when no limit is given.
#[derive(Debug)]
pub struct SysinfoMemoryGauge {
    limit: u64,
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SysinfoMemoryGauge {
    pub fn new(limit: Option<u64>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let limit = limit.unwrap_or_else(|| system.total_memory());
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "cannot get current pid, using host memory usage instead");
                None
            }
        };
        Self {
            limit,
            pid,
            system: Mutex::new(system),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn used_memory(&self) -> u64 {
        let mut system = self.system.lock();
        match self.pid {
            Some(pid) => {
                system.refresh_pids_specifics(&[pid], ProcessRefreshKind::new().with_memory());
                system.process(pid).map(|p| p.memory()).unwrap_or_default()
            }
            None => {
                system.refresh_memory();
                system.used_memory()
            }
        }
    }
}

impl MemoryGauge for SysinfoMemoryGauge {
    fn free_memory(&self) -> u64 {
        let used = self.used_memory();
        let free = self.limit.saturating_sub(used);
        debug!(limit = self.limit, used, free, "sampled free memory");
        free
    }
}

/// A gauge reporting whatever free memory it was last set to
#[derive(Debug, Default)]
pub struct MockMemoryGauge {
    free: AtomicU64,
}

impl MockMemoryGauge {
    pub fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
        }
    }

    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl MemoryGauge for MockMemoryGauge {
    fn free_memory(&self) -> u64 {
        self.free.load(Ordering::SeqCst)
    }
}
