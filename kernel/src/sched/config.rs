//! Scheduler tunables and priority constants

use crate::error::{KernelError, KernelResult};

/// Lowest thread priority. Idle threads run here.
pub const THREAD_PRIORITY_MIN: u32 = 1;
pub const THREAD_PRIORITY_LOW: u32 = 10;
pub const THREAD_PRIORITY_NORMAL: u32 = 30;
pub const THREAD_PRIORITY_HIGH: u32 = 50;
/// Highest thread priority.
pub const THREAD_PRIORITY_MAX: u32 = 99;

/// Number of ready-queue buckets: one per valid priority, one bit each in
/// the ready mask.
pub const READY_QUEUE_BUCKETS: usize = (THREAD_PRIORITY_MAX - THREAD_PRIORITY_MIN + 1) as usize;

/// Maximum number of CPUs supported (one bit each in a `CpuSet`)
pub const MAX_CPUS: usize = 64;

/// Default time slice in timer ticks
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Time slice of an idle thread: one tick, so real work preempts it quickly
pub const IDLE_TIME_SLICE: u32 = 1;

/// Default upper bound on live thread records
pub const DEFAULT_MAX_THREADS: usize = 4096;

/// Boot-time scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Number of CPUs the scheduler manages
    pub cpu_count: usize,
    /// Quantum granted to ordinary threads
    pub default_quantum: u32,
    /// Quantum granted to idle threads
    pub idle_quantum: u32,
    /// Thread-table capacity; creating more threads fails
    pub max_threads: usize,
}

impl SchedConfig {
    pub const fn new(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            default_quantum: DEFAULT_TIME_SLICE,
            idle_quantum: IDLE_TIME_SLICE,
            max_threads: DEFAULT_MAX_THREADS,
        }
    }

    pub const fn with_default_quantum(mut self, ticks: u32) -> Self {
        self.default_quantum = ticks;
        self
    }

    pub const fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> KernelResult<()> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(KernelError::InvalidArgument {
                name: "cpu_count",
                value: "must be between 1 and MAX_CPUS",
            });
        }
        if self.default_quantum == 0 || self.idle_quantum == 0 {
            return Err(KernelError::InvalidArgument {
                name: "quantum",
                value: "must be at least one tick",
            });
        }
        // Every CPU needs an idle thread.
        if self.max_threads <= self.cpu_count {
            return Err(KernelError::InvalidArgument {
                name: "max_threads",
                value: "must exceed the number of idle threads",
            });
        }
        Ok(())
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Whether `priority` lies in the valid range
pub const fn is_valid_priority(priority: u32) -> bool {
    priority >= THREAD_PRIORITY_MIN && priority <= THREAD_PRIORITY_MAX
}

/// Map a thread priority to its ready-queue bucket, 0 being the most urgent.
///
/// Strictly monotonic: every valid priority owns its bucket, so a higher
/// priority always lands in an earlier bucket. Priorities outside the valid
/// range are clamped.
pub const fn priority_to_bucket(priority: u32) -> usize {
    let priority = if priority < THREAD_PRIORITY_MIN {
        THREAD_PRIORITY_MIN
    } else if priority > THREAD_PRIORITY_MAX {
        THREAD_PRIORITY_MAX
    } else {
        priority
    };
    (THREAD_PRIORITY_MAX - priority) as usize
}
