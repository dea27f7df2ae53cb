//! Thread scheduling module
//!
//! Implements a preemptive, priority-based SMP scheduler with:
//! - One FIFO ready-queue bucket per priority, indexed by a bitmap
//! - CPU affinity and per-CPU idle threads
//! - A recursive global lock released on the far side of a context switch
//! - Timer-driven preemption on every CPU
//! - Directed time-slice donation
//! - Deferred reclamation of dead threads by a finalizer thread

pub mod config;
pub mod control;
pub mod debug;
pub mod finalizer;
pub mod hooks;
pub mod idle;
pub mod metrics;
pub mod preempt;
pub mod queue;
pub mod scheduler;
pub mod smp;
pub mod switch;
pub mod table;
pub mod thread;

// Re-export common types
pub use hooks::SchedHooks;
pub use metrics::{MetricsSummary, SchedulerMetrics};
pub use preempt::Donation;
pub use scheduler::Scheduler;
pub use smp::{CpuInfo, PendingDonation};
pub use thread::{CpuSet, ThreadFlags, ThreadId, ThreadSnapshot, ThreadSpec, ThreadState, ThreadStats};
