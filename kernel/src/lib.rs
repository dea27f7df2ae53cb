//! Kestrel Kernel Library
//!
//! The preemptive, priority-based, SMP-aware thread scheduler of the Kestrel
//! kernel: ready queues, per-CPU scheduler state, the context switch
//! protocol, yielding, time-slice donation, timer preemption, the idle loop
//! and deferred reclamation of dead threads.
//!
//! The crate is `no_std`. Hardware is reached only through the
//! [`arch::Processor`] and [`sched::hooks::SchedHooks`] traits, so the
//! standard library is linked for unit tests alone.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod error;
pub mod sched;
pub mod sync;

// Re-export scheduler items for the rest of the kernel
pub use error::{KernelError, KernelResult, SchedError};
pub use sched::{
    config::SchedConfig, CpuSet, Donation, Scheduler, ThreadId, ThreadSnapshot, ThreadSpec,
    ThreadState,
};
