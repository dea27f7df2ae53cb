//! Error types for the Kestrel scheduler core
//!
//! Only recoverable conditions are represented here. Broken scheduler
//! invariants never produce a `KernelError`; they halt through
//! [`sched_fatal!`](crate::sched_fatal) instead.

use core::fmt;

use crate::sched::ThreadId;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },

    /// Thread-related errors
    ThreadNotFound {
        tid: ThreadId,
    },

    /// Scheduler-related errors
    SchedulerError(SchedError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    InvalidPriority { priority: u32 },
    InvalidCpuId { cpu: usize },
    InvalidAffinity,
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    IdleThreadImmutable,
    NotInitialized,
    AlreadyInitialized,
    AlreadyStarted { cpu: usize },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::ThreadNotFound { tid } => write!(f, "Thread {} not found", tid),
            Self::SchedulerError(e) => write!(f, "Scheduler error: {}", e),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPriority { priority } => write!(f, "invalid priority {}", priority),
            Self::InvalidCpuId { cpu } => write!(f, "invalid CPU id {}", cpu),
            Self::InvalidAffinity => f.write_str("affinity mask selects no usable CPU"),
            Self::InvalidTransition { from, to } => {
                write!(f, "illegal state transition {} -> {}", from, to)
            }
            Self::IdleThreadImmutable => f.write_str("idle threads cannot be reconfigured"),
            Self::NotInitialized => f.write_str("scheduler not initialized"),
            Self::AlreadyInitialized => f.write_str("scheduler already initialized"),
            Self::AlreadyStarted { cpu } => write!(f, "CPU {} already started", cpu),
        }
    }
}

// Conversion implementations
impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<alloc::collections::TryReserveError> for KernelError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Self::OutOfMemory {
            requested: core::mem::size_of::<crate::sched::thread::Thread>(),
        }
    }
}
