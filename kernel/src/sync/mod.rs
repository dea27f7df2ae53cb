//! Synchronization Primitives
//!
//! Locks used by the scheduler core. Data that only ever belongs to one CPU
//! is kept in atomics on that CPU's `CpuInfo` and needs no lock at all.

pub mod recursive_spinlock;

pub use recursive_spinlock::RecursiveSpinlock;
