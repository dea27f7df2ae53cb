//! Collaborators the scheduler calls out to
//!
//! Time keeping, signal delivery, the finalizer's wait queue and resource
//! reclamation belong to other kernel subsystems. The scheduler reaches
//! them only through [`SchedHooks`].

use super::thread::{Thread, ThreadId};

pub trait SchedHooks: Send + Sync {
    /// Monotonic time used for scheduled-time accounting
    fn scheduler_time(&self) -> u64;

    /// Deliver at most one pending asynchronous signal to `thread`, which
    /// has just been switched in. Returns whether one was delivered.
    fn dispatch_one_pending_signal(&self, thread: ThreadId) -> bool {
        let _ = thread;
        false
    }

    /// Park the finalizer thread until [`finalizer_wake`](Self::finalizer_wake).
    fn finalizer_wait(&self);

    /// Wake the parked finalizer thread.
    fn finalizer_wake(&self);

    /// Free everything a reclaimed thread owned (stack, address space,
    /// handles). Called without the scheduler lock, after the record has
    /// left the thread table.
    fn release_thread(&self, thread: &Thread) {
        let _ = thread;
    }
}
