//! Deferred reclamation of dead threads
//!
//! A Dying thread may still be executing on some CPU, or its stack may still
//! be in use by the switch that moved away from it. The finalizer only
//! reclaims threads that are Dying and no longer active, on its own thread
//! and outside the scheduler lock.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use log::{debug, info, trace};

use super::{
    hooks::SchedHooks,
    scheduler::Scheduler,
    thread::{Thread, ThreadId, ThreadSpec, ThreadState},
};
use crate::{arch::Processor, error::KernelResult};

impl<P: Processor, H: SchedHooks> Scheduler<P, H> {
    /// Create the finalizer thread. Its body is
    /// [`finalizer_main`](Self::finalizer_main).
    pub fn spawn_finalizer(&self, spec: ThreadSpec) -> KernelResult<ThreadId> {
        let tid = self.create_thread(spec)?;
        {
            let guard = self.lock_scheduler();
            guard.state().finalizer_thread = Some(tid);
        }
        info!("[SCHED] finalizer thread {} spawned", tid);
        Ok(tid)
    }

    pub fn finalizer_thread(&self) -> Option<ThreadId> {
        let guard = self.lock_scheduler();
        let tid = guard.state().finalizer_thread;
        tid
    }

    /// Flag pending work. Only the first notification after a pass wakes
    /// the finalizer; later ones coalesce into it.
    pub(crate) fn notify_finalizer(&self) {
        if self
            .finalizer_has_work
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("[SCHED] waking finalizer");
            self.metrics.record_finalizer_wake();
            self.hooks.finalizer_wake();
        }
    }

    pub fn finalizer_has_work(&self) -> bool {
        self.finalizer_has_work.load(Ordering::Acquire)
    }

    /// Body of the finalizer thread.
    pub fn finalizer_main(&self) -> ! {
        loop {
            if self.finalizer_has_work.swap(false, Ordering::AcqRel) {
                self.finalize_dying_threads();
            } else {
                self.hooks.finalizer_wait();
            }
        }
    }

    /// One finalizer pass. Returns the number of threads reclaimed.
    pub fn run_finalizer_pass(&self) -> usize {
        self.finalizer_has_work.store(false, Ordering::Release);
        self.finalize_dying_threads()
    }

    fn finalize_dying_threads(&self) -> usize {
        let reclaimed: Vec<Thread> = {
            let guard = self.lock_scheduler();
            let mut st = guard.state();
            let st = &mut *st;

            let dying: Vec<ThreadId> = st
                .threads
                .iter()
                .filter(|t| t.is_finalizable())
                .map(Thread::tid)
                .collect();
            let mut reclaimed = Vec::with_capacity(dying.len());
            for tid in dying {
                let _ = self.set_state_locked(st, tid, ThreadState::Dead);
                if let Some(thread) = st.threads.remove(tid) {
                    reclaimed.push(thread);
                }
            }
            reclaimed
        };

        for thread in &reclaimed {
            debug!(
                "[SCHED] finalizer reclaimed thread {} '{}' after {} time units",
                thread.tid(),
                thread.name(),
                thread.total_scheduled
            );
            self.hooks.release_thread(thread);
        }
        self.metrics.record_reclaimed(reclaimed.len() as u64);
        reclaimed.len()
    }
}
