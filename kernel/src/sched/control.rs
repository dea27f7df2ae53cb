//! Thread control surface for the rest of the kernel
//!
//! Creation, blocking primitives, priority and affinity changes, stop and
//! kill requests all go through here. Every entry point takes the global
//! lock and keeps the ready queues consistent with the new state.

use alloc::vec::Vec;

use log::debug;

use super::{
    config::is_valid_priority,
    hooks::SchedHooks,
    scheduler::{Followup, SchedState, Scheduler},
    thread::{CpuSet, Thread, ThreadFlags, ThreadId, ThreadSnapshot, ThreadSpec, ThreadState},
};
use crate::{
    arch::Processor,
    error::{KernelError, KernelResult, SchedError},
};

fn not_found(tid: ThreadId) -> KernelError {
    KernelError::ThreadNotFound { tid }
}

/// Look up `tid` for reconfiguration; idle threads are off limits.
fn configurable(st: &SchedState, tid: ThreadId) -> KernelResult<&Thread> {
    let thread = st.threads.get(tid).ok_or(not_found(tid))?;
    if thread.is_idle() {
        return Err(SchedError::IdleThreadImmutable.into());
    }
    Ok(thread)
}

impl<P: Processor, H: SchedHooks> Scheduler<P, H> {
    /// Register a new thread. A Runnable thread is queued right away.
    pub fn create_thread(&self, spec: ThreadSpec) -> KernelResult<ThreadId> {
        if !is_valid_priority(spec.priority) {
            return Err(SchedError::InvalidPriority {
                priority: spec.priority,
            }
            .into());
        }
        self.check_affinity(spec.affinity)?;
        if !matches!(
            spec.initial_state,
            ThreadState::Runnable | ThreadState::Blocked
        ) {
            return Err(KernelError::InvalidArgument {
                name: "initial_state",
                value: "must be Runnable or Blocked",
            });
        }

        let runnable = spec.initial_state == ThreadState::Runnable;
        let tid = self.locked(|st| {
            let tid = st.threads.insert(spec)?;
            let mut followup = Followup::default();
            if runnable {
                st.ready.enqueue(&mut st.threads, tid);
                followup.wake_idle = true;
            }
            if let Some(thread) = st.threads.get(tid) {
                debug!(
                    "[SCHED] created thread {} '{}' priority {} ({})",
                    tid,
                    thread.name(),
                    thread.priority(),
                    thread.state()
                );
            }
            Ok((tid, followup))
        })?;
        Ok(tid)
    }

    fn check_affinity(&self, affinity: CpuSet) -> KernelResult<()> {
        if affinity.intersects_first(self.cpus.len()) {
            Ok(())
        } else {
            Err(SchedError::InvalidAffinity.into())
        }
    }

    /// Move a thread to `state` on behalf of a collaborator.
    ///
    /// Running and Dead are reserved to the scheduler and the finalizer.
    /// Setting the current state again is a no-op.
    pub fn set_state(&self, tid: ThreadId, state: ThreadState) -> KernelResult<()> {
        self.locked(|st| {
            let from = configurable(st, tid)?.state();
            if from == state {
                return Ok(((), Followup::default()));
            }
            if matches!(state, ThreadState::Running | ThreadState::Dead)
                || !from.can_transition_to(state)
            {
                return Err(SchedError::InvalidTransition {
                    from: from.as_str(),
                    to: state.as_str(),
                }
                .into());
            }
            Ok(((), self.set_state_locked(st, tid, state)))
        })
    }

    /// Make a Blocked thread Runnable. Returns false if it was not blocked.
    pub fn wake(&self, tid: ThreadId) -> KernelResult<bool> {
        self.locked(|st| {
            if configurable(st, tid)?.state() != ThreadState::Blocked {
                return Ok((false, Followup::default()));
            }
            Ok((true, self.set_state_locked(st, tid, ThreadState::Runnable)))
        })
    }

    /// Mark a thread Blocked. Blocking the calling thread takes effect at
    /// its next switch, so the caller yields afterwards.
    pub fn block(&self, tid: ThreadId) -> KernelResult<()> {
        self.set_state(tid, ThreadState::Blocked)
    }

    /// Block the calling thread and give up the CPU
    pub fn block_current(&self) -> KernelResult<()> {
        let tid = self.current_thread().ok_or(SchedError::NotInitialized)?;
        self.block(tid)?;
        self.yield_now();
        Ok(())
    }

    pub fn set_priority(&self, tid: ThreadId, priority: u32) -> KernelResult<()> {
        if !is_valid_priority(priority) {
            return Err(SchedError::InvalidPriority { priority }.into());
        }
        self.locked(|st| {
            configurable(st, tid)?;
            self.requeue_with(st, tid, |thread| thread.priority = priority);
            Ok(((), Followup::default()))
        })
    }

    /// Restrict the CPUs a thread may run on.
    ///
    /// If the caller's own thread loses its current CPU it yields, so it
    /// moves at once.
    pub fn set_affinity(&self, tid: ThreadId, affinity: CpuSet) -> KernelResult<()> {
        self.check_affinity(affinity)?;
        self.locked(|st| {
            configurable(st, tid)?;
            self.requeue_with(st, tid, |thread| thread.affinity = affinity);
            Ok(((), Followup::default()))
        })?;

        let cpu = self.processor.current_cpu();
        if self.current_thread() == Some(tid) && !affinity.contains(cpu) {
            self.yield_now();
        }
        Ok(())
    }

    /// Apply `change` with the thread out of the ready queues, so it lands
    /// in the bucket matching its new parameters.
    fn requeue_with(
        &self,
        st: &mut SchedState,
        tid: ThreadId,
        change: impl FnOnce(&mut Thread),
    ) {
        let queued = st.ready.dequeue(&mut st.threads, tid, None);
        if let Some(thread) = st.threads.get_mut(tid) {
            change(thread);
        }
        if queued {
            st.ready.enqueue(&mut st.threads, tid);
        }
    }

    /// Suspend a thread. A running thread stops when it is next switched
    /// out.
    pub fn request_stop(&self, tid: ThreadId) -> KernelResult<()> {
        self.locked(|st| {
            let state = configurable(st, tid)?.state();
            let followup = match state {
                ThreadState::Running => {
                    if let Some(thread) = st.threads.get_mut(tid) {
                        thread.flags |= ThreadFlags::SHOULD_STOP;
                    }
                    Followup::default()
                }
                ThreadState::Runnable | ThreadState::Blocked => {
                    self.set_state_locked(st, tid, ThreadState::Stopped)
                }
                _ => Followup::default(),
            };
            Ok(((), followup))
        })
    }

    /// Undo [`request_stop`](Self::request_stop). Returns whether a stopped
    /// thread was made Runnable.
    pub fn resume(&self, tid: ThreadId) -> KernelResult<bool> {
        self.locked(|st| {
            let state = configurable(st, tid)?.state();
            if let Some(thread) = st.threads.get_mut(tid) {
                thread.flags.remove(ThreadFlags::SHOULD_STOP);
            }
            if state != ThreadState::Stopped {
                return Ok((false, Followup::default()));
            }
            Ok((true, self.set_state_locked(st, tid, ThreadState::Runnable)))
        })
    }

    /// Terminate a thread.
    ///
    /// A running thread finishes its quantum (or dies when switched out
    /// earlier); any other thread becomes Dying at once and is handed to
    /// the finalizer as soon as it is no longer active.
    pub fn request_die(&self, tid: ThreadId) -> KernelResult<()> {
        self.locked(|st| {
            let state = configurable(st, tid)?.state();
            let followup = match state {
                ThreadState::Dying | ThreadState::Dead => Followup::default(),
                ThreadState::Running => {
                    if let Some(thread) = st.threads.get_mut(tid) {
                        thread.flags |= ThreadFlags::SHOULD_DIE;
                    }
                    Followup::default()
                }
                _ => self.set_state_locked(st, tid, ThreadState::Dying),
            };
            Ok(((), followup))
        })
    }

    /// Terminate the calling thread. On hardware this does not return once
    /// the switch away has happened.
    pub fn exit_current(&self) -> KernelResult<()> {
        let tid = self.current_thread().ok_or(SchedError::NotInitialized)?;
        self.locked(|st| {
            configurable(st, tid)?;
            Ok(((), self.set_state_locked(st, tid, ThreadState::Dying)))
        })?;
        debug!("[SCHED] thread {} exiting", tid);
        self.yield_now();
        Ok(())
    }

    /// Link a Runnable thread into the ready queues
    pub fn enqueue_runnable(&self, tid: ThreadId) {
        let guard = self.lock_scheduler();
        let mut st = guard.state();
        let st = &mut *st;
        st.ready.enqueue(&mut st.threads, tid);
    }

    /// Unlink a thread from the ready queues. With `check_affinity`, a
    /// thread that may not run on the calling CPU stays queued.
    pub fn dequeue_runnable(&self, tid: ThreadId, check_affinity: bool) -> bool {
        let cpu = check_affinity.then(|| self.processor.current_cpu());
        let guard = self.lock_scheduler();
        let mut st = guard.state();
        let st = &mut *st;
        st.ready.dequeue(&mut st.threads, tid, cpu)
    }

    pub fn thread_info(&self, tid: ThreadId) -> KernelResult<ThreadSnapshot> {
        let guard = self.lock_scheduler();
        let snapshot = guard.state().threads.get(tid).map(|t| t.snapshot());
        snapshot.ok_or(not_found(tid))
    }

    /// Snapshots of every thread, in table order
    pub fn threads(&self) -> Vec<ThreadSnapshot> {
        let guard = self.lock_scheduler();
        let snapshots = guard.state().threads.iter().map(|t| t.snapshot()).collect();
        snapshots
    }

    pub fn thread_count(&self) -> usize {
        let guard = self.lock_scheduler();
        let count = guard.state().threads.len();
        count
    }

    /// Threads currently linked into the ready queues
    pub fn runnable_count(&self) -> usize {
        let guard = self.lock_scheduler();
        let count = guard.state().ready.len();
        count
    }
}
