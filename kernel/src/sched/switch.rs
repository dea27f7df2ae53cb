//! Thread selection and the context switch protocol
//!
//! The global lock is acquired on the outgoing thread's stack and released
//! on the incoming thread's stack, once the switch has completed:
//!
//! 1. `pick_next` enters a scoped critical section, sets the CPU's
//!    reentrancy flag and takes the lock.
//! 2. A pending donation or the ready queues choose the next thread, which
//!    is marked active before the lock could ever be dropped.
//! 3. The scoped critical section ends; the lock stays held.
//! 4. `context_switch` demotes the outgoing thread, promotes the incoming
//!    one and calls [`Processor::switch_context`].
//! 5. On the far side the resumed thread runs the epilogue
//!    ([`Scheduler::enter_current`]), drops the lock and restores the
//!    reentrancy flag of the CPU it now runs on.
//!
//! A thread that has never run has no step 5 to return to; its first frame
//! calls [`Scheduler::leave_on_first_switch`] instead.

use log::{debug, trace, Level};

use super::{
    hooks::SchedHooks,
    scheduler::{Followup, SchedState, Scheduler},
    thread::{ThreadFlags, ThreadId, ThreadState},
};
use crate::arch::{CpuId, Processor};

impl<P: Processor, H: SchedHooks> Scheduler<P, H> {
    /// Pick the next thread for the calling CPU and switch to it.
    ///
    /// Interrupts must be disabled and no critical section may be open.
    /// Returns once the calling thread runs again; `true` if it was switched
    /// out in between.
    pub fn pick_next(&self) -> bool {
        if self.processor.interrupts_enabled() {
            crate::sched_fatal!("pick_next with interrupts enabled");
        }
        let cpu_id = self.processor.current_cpu();
        let cpu = self.cpu_info(cpu_id);
        let Some(idle) = cpu.idle_thread().filter(|_| cpu.is_online()) else {
            crate::sched_fatal!("pick_next on CPU {} before it was started", cpu_id);
        };

        cpu.enter_critical();
        let was_in_scheduler = cpu.swap_in_scheduler(true);
        self.lock.lock(cpu_id);
        self.metrics.record_schedule_call();

        let next = {
            let mut st = self.lock.get(cpu_id).borrow_mut();
            let st = &mut *st;

            #[cfg(feature = "sched-debug")]
            self.dump_locked(st, Level::Debug);

            let next = match self.claim_pending_donation(st, cpu_id) {
                Some(beneficiary) => beneficiary,
                None => st.ready.pull_next_runnable(&mut st.threads, cpu_id, idle),
            };
            self.grant_quantum(st, next);
            next
        };
        if next == idle {
            self.metrics.record_idle_scheduled();
        }

        self.leave_scoped_critical(cpu_id);
        self.switch_holding_lock(cpu_id, next, was_in_scheduler)
    }

    /// Take this CPU's pending donation, if any, and claim its beneficiary
    /// when it can still run here. The request is consumed either way.
    fn claim_pending_donation(&self, st: &mut SchedState, cpu_id: CpuId) -> Option<ThreadId> {
        let pending = self.cpu_info(cpu_id).take_pending_donation()?;
        let beneficiary = pending.beneficiary;

        let eligible = st.threads.get(beneficiary).is_some_and(|t| {
            !t.is_idle() && t.state == ThreadState::Runnable && !t.active && t.can_run_on(cpu_id)
        }) && st.ready.dequeue(&mut st.threads, beneficiary, Some(cpu_id));

        match st.threads.get_mut(beneficiary) {
            Some(thread) if eligible => {
                thread.active = true;
                thread.stats.donations_received += 1;
                self.metrics.record_donation();
                debug!(
                    "[SCHED] CPU {} honoring pending donation to {} ({})",
                    cpu_id, beneficiary, pending.reason
                );
                Some(beneficiary)
            }
            _ => {
                self.metrics.record_donation_fallback();
                debug!(
                    "[SCHED] CPU {} dropping pending donation to {} ({})",
                    cpu_id, beneficiary, pending.reason
                );
                None
            }
        }
    }

    /// Give `tid` a full quantum
    pub(crate) fn grant_quantum(&self, st: &mut SchedState, tid: ThreadId) {
        if let Some(thread) = st.threads.get_mut(tid) {
            thread.ticks_left = self.time_slice_for(thread);
        }
    }

    /// Switch to `next` with the global lock held once by `cpu_id` and no
    /// critical section open, then release the lock on the far side.
    pub(crate) fn switch_holding_lock(
        &self,
        cpu_id: CpuId,
        next: ThreadId,
        was_in_scheduler: bool,
    ) -> bool {
        if !self.lock.is_locked_by(cpu_id) || self.lock.depth() != 1 {
            crate::sched_fatal!(
                dump = self.dump_at(Level::Error);
                "CPU {} switching with scheduler lock owner {:?} depth {}",
                cpu_id,
                self.lock.owner(),
                self.lock.depth()
            );
        }
        let critical = self.cpu_info(cpu_id).critical_depth();
        if critical != 0 {
            crate::sched_fatal!(
                dump = self.dump_at(Level::Error);
                "CPU {} switching inside a critical section (depth {})", cpu_id, critical
            );
        }

        let switched = self.context_switch(cpu_id, next);

        // Far side: possibly a different thread, so re-read the CPU.
        let cpu_id = self.processor.current_cpu();
        self.lock.unlock(cpu_id);
        let cpu = self.cpu_info(cpu_id);
        if !cpu.in_scheduler() {
            crate::sched_fatal!(
                dump = self.dump_at(Level::Error);
                "CPU {} resumed a thread outside the scheduler", cpu_id
            );
        }
        cpu.set_in_scheduler(was_in_scheduler);
        switched
    }

    /// Make `target` the running thread of `cpu_id`.
    ///
    /// The outgoing thread, if still running, becomes Dying, Stopped or
    /// Runnable according to its flags. Switching to the thread that is
    /// already current does nothing and keeps it active.
    fn context_switch(&self, cpu_id: CpuId, target: ThreadId) -> bool {
        let cpu = self.cpu_info(cpu_id);
        let Some(from) = cpu.current() else {
            crate::sched_fatal!("CPU {} has no current thread", cpu_id);
        };
        if from == target {
            trace!("[SCHED] CPU {} keeps running {}", cpu_id, target);
            return false;
        }

        let (init, voluntary, followup) = {
            let mut st = self.lock.get(cpu_id).borrow_mut();
            let st = &mut *st;

            let Some((from_state, from_flags)) = st.threads.get(from).map(|t| (t.state, t.flags))
            else {
                crate::sched_fatal!(
                    dump = self.dump_locked(st, Level::Error);
                    "CPU {} switching away from unknown thread {}", cpu_id, from
                );
            };
            let voluntary = from_state != ThreadState::Running;
            let mut followup = Followup::default();
            if voluntary {
                let doomed = from_flags.contains(ThreadFlags::SHOULD_DIE)
                    && matches!(
                        from_state,
                        ThreadState::Runnable | ThreadState::Blocked | ThreadState::Stopped
                    );
                if let Some(outgoing) = st.threads.get_mut(from) {
                    outgoing.stats.voluntary_switches += 1;
                    if doomed {
                        outgoing
                            .flags
                            .remove(ThreadFlags::SHOULD_STOP | ThreadFlags::SHOULD_DIE);
                    }
                }
                // A pending death outranks the wait it left on.
                if doomed {
                    followup = self.set_state_locked(st, from, ThreadState::Dying);
                }
            } else {
                let demoted = if from_flags.contains(ThreadFlags::SHOULD_DIE) {
                    ThreadState::Dying
                } else if from_flags.contains(ThreadFlags::SHOULD_STOP) {
                    ThreadState::Stopped
                } else {
                    ThreadState::Runnable
                };
                if let Some(outgoing) = st.threads.get_mut(from) {
                    outgoing.stats.involuntary_switches += 1;
                    outgoing
                        .flags
                        .remove(ThreadFlags::SHOULD_STOP | ThreadFlags::SHOULD_DIE);
                }
                followup = self.set_state_locked(st, from, demoted);
            }

            let Some(incoming) = st.threads.get_mut(target) else {
                crate::sched_fatal!(
                    dump = self.dump_locked(st, Level::Error);
                    "CPU {} switching to unknown thread {}", cpu_id, target
                );
            };
            if !incoming.active || incoming.state != ThreadState::Runnable || incoming.is_queued() {
                let (state, active) = (incoming.state, incoming.active);
                crate::sched_fatal!(
                    dump = self.dump_locked(st, Level::Error);
                    "CPU {} switching to thread {} (state {}, active {}) it never claimed",
                    cpu_id, target, state, active
                );
            }
            let init = (!incoming.flags.contains(ThreadFlags::INITIALIZED)).then(|| {
                incoming.flags |= ThreadFlags::INITIALIZED;
                (incoming.entry_point, incoming.stack_top)
            });
            incoming.last_cpu = Some(cpu_id);
            incoming.stats.run_count += 1;
            let followup = followup.merge(self.set_state_locked(st, target, ThreadState::Running));
            (init, voluntary, followup)
        };
        self.run_followup(followup);

        if let Some((entry_point, stack_top)) = init {
            self.processor.init_context(target, entry_point, stack_top);
        }
        cpu.set_current(target);
        self.metrics.record_context_switch(voluntary);
        trace!("[SCHED] CPU {} switch {} -> {}", cpu_id, from, target);

        let prev = self.processor.switch_context(from, target);
        self.enter_current(prev);
        true
    }

    /// Epilogue of every switch, run by the thread that was just switched
    /// in, with the global lock still held.
    ///
    /// Closes the outgoing thread's accounting window and clears its active
    /// flag, hands it to the finalizer if it died, opens the incoming
    /// thread's window and delivers it one pending signal.
    pub(crate) fn enter_current(&self, prev: ThreadId) {
        let cpu_id = self.processor.current_cpu();
        let Some(current) = self.cpu_info(cpu_id).current() else {
            crate::sched_fatal!("CPU {} resumed without a current thread", cpu_id);
        };
        let now = self.hooks.scheduler_time();

        let prev_died = {
            let mut st = self.lock.get(cpu_id).borrow_mut();
            let mut prev_died = false;
            if let Some(outgoing) = st.threads.get_mut(prev) {
                outgoing.update_time_scheduled(now, true);
                if prev != current {
                    outgoing.active = false;
                    prev_died = outgoing.state == ThreadState::Dying;
                }
            }
            if let Some(incoming) = st.threads.get_mut(current) {
                incoming.update_time_scheduled(now, false);
            }
            prev_died
        };

        if prev_died {
            self.notify_finalizer();
        }
        self.hooks.dispatch_one_pending_signal(current);
    }

    /// Entry continuation of a thread's very first run.
    ///
    /// The frame built by [`Processor::init_context`] must call this before
    /// the thread's entry point, passing the thread that ran before it.
    pub fn leave_on_first_switch(&self, prev: ThreadId) {
        self.enter_current(prev);
        let cpu_id = self.processor.current_cpu();
        self.lock.unlock(cpu_id);
        self.cpu_info(cpu_id).set_in_scheduler(false);
    }
}
