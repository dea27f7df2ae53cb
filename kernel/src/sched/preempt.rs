//! Yielding, timer preemption and time-slice donation
//!
//! None of these switch from interrupt context or from inside a critical
//! section. There they record an async request on the CPU instead, which is
//! served by [`Scheduler::invoke_async`] once the CPU leaves the last
//! interrupt handler or critical section.

use core::cmp::min;

use log::{debug, trace};

use super::{
    hooks::SchedHooks,
    scheduler::{Followup, Scheduler},
    smp::PendingDonation,
    thread::{ThreadFlags, ThreadId, ThreadState},
};
use crate::arch::{InterruptGuard, Processor};

/// Outcome of [`Scheduler::donate_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Donation {
    /// The beneficiary ran on the donor's remaining quantum
    Switched,
    /// Recorded for the next scheduler run on this CPU
    Deferred,
    /// The donation was not possible; the caller yielded instead
    Yielded,
}

impl<P: Processor, H: SchedHooks> Scheduler<P, H> {
    /// Give up the CPU.
    ///
    /// From an interrupt handler, a critical section or the scheduler
    /// itself this only requests an async scheduler run. Returns whether the
    /// caller was switched out.
    pub fn yield_now(&self) -> bool {
        let _irq = InterruptGuard::new(&self.processor);
        let cpu_id = self.processor.current_cpu();
        let cpu = self.cpu_info(cpu_id);
        if cpu.in_irq() || cpu.critical_depth() > 0 || cpu.in_scheduler() {
            trace!("[SCHED] CPU {} deferring yield", cpu_id);
            cpu.request_async();
            return false;
        }
        self.pick_next()
    }

    /// Deferred scheduler entry, used on interrupt return and when the last
    /// critical section closes. Does nothing if the CPU is already inside
    /// the scheduler.
    pub fn invoke_async(&self) {
        let _irq = InterruptGuard::new(&self.processor);
        let cpu_id = self.processor.current_cpu();
        let cpu = self.cpu_info(cpu_id);
        if cpu.in_irq() {
            crate::sched_fatal!("invoke_async on CPU {} inside an interrupt handler", cpu_id);
        }
        if !cpu.in_scheduler() {
            self.pick_next();
        }
    }

    /// Timer interrupt handler body; every CPU runs its own tick.
    ///
    /// Charges the tick to the current thread. An exhausted quantum is
    /// renewed in place if nothing else could run here; otherwise a
    /// scheduler run is requested for interrupt return. A thread marked to
    /// die dies at the end of its quantum.
    pub fn timer_tick(&self) {
        let cpu_id = self.processor.current_cpu();
        let cpu = self.cpu_info(cpu_id);
        if !cpu.in_irq() {
            crate::sched_fatal!("timer_tick on CPU {} outside interrupt context", cpu_id);
        }
        if !cpu.is_online() {
            return;
        }
        let Some(current) = cpu.current() else {
            return;
        };
        let now = self.hooks.scheduler_time();

        let guard = self.lock_scheduler();
        let followup = {
            let mut st = guard.state();
            let st = &mut *st;

            let Some(thread) = st.threads.get_mut(current) else {
                crate::sched_fatal!(
                    dump = self.dump_locked(st, log::Level::Error);
                    "CPU {} ticking unknown thread {}", cpu_id, current
                );
            };
            thread.update_time_scheduled(now, false);
            thread.ticks_left = thread.ticks_left.saturating_sub(1);
            if thread.ticks_left > 0 {
                return;
            }

            if thread.flags.contains(ThreadFlags::SHOULD_DIE) && !thread.is_idle() {
                thread.flags.remove(ThreadFlags::SHOULD_DIE);
                debug!("[SCHED] thread {} quantum over, dying", current);
                cpu.request_async();
                self.metrics.record_preemption_request();
                self.set_state_locked(st, current, ThreadState::Dying)
            } else if st.ready.peek_next_runnable(&st.threads, cpu_id).is_none() {
                // Nothing else to run: renew rather than bounce through idle.
                self.grant_quantum(st, current);
                self.metrics.record_quantum_renewal();
                Followup::default()
            } else {
                trace!("[SCHED] CPU {} quantum of {} exhausted", cpu_id, current);
                cpu.request_async();
                self.metrics.record_preemption_request();
                Followup::default()
            }
        };
        self.run_followup(followup);
    }

    /// Hand the rest of the caller's quantum to `beneficiary` and switch to
    /// it, ahead of priority order.
    ///
    /// The beneficiary runs for `min(donor ticks - 1, its own quantum)`
    /// ticks. Inside a nested critical section (or interrupt context) the
    /// donation is recorded and honored by the next scheduler run on this
    /// CPU. When the beneficiary cannot run here, or the donor has at most
    /// one tick left, this is a plain yield.
    pub fn donate_to(&self, beneficiary: ThreadId, reason: &'static str) -> Donation {
        let cpu_id = self.processor.current_cpu();
        let cpu = self.cpu_info(cpu_id);
        if cpu.current() == Some(beneficiary) {
            self.yield_now();
            return Donation::Yielded;
        }

        let _irq = InterruptGuard::new(&self.processor);
        cpu.enter_critical();
        let was_in_scheduler = cpu.swap_in_scheduler(true);

        if cpu.critical_depth() > 1 || cpu.in_irq() || was_in_scheduler {
            cpu.set_pending_donation(PendingDonation {
                beneficiary,
                reason,
            });
            cpu.request_async();
            cpu.set_in_scheduler(was_in_scheduler);
            self.leave_scoped_critical(cpu_id);
            self.metrics.record_donation_deferred();
            debug!(
                "[SCHED] CPU {} deferring donation to {} ({})",
                cpu_id, beneficiary, reason
            );
            return Donation::Deferred;
        }

        self.lock.lock(cpu_id);
        let (next, outcome) = {
            let mut st = self.lock.get(cpu_id).borrow_mut();
            let st = &mut *st;

            let donor_ticks = cpu
                .current()
                .and_then(|tid| st.threads.get(tid))
                .map_or(0, |t| t.ticks_left);
            let eligible = donor_ticks > 1
                && st.threads.get(beneficiary).is_some_and(|t| {
                    !t.is_idle()
                        && t.state == ThreadState::Runnable
                        && !t.active
                        && t.can_run_on(cpu_id)
                })
                && st.ready.dequeue(&mut st.threads, beneficiary, Some(cpu_id));

            match st.threads.get_mut(beneficiary) {
                Some(thread) if eligible => {
                    let ticks = min(donor_ticks - 1, self.time_slice_for(thread));
                    thread.active = true;
                    thread.ticks_left = ticks;
                    thread.stats.donations_received += 1;
                    self.metrics.record_donation();
                    debug!(
                        "[SCHED] CPU {} donating {} ticks to {} ({})",
                        cpu_id, ticks, beneficiary, reason
                    );
                    (beneficiary, Donation::Switched)
                }
                _ => {
                    self.metrics.record_donation_fallback();
                    debug!(
                        "[SCHED] CPU {} cannot donate to {} ({}), yielding",
                        cpu_id, beneficiary, reason
                    );
                    let idle = match cpu.idle_thread() {
                        Some(idle) => idle,
                        None => crate::sched_fatal!("CPU {} has no idle thread", cpu_id),
                    };
                    let next = st.ready.pull_next_runnable(&mut st.threads, cpu_id, idle);
                    self.grant_quantum(st, next);
                    if next == idle {
                        self.metrics.record_idle_scheduled();
                    }
                    (next, Donation::Yielded)
                }
            }
        };

        self.leave_scoped_critical(cpu_id);
        self.switch_holding_lock(cpu_id, next, was_in_scheduler);
        outcome
    }
}
