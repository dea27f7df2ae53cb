//! Core scheduler implementation
//!
//! [`Scheduler`] is the one explicitly constructed handle through which the
//! rest of the kernel reaches the scheduler. It owns the global recursive
//! lock, the thread arena and ready queues behind that lock, and one
//! [`CpuInfo`] per CPU.
//!
//! Locking: the global lock is owned by a CPU, not a thread. Ordinary entry
//! points take it through [`SchedGuard`], which also disables interrupts and
//! enters a critical section. The switch paths in `switch.rs` take it raw,
//! because it is released on the far side of the context switch.

use alloc::{boxed::Box, format, vec::Vec};
use core::{
    cell::{RefCell, RefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use log::{info, trace, Level};

use super::{
    config::{SchedConfig, THREAD_PRIORITY_MIN},
    debug::{dump_cpus, dump_threads},
    hooks::SchedHooks,
    metrics::SchedulerMetrics,
    queue::ReadyQueueSet,
    smp::CpuInfo,
    table::ThreadTable,
    thread::{CpuSet, Thread, ThreadFlags, ThreadId, ThreadSpec, ThreadState},
};
use crate::{
    arch::{CpuId, InterruptGuard, Processor},
    error::{KernelResult, SchedError},
    sync::RecursiveSpinlock,
};

/// Everything guarded by the global scheduler lock
pub(crate) struct SchedState {
    pub(crate) threads: ThreadTable,
    pub(crate) ready: ReadyQueueSet,
    pub(crate) finalizer_thread: Option<ThreadId>,
}

/// Work owed after a state change, run once the state borrow is released
#[must_use]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Followup {
    pub(crate) wake_idle: bool,
    pub(crate) notify_finalizer: bool,
}

impl Followup {
    pub(crate) fn merge(self, other: Followup) -> Followup {
        Followup {
            wake_idle: self.wake_idle || other.wake_idle,
            notify_finalizer: self.notify_finalizer || other.notify_finalizer,
        }
    }
}

/// Scheduler handle
pub struct Scheduler<P: Processor, H: SchedHooks> {
    pub(crate) processor: P,
    pub(crate) hooks: H,
    pub(crate) config: SchedConfig,
    pub(crate) lock: RecursiveSpinlock<RefCell<SchedState>>,
    pub(crate) cpus: Box<[CpuInfo]>,
    /// Set on a false -> true edge only; cleared by each finalizer pass
    pub(crate) finalizer_has_work: AtomicBool,
    pub(crate) metrics: SchedulerMetrics,
    initialized: AtomicBool,
}

/// Global lock held by the executing CPU, with interrupts off and a
/// critical section entered.
///
/// Dropping the guard may run a scheduler pass that was requested while it
/// was held.
pub(crate) struct SchedGuard<'a, P: Processor, H: SchedHooks> {
    sched: &'a Scheduler<P, H>,
    cpu: CpuId,
    interrupts_were_enabled: bool,
}

impl<P: Processor, H: SchedHooks> SchedGuard<'_, P, H> {
    pub(crate) fn state(&self) -> RefMut<'_, SchedState> {
        self.sched.lock.get(self.cpu).borrow_mut()
    }
}

impl<P: Processor, H: SchedHooks> Drop for SchedGuard<'_, P, H> {
    fn drop(&mut self) {
        self.sched.lock.unlock(self.cpu);
        self.sched.leave_critical_on(self.cpu);
        if self.interrupts_were_enabled {
            self.sched.processor.enable_interrupts();
        }
    }
}

impl<P: Processor, H: SchedHooks> Scheduler<P, H> {
    /// Create a scheduler for `config.cpu_count` CPUs.
    ///
    /// Nothing runs until [`initialize`](Self::initialize) has created the
    /// idle threads and each CPU has called [`start`](Self::start).
    pub fn new(processor: P, hooks: H, config: SchedConfig) -> KernelResult<Self> {
        config.validate()?;

        let cpus: Vec<CpuInfo> = (0..config.cpu_count).map(CpuInfo::new).collect();
        Ok(Self {
            processor,
            hooks,
            config,
            lock: RecursiveSpinlock::new(RefCell::new(SchedState {
                threads: ThreadTable::new(config.max_threads),
                ready: ReadyQueueSet::new(),
                finalizer_thread: None,
            })),
            cpus: cpus.into_boxed_slice(),
            finalizer_has_work: AtomicBool::new(false),
            metrics: SchedulerMetrics::new(),
            initialized: AtomicBool::new(false),
        })
    }

    /// Create one idle thread per CPU and make it that CPU's current thread.
    pub fn initialize(&self) -> KernelResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(SchedError::AlreadyInitialized.into());
        }

        let result = self.locked(|st| {
            for cpu in self.cpus.iter() {
                let spec = ThreadSpec::new(&format!("idle thread #{}", cpu.id), THREAD_PRIORITY_MIN)
                    .with_affinity(CpuSet::single(cpu.id));
                let tid = st.threads.insert(spec)?;
                if let Some(idle) = st.threads.get_mut(tid) {
                    idle.flags |= ThreadFlags::IDLE;
                }
                cpu.set_idle_thread(tid);
                cpu.set_current(tid);
            }
            Ok(((), Followup::default()))
        });

        match result {
            Ok(()) => {
                info!(
                    "[SCHED] Initialized for {} CPUs (quantum {} ticks, idle quantum {})",
                    self.config.cpu_count, self.config.default_quantum, self.config.idle_quantum
                );
                Ok(())
            }
            Err(err) => {
                self.initialized.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Bring the executing CPU under scheduler control.
    ///
    /// Called once per CPU from its boot stack, which is adopted as the
    /// CPU's idle thread. The caller continues with
    /// [`idle_loop`](Self::idle_loop).
    pub fn start(&self) -> KernelResult<()> {
        if !self.is_initialized() {
            return Err(SchedError::NotInitialized.into());
        }

        let _irq = InterruptGuard::new(&self.processor);
        let cpu_id = self.processor.current_cpu();
        let cpu = self
            .cpus
            .get(cpu_id)
            .ok_or(SchedError::InvalidCpuId { cpu: cpu_id })?;
        let Some(idle) = cpu.idle_thread() else {
            return Err(SchedError::NotInitialized.into());
        };
        if !cpu.bring_online() {
            return Err(SchedError::AlreadyStarted { cpu: cpu_id }.into());
        }

        let now = self.hooks.scheduler_time();
        self.lock.lock(cpu_id);
        {
            let mut st = self.lock.get(cpu_id).borrow_mut();
            let Some(thread) = st.threads.get_mut(idle) else {
                crate::sched_fatal!("CPU {} lost its idle thread {}", cpu_id, idle);
            };
            thread.state = ThreadState::Running;
            thread.active = true;
            thread.flags |= ThreadFlags::INITIALIZED;
            thread.ticks_left = self.config.idle_quantum;
            thread.last_cpu = Some(cpu_id);
            thread.last_scheduled_at = Some(now);
        }
        self.processor.adopt_current_context(idle);
        cpu.set_current(idle);
        // Released as the idle thread
        self.lock.unlock(cpu_id);

        info!("[SCHED] CPU {} started on idle thread {}", cpu_id, idle);
        Ok(())
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<&CpuInfo> {
        self.cpus.get(cpu)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Thread executing on the calling CPU
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.cpus.get(self.processor.current_cpu())?.current()
    }

    pub(crate) fn cpu_info(&self, cpu: CpuId) -> &CpuInfo {
        match self.cpus.get(cpu) {
            Some(info) => info,
            None => crate::sched_fatal!(
                "CPU {} out of range ({} CPUs configured)",
                cpu,
                self.cpus.len()
            ),
        }
    }

    /// Quantum a thread receives when it is scheduled
    pub fn time_slice_for(&self, thread: &Thread) -> u32 {
        if thread.is_idle() {
            self.config.idle_quantum
        } else {
            self.config.default_quantum
        }
    }

    pub(crate) fn lock_scheduler(&self) -> SchedGuard<'_, P, H> {
        let interrupts_were_enabled = self.processor.interrupts_enabled();
        if interrupts_were_enabled {
            self.processor.disable_interrupts();
        }
        let cpu = self.processor.current_cpu();
        self.cpu_info(cpu).enter_critical();
        self.lock.lock(cpu);
        SchedGuard {
            sched: self,
            cpu,
            interrupts_were_enabled,
        }
    }

    /// Run `f` on the locked state, then the followup it returns
    pub(crate) fn locked<R>(
        &self,
        f: impl FnOnce(&mut SchedState) -> KernelResult<(R, Followup)>,
    ) -> KernelResult<R> {
        let guard = self.lock_scheduler();
        let (value, followup) = f(&mut guard.state())?;
        self.run_followup(followup);
        drop(guard);
        Ok(value)
    }

    pub(crate) fn run_followup(&self, followup: Followup) {
        if followup.wake_idle {
            self.processor.wake_idle_cpus(1);
        }
        if followup.notify_finalizer {
            self.notify_finalizer();
        }
    }

    /// Move `tid` to `new`, keeping the ready queues in step.
    ///
    /// Leaving Runnable unlinks the thread, entering Runnable links it.
    /// Transitions the state machine does not allow are fatal.
    pub(crate) fn set_state_locked(
        &self,
        st: &mut SchedState,
        tid: ThreadId,
        new: ThreadState,
    ) -> Followup {
        let SchedState { threads, ready, .. } = st;
        let Some(thread) = threads.get_mut(tid) else {
            crate::sched_fatal!(
                dump = dump_threads(threads, Level::Error);
                "state change of unknown thread {}", tid
            );
        };
        let old = thread.state;
        if old == new {
            return Followup::default();
        }
        if !old.can_transition_to(new) {
            crate::sched_fatal!(
                dump = dump_threads(threads, Level::Error);
                "illegal state transition {} -> {} for thread {}", old, new, tid
            );
        }
        thread.state = new;
        let is_idle = thread.is_idle();
        let finalizable = thread.is_finalizable();
        trace!("[SCHED] thread {} {} -> {}", tid, old, new);

        if old == ThreadState::Runnable {
            ready.dequeue(threads, tid, None);
        }

        let mut followup = Followup::default();
        match new {
            ThreadState::Runnable => {
                ready.enqueue(threads, tid);
                followup.wake_idle = !is_idle;
            }
            ThreadState::Dying => followup.notify_finalizer = finalizable,
            _ => {}
        }
        followup
    }

    /// Enter a non-preemptible section on the calling CPU. Nests.
    pub fn enter_critical(&self) {
        let _irq = InterruptGuard::new(&self.processor);
        self.cpu_info(self.processor.current_cpu()).enter_critical();
    }

    /// Leave a non-preemptible section.
    ///
    /// Leaving the outermost level outside interrupt context runs a
    /// scheduler pass that was requested meanwhile.
    pub fn leave_critical(&self) {
        let _irq = InterruptGuard::new(&self.processor);
        self.leave_critical_on(self.processor.current_cpu());
    }

    pub(crate) fn leave_critical_on(&self, cpu_id: CpuId) {
        let cpu = self.cpu_info(cpu_id);
        match cpu.leave_critical() {
            None => crate::sched_fatal!("CPU {} left a critical section it never entered", cpu_id),
            Some(0) if !cpu.in_irq() && cpu.is_online() && cpu.take_async_request() => {
                self.invoke_async();
            }
            Some(_) => {}
        }
    }

    /// Leave the section opened by a switch path without running the async
    /// request check.
    pub(crate) fn leave_scoped_critical(&self, cpu_id: CpuId) {
        if self.cpu_info(cpu_id).leave_critical().is_none() {
            crate::sched_fatal!("CPU {} critical section underflow in scheduler", cpu_id);
        }
    }

    /// Interrupt handler entry
    pub fn irq_enter(&self) {
        self.cpu_info(self.processor.current_cpu()).enter_irq();
    }

    /// Interrupt handler exit; the outermost exit runs a pending scheduler pass
    /// unless a critical section is still open.
    pub fn irq_exit(&self) {
        let cpu_id = self.processor.current_cpu();
        let cpu = self.cpu_info(cpu_id);
        match cpu.leave_irq() {
            None => crate::sched_fatal!("CPU {} left an interrupt it never entered", cpu_id),
            Some(0)
                if cpu.critical_depth() == 0 && cpu.is_online() && cpu.take_async_request() =>
            {
                self.invoke_async();
            }
            Some(_) => {}
        }
    }

    /// Log every thread and CPU.
    ///
    /// Never waits for the lock: if another CPU holds it, or the state is
    /// borrowed further up this CPU's stack, the thread list is skipped.
    pub fn dump_thread_list(&self) {
        self.dump_at(Level::Info);
    }

    pub(crate) fn dump_at(&self, level: Level) {
        let cpu = self.processor.current_cpu();
        match self.lock.try_lock(cpu) {
            Some(_) => {
                match self.lock.get(cpu).try_borrow() {
                    Ok(st) => dump_threads(&st.threads, level),
                    Err(_) => log::log!(level, "[SCHED] thread table busy on CPU {}", cpu),
                }
                self.lock.unlock(cpu);
            }
            None => log::log!(level, "[SCHED] scheduler lock held elsewhere, no thread list"),
        }
        dump_cpus(&self.cpus, level);
    }

    /// Dump with the state already borrowed
    pub(crate) fn dump_locked(&self, st: &SchedState, level: Level) {
        dump_threads(&st.threads, level);
        dump_cpus(&self.cpus, level);
    }

    /// Check the ready-queue bookkeeping
    pub fn verify_ready_queues(&self) -> Result<(), &'static str> {
        let guard = self.lock_scheduler();
        let st = guard.state();
        st.ready.verify(&st.threads)
    }
}
