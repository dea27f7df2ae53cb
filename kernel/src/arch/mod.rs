//! Processor abstraction consumed by the scheduler
//!
//! The scheduler never executes privileged instructions itself. Each
//! architecture port (and the host-side simulator used by the tests)
//! implements [`Processor`] for its cores.

use crate::sched::ThreadId;

/// Logical CPU index, dense from 0.
pub type CpuId = usize;

/// Core abstraction for one machine.
///
/// Every method acts on the CPU executing the call. Implementations must be
/// callable concurrently from all CPUs.
pub trait Processor: Send + Sync {
    /// Index of the executing CPU.
    fn current_cpu(&self) -> CpuId;

    /// Whether interrupts are enabled on the executing CPU.
    fn interrupts_enabled(&self) -> bool;

    fn disable_interrupts(&self);

    fn enable_interrupts(&self);

    /// Halt until the next interrupt arrives.
    fn wait_for_interrupt(&self);

    /// Build the initial register frame of a thread that has never run.
    fn init_context(&self, thread: ThreadId, entry_point: usize, stack_top: usize);

    /// Adopt the executing context (the boot stack) as `thread`.
    fn adopt_current_context(&self, thread: ThreadId);

    /// Save the registers of `from`, load those of `to`.
    ///
    /// Returns on the far side: the code after the call runs as the thread
    /// that was resumed on this core, possibly on a different CPU than the
    /// one that made the call. The value returned is the thread that ran on
    /// the executing CPU immediately before the resumption.
    ///
    /// On hardware a thread that has never run starts from the frame built
    /// by [`init_context`](Self::init_context), and that frame must call
    /// [`Scheduler::leave_on_first_switch`](crate::sched::Scheduler::leave_on_first_switch).
    /// A simulated core may return here on behalf of the incoming thread.
    fn switch_context(&self, from: ThreadId, to: ThreadId) -> ThreadId;

    /// Kick up to `count` idle CPUs so they re-run their scheduler.
    fn wake_idle_cpus(&self, count: usize) {
        let _ = count;
    }
}

/// Interrupts stay disabled while this guard lives.
///
/// The state observed at construction is restored on drop, so guards nest.
pub struct InterruptGuard<'a, P: Processor + ?Sized> {
    processor: &'a P,
    were_enabled: bool,
}

impl<'a, P: Processor + ?Sized> InterruptGuard<'a, P> {
    pub fn new(processor: &'a P) -> Self {
        let were_enabled = processor.interrupts_enabled();
        if were_enabled {
            processor.disable_interrupts();
        }
        Self {
            processor,
            were_enabled,
        }
    }
}

impl<P: Processor + ?Sized> Drop for InterruptGuard<'_, P> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.processor.enable_interrupts();
        }
    }
}
