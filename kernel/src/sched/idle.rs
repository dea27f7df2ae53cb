//! Per-CPU idle loop

use super::{hooks::SchedHooks, scheduler::Scheduler};
use crate::arch::Processor;

impl<P: Processor, H: SchedHooks> Scheduler<P, H> {
    /// Run by each CPU's idle thread after [`start`](Self::start).
    pub fn idle_loop(&self) -> ! {
        loop {
            self.idle_iteration();
        }
    }

    /// Halt until the next interrupt, then offer the CPU to real work.
    pub fn idle_iteration(&self) {
        self.processor.wait_for_interrupt();
        self.yield_now();
    }
}
