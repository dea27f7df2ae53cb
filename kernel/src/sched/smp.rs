//! Per-CPU scheduler state
//!
//! Each CPU owns one [`CpuInfo`]. Apart from diagnostics, a slot is only
//! read or written by code running on that CPU with interrupts disabled;
//! the atomics make the type shareable, not contended.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use super::thread::ThreadId;
use crate::arch::CpuId;

const NO_THREAD: u64 = u64::MAX;

/// Donation recorded for the next scheduler run on this CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDonation {
    pub beneficiary: ThreadId,
    pub reason: &'static str,
}

/// CPU information
pub struct CpuInfo {
    /// CPU ID
    pub id: CpuId,
    /// `start()` has run on this CPU
    online: AtomicBool,
    /// Inside `pick_next` or a donation; blocks recursive scheduler entry
    in_scheduler: AtomicBool,
    /// Non-preemptible critical section nesting
    critical_depth: AtomicU32,
    /// Interrupt handler nesting
    irq_depth: AtomicU32,
    /// A scheduler run is owed once the CPU leaves IRQ and critical context
    invoke_async: AtomicBool,
    /// Thread executing on this CPU
    current: AtomicU64,
    /// This CPU's idle thread
    idle: AtomicU64,
    pending_donation: Mutex<Option<PendingDonation>>,
}

fn encode(tid: Option<ThreadId>) -> u64 {
    tid.map_or(NO_THREAD, ThreadId::to_raw)
}

fn decode(raw: u64) -> Option<ThreadId> {
    (raw != NO_THREAD).then(|| ThreadId::from_raw(raw))
}

impl CpuInfo {
    /// Create new CPU info
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            in_scheduler: AtomicBool::new(false),
            critical_depth: AtomicU32::new(0),
            irq_depth: AtomicU32::new(0),
            invoke_async: AtomicBool::new(false),
            current: AtomicU64::new(NO_THREAD),
            idle: AtomicU64::new(NO_THREAD),
            pending_donation: Mutex::new(None),
        }
    }

    /// Mark CPU as online. Returns false if it already was.
    pub(crate) fn bring_online(&self) -> bool {
        !self.online.swap(true, Ordering::AcqRel)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Option<ThreadId> {
        decode(self.current.load(Ordering::Acquire))
    }

    pub(crate) fn set_current(&self, tid: ThreadId) {
        self.current.store(tid.to_raw(), Ordering::Release);
    }

    pub fn idle_thread(&self) -> Option<ThreadId> {
        decode(self.idle.load(Ordering::Acquire))
    }

    pub(crate) fn set_idle_thread(&self, tid: ThreadId) {
        self.idle.store(encode(Some(tid)), Ordering::Release);
    }

    pub fn in_scheduler(&self) -> bool {
        self.in_scheduler.load(Ordering::Relaxed)
    }

    /// Set the reentrancy flag, returning its previous value
    pub(crate) fn swap_in_scheduler(&self, value: bool) -> bool {
        self.in_scheduler.swap(value, Ordering::Relaxed)
    }

    pub(crate) fn set_in_scheduler(&self, value: bool) {
        self.in_scheduler.store(value, Ordering::Relaxed);
    }

    pub fn critical_depth(&self) -> u32 {
        self.critical_depth.load(Ordering::Relaxed)
    }

    /// Returns the new depth
    pub(crate) fn enter_critical(&self) -> u32 {
        self.critical_depth.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the new depth, or `None` if not inside a critical section
    pub(crate) fn leave_critical(&self) -> Option<u32> {
        self.critical_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                depth.checked_sub(1)
            })
            .ok()
            .map(|old| old - 1)
    }

    pub fn irq_depth(&self) -> u32 {
        self.irq_depth.load(Ordering::Relaxed)
    }

    pub fn in_irq(&self) -> bool {
        self.irq_depth() > 0
    }

    pub(crate) fn enter_irq(&self) -> u32 {
        self.irq_depth.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn leave_irq(&self) -> Option<u32> {
        self.irq_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                depth.checked_sub(1)
            })
            .ok()
            .map(|old| old - 1)
    }

    pub fn async_requested(&self) -> bool {
        self.invoke_async.load(Ordering::Relaxed)
    }

    pub(crate) fn request_async(&self) {
        self.invoke_async.store(true, Ordering::Relaxed);
    }

    /// Consume an outstanding async request
    pub(crate) fn take_async_request(&self) -> bool {
        self.invoke_async.swap(false, Ordering::Relaxed)
    }

    pub fn pending_donation(&self) -> Option<PendingDonation> {
        *self.pending_donation.lock()
    }

    /// Record a donation, replacing any earlier one
    pub(crate) fn set_pending_donation(&self, donation: PendingDonation) {
        *self.pending_donation.lock() = Some(donation);
    }

    pub(crate) fn take_pending_donation(&self) -> Option<PendingDonation> {
        self.pending_donation.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_slots_start_empty() {
        let cpu = CpuInfo::new(3);
        assert_eq!(cpu.current(), None);
        assert_eq!(cpu.idle_thread(), None);
        let tid = ThreadId::new(4, 9);
        cpu.set_current(tid);
        cpu.set_idle_thread(tid);
        assert_eq!(cpu.current(), Some(tid));
        assert_eq!(cpu.idle_thread(), Some(tid));
    }

    #[test]
    fn test_nesting_counters_do_not_underflow() {
        let cpu = CpuInfo::new(0);
        assert_eq!(cpu.leave_critical(), None);
        assert_eq!(cpu.enter_critical(), 1);
        assert_eq!(cpu.enter_critical(), 2);
        assert_eq!(cpu.leave_critical(), Some(1));
        assert_eq!(cpu.leave_critical(), Some(0));
        assert_eq!(cpu.leave_irq(), None);
        assert_eq!(cpu.enter_irq(), 1);
        assert!(cpu.in_irq());
    }

    #[test]
    fn test_pending_donation_is_used_once() {
        let cpu = CpuInfo::new(0);
        let donation = PendingDonation {
            beneficiary: ThreadId::new(1, 0),
            reason: "test",
        };
        cpu.set_pending_donation(donation);
        assert_eq!(cpu.pending_donation(), Some(donation));
        assert_eq!(cpu.take_pending_donation(), Some(donation));
        assert_eq!(cpu.take_pending_donation(), None);
    }

    #[test]
    fn test_online_only_once() {
        let cpu = CpuInfo::new(0);
        assert!(cpu.bring_online());
        assert!(!cpu.bring_online());
        assert!(cpu.is_online());
    }
}
