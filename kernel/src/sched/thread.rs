//! Thread control block (TCB) as seen by the scheduler
//!
//! Thread records live in the scheduler's [`ThreadTable`](super::table::ThreadTable)
//! and are only mutated with the global scheduler lock held. Creation-side
//! collaborators describe a new thread with a [`ThreadSpec`]; everybody else
//! reads scheduling state through [`ThreadSnapshot`].

use alloc::string::String;
use core::fmt;

use bitflags::bitflags;

use super::config::priority_to_bucket;
use crate::arch::CpuId;

/// Generational handle to a thread record.
///
/// A handle outlives its thread: once the record is reclaimed the slot may
/// be reused, but under a new generation, so a stale handle never resolves
/// to the wrong thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    index: u32,
    generation: u32,
}

impl ThreadId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> usize {
        self.index as usize
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a `u64` for storage in an atomic
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// Scheduling state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to run, linked into the ready queues (unless idle)
    Runnable,
    /// Executing on some CPU
    Running,
    /// Waiting on a collaborator-owned primitive
    Blocked,
    /// Suspended until resumed
    Stopped,
    /// Finished; waiting for the finalizer
    Dying,
    /// Reclaimed
    Dead,
}

impl ThreadState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Runnable => "Runnable",
            Self::Running => "Running",
            Self::Blocked => "Blocked",
            Self::Stopped => "Stopped",
            Self::Dying => "Dying",
            Self::Dead => "Dead",
        }
    }

    /// Whether the state machine allows `self -> next`
    pub const fn can_transition_to(self, next: ThreadState) -> bool {
        use ThreadState::*;
        match (self, next) {
            (Dead, _) => false,
            (Dying, Dead) => true,
            (Dying, _) => false,
            (_, Dead) => false,
            (Runnable, Running) => true,
            (_, Running) => false,
            (Running, Runnable | Blocked | Stopped | Dying) => true,
            (Runnable, Blocked | Stopped | Dying) => true,
            (Blocked, Runnable | Stopped | Dying) => true,
            (Stopped, Runnable | Dying) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Scheduling-relevant thread flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The per-CPU idle thread; never linked into the ready queues
        const IDLE = 1 << 0;
        /// Execution context has been built
        const INITIALIZED = 1 << 1;
        /// Stop at the next switch-out instead of becoming runnable
        const SHOULD_STOP = 1 << 2;
        /// Die when the current quantum ends
        const SHOULD_DIE = 1 << 3;
    }
}

/// Bit for `cpu` in a CPU mask; CPUs past the mask width have none.
const fn cpu_bit(cpu: CpuId) -> u64 {
    if cpu < u64::BITS as usize {
        1u64 << cpu
    } else {
        0
    }
}

/// CPU affinity mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet {
    /// Bitmap of allowed CPUs (bit N = CPU N)
    mask: u64,
}

impl CpuSet {
    /// Create new CPU set with all CPUs allowed
    pub const fn all() -> Self {
        Self { mask: !0u64 }
    }

    /// Create new CPU set with single CPU. An out-of-range CPU gives an
    /// empty set.
    pub const fn single(cpu: CpuId) -> Self {
        Self { mask: cpu_bit(cpu) }
    }

    /// Create from raw mask
    pub const fn from_mask(mask: u64) -> Self {
        Self { mask }
    }

    pub const fn mask(&self) -> u64 {
        self.mask
    }

    pub const fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Check if CPU is in set
    pub const fn contains(&self, cpu: CpuId) -> bool {
        self.mask & cpu_bit(cpu) != 0
    }

    /// Whether any of the first `cpu_count` CPUs is allowed
    pub const fn intersects_first(&self, cpu_count: usize) -> bool {
        let usable = if cpu_count >= 64 {
            !0u64
        } else {
            (1u64 << cpu_count) - 1
        };
        self.mask & usable != 0
    }

    /// Add CPU to set; out-of-range CPUs are ignored
    pub fn add(&mut self, cpu: CpuId) {
        self.mask |= cpu_bit(cpu);
    }

    /// Remove CPU from set
    pub fn remove(&mut self, cpu: CpuId) {
        self.mask &= !cpu_bit(cpu);
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Thread statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Number of times scheduled
    pub run_count: u64,
    /// Switched out while no longer running (blocked, stopped, dying)
    pub voluntary_switches: u64,
    /// Switched out while still running
    pub involuntary_switches: u64,
    /// Times this thread was scheduled through a donation
    pub donations_received: u64,
}

/// Intrusive ready-queue linkage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReadyLink {
    pub(crate) prev: Option<ThreadId>,
    pub(crate) next: Option<ThreadId>,
}

/// Everything the creation path decides about a new thread
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    pub name: String,
    pub priority: u32,
    pub affinity: CpuSet,
    pub entry_point: usize,
    pub stack_top: usize,
    /// `Runnable` or `Blocked`
    pub initial_state: ThreadState,
}

impl ThreadSpec {
    pub fn new(name: &str, priority: u32) -> Self {
        Self {
            name: String::from(name),
            priority,
            affinity: CpuSet::all(),
            entry_point: 0,
            stack_top: 0,
            initial_state: ThreadState::Runnable,
        }
    }

    pub fn with_affinity(mut self, affinity: CpuSet) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_entry(mut self, entry_point: usize, stack_top: usize) -> Self {
        self.entry_point = entry_point;
        self.stack_top = stack_top;
        self
    }

    pub fn blocked(mut self) -> Self {
        self.initial_state = ThreadState::Blocked;
        self
    }
}

/// Scheduler view of a thread
pub struct Thread {
    pub(crate) tid: ThreadId,
    pub(crate) name: String,
    pub(crate) state: ThreadState,
    /// Static priority, fixed unless explicitly changed
    pub(crate) priority: u32,
    /// Ready-queue bucket while queued, -1 otherwise
    pub(crate) runnable_priority: i32,
    pub(crate) affinity: CpuSet,
    pub(crate) ticks_left: u32,
    /// Executing on some CPU right now. Unlike `state == Running` this
    /// stays set until the switch away from the thread has completed.
    pub(crate) active: bool,
    pub(crate) flags: ThreadFlags,
    pub(crate) ready_link: ReadyLink,
    pub(crate) entry_point: usize,
    pub(crate) stack_top: usize,
    pub(crate) last_cpu: Option<CpuId>,
    pub(crate) total_scheduled: u64,
    pub(crate) last_scheduled_at: Option<u64>,
    pub(crate) stats: ThreadStats,
}

impl Thread {
    pub(crate) fn new(tid: ThreadId, spec: ThreadSpec) -> Self {
        Self {
            tid,
            name: spec.name,
            state: spec.initial_state,
            priority: spec.priority,
            runnable_priority: -1,
            affinity: spec.affinity,
            ticks_left: 0,
            active: false,
            flags: ThreadFlags::empty(),
            ready_link: ReadyLink::default(),
            entry_point: spec.entry_point,
            stack_top: spec.stack_top,
            last_cpu: None,
            total_scheduled: 0,
            last_scheduled_at: None,
            stats: ThreadStats::default(),
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn affinity(&self) -> CpuSet {
        self.affinity
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Check if thread can run on given CPU
    pub fn can_run_on(&self, cpu: CpuId) -> bool {
        self.affinity.contains(cpu)
    }

    /// Bucket this thread is queued in when runnable
    pub fn bucket(&self) -> usize {
        priority_to_bucket(self.priority)
    }

    pub fn is_queued(&self) -> bool {
        self.runnable_priority >= 0
    }

    /// Dying and no longer executing anywhere
    pub fn is_finalizable(&self) -> bool {
        self.state == ThreadState::Dying && !self.active
    }

    /// Charge scheduled time up to `now`.
    ///
    /// With `no_longer_running` the accounting window closes; otherwise a
    /// new window opens at `now`.
    pub(crate) fn update_time_scheduled(&mut self, now: u64, no_longer_running: bool) {
        if let Some(last) = self.last_scheduled_at {
            if now > last {
                self.total_scheduled += now - last;
            }
        }
        self.last_scheduled_at = if no_longer_running { None } else { Some(now) };
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            tid: self.tid,
            state: self.state,
            priority: self.priority,
            runnable_priority: self.runnable_priority,
            affinity: self.affinity,
            ticks_left: self.ticks_left,
            active: self.active,
            is_idle: self.is_idle(),
            last_cpu: self.last_cpu,
            total_scheduled: self.total_scheduled,
            stats: self.stats,
        }
    }
}

/// Copy of a thread's scheduling state, taken under the scheduler lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub tid: ThreadId,
    pub state: ThreadState,
    pub priority: u32,
    pub runnable_priority: i32,
    pub affinity: CpuSet,
    pub ticks_left: u32,
    pub active: bool,
    pub is_idle: bool,
    pub last_cpu: Option<CpuId>,
    pub total_scheduled: u64,
    pub stats: ThreadStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_raw_packing() {
        let tid = ThreadId::new(7, 3);
        assert_eq!(ThreadId::from_raw(tid.to_raw()), tid);
        assert_eq!(tid.index(), 7);
        assert_eq!(tid.generation(), 3);
    }

    #[test]
    fn test_state_machine_edges() {
        use ThreadState::*;
        assert!(Runnable.can_transition_to(Running));
        assert!(Running.can_transition_to(Runnable));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Blocked));
        assert!(Running.can_transition_to(Dying));
        assert!(Blocked.can_transition_to(Runnable));
        assert!(Dying.can_transition_to(Dead));

        assert!(!Blocked.can_transition_to(Running));
        assert!(!Dying.can_transition_to(Runnable));
        assert!(!Running.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Runnable));
    }

    #[test]
    fn test_cpu_set() {
        let mut set = CpuSet::single(2);
        assert!(set.contains(2));
        assert!(!set.contains(1));
        assert!(!set.contains(64));
        set.add(1);
        assert!(set.contains(1));
        set.remove(2);
        assert_eq!(set.mask(), 0b10);
        assert!(set.intersects_first(2));
        assert!(!CpuSet::single(5).intersects_first(4));
        assert!(CpuSet::from_mask(0).is_empty());
    }

    #[test]
    fn test_cpu_set_ignores_out_of_range_cpus() {
        assert!(CpuSet::single(64).is_empty());
        assert!(CpuSet::single(usize::MAX).is_empty());
        assert!(CpuSet::single(63).contains(63));

        let mut set = CpuSet::single(3);
        set.add(64);
        set.add(200);
        assert_eq!(set.mask(), 1 << 3);
        set.remove(67);
        assert_eq!(set.mask(), 1 << 3);
        assert!(!CpuSet::all().contains(64));
    }

    #[test]
    fn test_time_accounting_windows() {
        let mut thread = Thread::new(ThreadId::new(0, 0), ThreadSpec::new("t", 30));
        thread.update_time_scheduled(100, false);
        assert_eq!(thread.total_scheduled, 0);
        thread.update_time_scheduled(150, false);
        assert_eq!(thread.total_scheduled, 50);
        thread.update_time_scheduled(170, true);
        assert_eq!(thread.total_scheduled, 70);
        assert_eq!(thread.last_scheduled_at, None);
        // Closed window: nothing is charged until it reopens
        thread.update_time_scheduled(500, false);
        assert_eq!(thread.total_scheduled, 70);
    }
}
