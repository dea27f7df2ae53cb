//! Common test utilities for the Kestrel scheduler integration tests
//!
//! The scheduler reaches hardware only through `Processor` and `SchedHooks`,
//! so the tests drive it with a simulated machine: every host thread plays
//! one CPU (selected with [`run_on`]), and `switch_context` records the
//! switch and returns as if the incoming thread had resumed.

#![allow(dead_code)]

use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex, Once,
    },
};

use kestrel_kernel::{
    arch::{CpuId, Processor},
    sched::{hooks::SchedHooks, thread::Thread},
    SchedConfig, Scheduler, ThreadId,
};
use log::{LevelFilter, Log, Metadata, Record};

pub type SimScheduler = Scheduler<SimProcessor, RecordingHooks>;

thread_local! {
    static EXECUTING_CPU: Cell<CpuId> = const { Cell::new(0) };
}

/// Make the calling host thread act as `cpu`.
pub fn run_on(cpu: CpuId) {
    EXECUTING_CPU.with(|current| current.set(cpu));
}

/// One recorded `switch_context` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub cpu: CpuId,
    pub from: ThreadId,
    pub to: ThreadId,
}

/// Simulated machine with one interrupt flag per CPU
pub struct SimProcessor {
    interrupts: Vec<AtomicBool>,
    running: Mutex<Vec<Option<ThreadId>>>,
    switches: Mutex<Vec<Switch>>,
    initialized: Mutex<Vec<ThreadId>>,
    idle_wakeups: AtomicUsize,
    halts: AtomicUsize,
}

impl SimProcessor {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            interrupts: (0..cpu_count).map(|_| AtomicBool::new(true)).collect(),
            running: Mutex::new(vec![None; cpu_count]),
            switches: Mutex::new(Vec::new()),
            initialized: Mutex::new(Vec::new()),
            idle_wakeups: AtomicUsize::new(0),
            halts: AtomicUsize::new(0),
        }
    }

    pub fn switches(&self) -> Vec<Switch> {
        self.switches.lock().unwrap().clone()
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().unwrap().len()
    }

    /// Threads whose first frame was built, in order
    pub fn initialized(&self) -> Vec<ThreadId> {
        self.initialized.lock().unwrap().clone()
    }

    /// Thread the simulated hardware believes `cpu` is executing
    pub fn running_on(&self, cpu: CpuId) -> Option<ThreadId> {
        self.running.lock().unwrap()[cpu]
    }

    pub fn idle_wakeups(&self) -> usize {
        self.idle_wakeups.load(Ordering::Relaxed)
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::Relaxed)
    }
}

impl Processor for SimProcessor {
    fn current_cpu(&self) -> CpuId {
        EXECUTING_CPU.with(Cell::get)
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts[self.current_cpu()].load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.interrupts[self.current_cpu()].store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.interrupts[self.current_cpu()].store(true, Ordering::SeqCst);
    }

    fn wait_for_interrupt(&self) {
        self.halts.fetch_add(1, Ordering::Relaxed);
    }

    fn init_context(&self, thread: ThreadId, _entry_point: usize, _stack_top: usize) {
        self.initialized.lock().unwrap().push(thread);
    }

    fn adopt_current_context(&self, thread: ThreadId) {
        let cpu = self.current_cpu();
        self.running.lock().unwrap()[cpu] = Some(thread);
    }

    fn switch_context(&self, from: ThreadId, to: ThreadId) -> ThreadId {
        let cpu = self.current_cpu();
        let mut running = self.running.lock().unwrap();
        for (other, thread) in running.iter().enumerate() {
            if other != cpu && *thread == Some(to) {
                panic!(
                    "thread {} switched in on CPU {} while running on CPU {}",
                    to, cpu, other
                );
            }
        }
        running[cpu] = Some(to);
        self.switches.lock().unwrap().push(Switch { cpu, from, to });
        from
    }

    fn wake_idle_cpus(&self, count: usize) {
        self.idle_wakeups.fetch_add(count, Ordering::Relaxed);
    }
}

/// Collaborators that record what the scheduler asked of them
#[derive(Default)]
pub struct RecordingHooks {
    now: AtomicU64,
    signals: Mutex<Vec<ThreadId>>,
    finalizer_wakes: AtomicUsize,
    released: Mutex<Vec<ThreadId>>,
}

impl RecordingHooks {
    pub fn set_time(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }

    /// Threads offered a signal, one entry per switch
    pub fn signals(&self) -> Vec<ThreadId> {
        self.signals.lock().unwrap().clone()
    }

    pub fn finalizer_wakes(&self) -> usize {
        self.finalizer_wakes.load(Ordering::Relaxed)
    }

    /// Threads handed back by the finalizer, in reclaim order
    pub fn released(&self) -> Vec<ThreadId> {
        self.released.lock().unwrap().clone()
    }
}

impl SchedHooks for RecordingHooks {
    fn scheduler_time(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn dispatch_one_pending_signal(&self, thread: ThreadId) -> bool {
        self.signals.lock().unwrap().push(thread);
        false
    }

    fn finalizer_wait(&self) {}

    fn finalizer_wake(&self) {
        self.finalizer_wakes.fetch_add(1, Ordering::Relaxed);
    }

    fn release_thread(&self, thread: &Thread) {
        self.released.lock().unwrap().push(thread.tid());
    }
}

/// Logger keeping every formatted record in memory
struct CapturingLogger {
    records: Mutex<Vec<String>>,
}

impl Log for CapturingLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if let Ok(mut records) = self.records.lock() {
            records.push(format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: CapturingLogger = CapturingLogger {
    records: Mutex::new(Vec::new()),
};
static LOGGER_INIT: Once = Once::new();

/// Install the capturing logger once per test binary.
pub fn init_logger() {
    LOGGER_INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
}

/// Whether any record logged so far contains `needle`
pub fn logged(needle: &str) -> bool {
    LOGGER
        .records
        .lock()
        .map(|records| records.iter().any(|r| r.contains(needle)))
        .unwrap_or(false)
}

/// Scheduler for `cpu_count` CPUs, initialized and started on every CPU.
/// The calling host thread is left on CPU 0.
pub fn boot(cpu_count: usize) -> SimScheduler {
    boot_with(SchedConfig::new(cpu_count))
}

pub fn boot_with(config: SchedConfig) -> SimScheduler {
    init_logger();
    let sched = Scheduler::new(
        SimProcessor::new(config.cpu_count),
        RecordingHooks::default(),
        config,
    )
    .expect("valid scheduler config");
    sched.initialize().expect("scheduler initialization");
    for cpu in 0..config.cpu_count {
        run_on(cpu);
        sched.start().expect("CPU start");
    }
    run_on(0);
    sched
}

/// One timer interrupt on the calling CPU, entry to exit.
pub fn timer_interrupt(sched: &SimScheduler) {
    sched.processor().disable_interrupts();
    sched.irq_enter();
    sched.timer_tick();
    sched.irq_exit();
    sched.processor().enable_interrupts();
}

pub fn ticks(sched: &SimScheduler, count: usize) {
    for _ in 0..count {
        timer_interrupt(sched);
    }
}

/// Thread currently executing on `cpu`
pub fn current_on(sched: &SimScheduler, cpu: CpuId) -> ThreadId {
    sched
        .cpu(cpu)
        .and_then(|info| info.current())
        .expect("started CPU has a current thread")
}

pub fn idle_of(sched: &SimScheduler, cpu: CpuId) -> ThreadId {
    sched
        .cpu(cpu)
        .and_then(|info| info.idle_thread())
        .expect("initialized CPU has an idle thread")
}
