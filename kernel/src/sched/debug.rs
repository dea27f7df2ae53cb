//! Scheduler diagnostics and the fatal-invariant path

use log::Level;

use super::{config::priority_to_bucket, smp::CpuInfo, table::ThreadTable};

/// Halt on a broken scheduler invariant.
///
/// Logs the reason at error level, runs the optional dump expression, then
/// panics. There is no recovery from any of the conditions reported here.
#[macro_export]
macro_rules! sched_fatal {
    (dump = $dump:expr; $($arg:tt)+) => {{
        ::log::error!("[SCHED] FATAL: {}", ::core::format_args!($($arg)+));
        $dump;
        ::core::panic!(
            "scheduler invariant violated: {}",
            ::core::format_args!($($arg)+)
        )
    }};
    ($($arg:tt)+) => {{
        ::log::error!("[SCHED] FATAL: {}", ::core::format_args!($($arg)+));
        ::core::panic!(
            "scheduler invariant violated: {}",
            ::core::format_args!($($arg)+)
        )
    }};
}

/// One line per thread record
pub fn dump_threads(threads: &ThreadTable, level: Level) {
    log::log!(level, "[SCHED] {} threads:", threads.len());
    for thread in threads.iter() {
        let last_cpu = match thread.last_cpu {
            Some(cpu) => cpu as i64,
            None => -1,
        };
        log::log!(
            level,
            "[SCHED]   {:>8} {:<20} {:<8} prio={:>2} bucket={:>2} queued={:>2} active={} cpu={:>2} ticks={} sched={}",
            thread.tid,
            thread.name,
            thread.state.as_str(),
            thread.priority,
            priority_to_bucket(thread.priority),
            thread.runnable_priority,
            thread.active,
            last_cpu,
            thread.ticks_left,
            thread.total_scheduled,
        );
    }
}

/// One line per CPU
pub fn dump_cpus(cpus: &[CpuInfo], level: Level) {
    for cpu in cpus {
        let current = match cpu.current() {
            Some(tid) => tid,
            None => {
                log::log!(level, "[SCHED] CPU {}: not booted", cpu.id);
                continue;
            }
        };
        log::log!(
            level,
            "[SCHED] CPU {}: current={} critical={} irq={} in_scheduler={} async={}",
            cpu.id,
            current,
            cpu.critical_depth(),
            cpu.irq_depth(),
            cpu.in_scheduler(),
            cpu.async_requested(),
        );
    }
}
