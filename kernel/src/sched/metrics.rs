//! Scheduler event counters
//!
//! Counts context switches, scheduling decisions, donations, timer
//! preemption and reclamation. All counters are relaxed atomics; they are
//! statistics, not synchronization.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler metrics
pub struct SchedulerMetrics {
    /// Total number of context switches
    pub context_switches: AtomicU64,
    /// Outgoing thread had already stopped running (blocked, stopped, died)
    pub voluntary_switches: AtomicU64,
    /// Outgoing thread was still running (yield, preemption)
    pub involuntary_switches: AtomicU64,
    /// Number of scheduling decisions made
    pub schedule_calls: AtomicU64,
    /// Number of times an idle thread was picked
    pub idle_scheduled: AtomicU64,
    /// Donations that switched to the beneficiary
    pub donations_honored: AtomicU64,
    /// Donations recorded for a later scheduler run
    pub donations_deferred: AtomicU64,
    /// Donations that degraded to a plain yield
    pub donation_fallbacks: AtomicU64,
    /// Timer ticks that asked for a reschedule
    pub preemption_requests: AtomicU64,
    /// Exhausted quanta renewed because nothing else could run
    pub quantum_renewals: AtomicU64,
    /// Wake-ups sent to the finalizer
    pub finalizer_wakes: AtomicU64,
    /// Thread records reclaimed by the finalizer
    pub threads_reclaimed: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics instance
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            voluntary_switches: AtomicU64::new(0),
            involuntary_switches: AtomicU64::new(0),
            schedule_calls: AtomicU64::new(0),
            idle_scheduled: AtomicU64::new(0),
            donations_honored: AtomicU64::new(0),
            donations_deferred: AtomicU64::new(0),
            donation_fallbacks: AtomicU64::new(0),
            preemption_requests: AtomicU64::new(0),
            quantum_renewals: AtomicU64::new(0),
            finalizer_wakes: AtomicU64::new(0),
            threads_reclaimed: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self, voluntary: bool) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);

        if voluntary {
            self.voluntary_switches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.involuntary_switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_schedule_call(&self) {
        self.schedule_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record idle thread scheduled
    pub fn record_idle_scheduled(&self) {
        self.idle_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_donation(&self) {
        self.donations_honored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_donation_deferred(&self) {
        self.donations_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_donation_fallback(&self) {
        self.donation_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preemption_request(&self) {
        self.preemption_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quantum_renewal(&self) {
        self.quantum_renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finalizer_wake(&self) {
        self.finalizer_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.threads_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get summary of metrics
    pub fn summary(&self) -> MetricsSummary {
        let schedule_calls = self.schedule_calls.load(Ordering::Relaxed);
        let idle_scheduled = self.idle_scheduled.load(Ordering::Relaxed);

        MetricsSummary {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            voluntary_switches: self.voluntary_switches.load(Ordering::Relaxed),
            involuntary_switches: self.involuntary_switches.load(Ordering::Relaxed),
            schedule_calls,
            idle_scheduled,
            idle_percentage: if schedule_calls > 0 {
                (idle_scheduled * 100) / schedule_calls
            } else {
                0
            },
            donations_honored: self.donations_honored.load(Ordering::Relaxed),
            donations_deferred: self.donations_deferred.load(Ordering::Relaxed),
            donation_fallbacks: self.donation_fallbacks.load(Ordering::Relaxed),
            preemption_requests: self.preemption_requests.load(Ordering::Relaxed),
            quantum_renewals: self.quantum_renewals.load(Ordering::Relaxed),
            finalizer_wakes: self.finalizer_wakes.load(Ordering::Relaxed),
            threads_reclaimed: self.threads_reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.context_switches,
            &self.voluntary_switches,
            &self.involuntary_switches,
            &self.schedule_calls,
            &self.idle_scheduled,
            &self.donations_honored,
            &self.donations_deferred,
            &self.donation_fallbacks,
            &self.preemption_requests,
            &self.quantum_renewals,
            &self.finalizer_wakes,
            &self.threads_reclaimed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of scheduler metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub context_switches: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    pub schedule_calls: u64,
    pub idle_scheduled: u64,
    pub idle_percentage: u64,
    pub donations_honored: u64,
    pub donations_deferred: u64,
    pub donation_fallbacks: u64,
    pub preemption_requests: u64,
    pub quantum_renewals: u64,
    pub finalizer_wakes: u64,
    pub threads_reclaimed: u64,
}

/// Log a metrics summary
pub fn log_summary(summary: &MetricsSummary) {
    log::info!("[SCHED] Scheduler Metrics:");
    log::info!(
        "  Context switches: {} (voluntary: {}, involuntary: {})",
        summary.context_switches,
        summary.voluntary_switches,
        summary.involuntary_switches
    );
    log::info!(
        "  Decisions: {} ({}% idle)",
        summary.schedule_calls,
        summary.idle_percentage
    );
    log::info!(
        "  Donations: {} honored, {} deferred, {} fell back",
        summary.donations_honored,
        summary.donations_deferred,
        summary.donation_fallbacks
    );
    log::info!(
        "  Timer: {} preemptions, {} renewals",
        summary.preemption_requests,
        summary.quantum_renewals
    );
    log::info!(
        "  Finalizer: {} wakes, {} reclaimed",
        summary.finalizer_wakes,
        summary.threads_reclaimed
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_split_and_reset() {
        let metrics = SchedulerMetrics::new();
        metrics.record_context_switch(true);
        metrics.record_context_switch(false);
        metrics.record_context_switch(false);
        metrics.record_schedule_call();
        metrics.record_schedule_call();
        metrics.record_idle_scheduled();

        let summary = metrics.summary();
        assert_eq!(summary.context_switches, 3);
        assert_eq!(summary.voluntary_switches, 1);
        assert_eq!(summary.involuntary_switches, 2);
        assert_eq!(summary.idle_percentage, 50);

        metrics.reset();
        assert_eq!(metrics.summary(), MetricsSummary::default());
    }
}
